use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracerun_core::EngineError;
use tracing::instrument;

use crate::error::AppError;
use crate::state::{AppState, ExecutionParams, TaskSnapshot};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/run", post(run_task))
        .route("/status/:trace_id", get(get_status))
        .route("/result/:trace_id", get(get_result))
        .route("/nodes", get(get_nodes))
        .route("/replay/:trace_id", get(replay_trace))
        .route("/cancel/:trace_id", post(cancel_task))
        .route("/test", post(test_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub task_name: String,
    #[serde(default)]
    pub input_context: Value,
    /// Accepted for wire compatibility; replays go through `/replay/{id}`.
    #[serde(default)]
    pub replay_mode: bool,
    #[serde(default)]
    pub execution_params: ExecutionParamsPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionParamsPayload {
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl From<ExecutionParamsPayload> for ExecutionParams {
    fn from(payload: ExecutionParamsPayload) -> Self {
        Self {
            deadline_ms: payload.deadline_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub trace_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub trace_id: String,
    pub status: crate::state::TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub trace_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct TestResponse {
    pub echo: Value,
    pub status: &'static str,
}

#[instrument(skip_all, fields(task_name = %request.task_name))]
async fn run_task(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Json<RunResponse> {
    if request.replay_mode {
        tracing::debug!("replay_mode flag on /run is ignored; use /replay/{{trace_id}}");
    }
    let service = state.service();
    let trace_id = service.submit(
        request.task_name,
        request.input_context,
        request.execution_params.into(),
    );
    Json(RunResponse {
        trace_id,
        status: "running",
    })
}

async fn get_status(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Json<StatusResponse> {
    let snapshot = state.service().snapshot(&trace_id);
    Json(StatusResponse {
        trace_id: snapshot.trace_id,
        status: snapshot.status,
        error: snapshot.error,
    })
}

async fn get_result(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Json<TaskSnapshot> {
    Json(state.service().snapshot(&trace_id))
}

async fn get_nodes(State(state): State<AppState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: state.service().node_names(),
    })
}

async fn replay_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<RunResponse>, AppError> {
    match state.service().replay(&trace_id) {
        Ok(new_trace_id) => Ok(Json(RunResponse {
            trace_id: new_trace_id,
            status: "running",
        })),
        Err(EngineError::TraceNotFound(id)) => {
            Err(AppError::not_found(format!("trace '{id}' not found")))
        }
        Err(err) => Err(AppError::internal(err)),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.service().cancel(&trace_id);
    Json(CancelResponse {
        trace_id,
        cancelled,
    })
}

async fn test_endpoint(Json(payload): Json<Value>) -> Json<TestResponse> {
    Json(TestResponse {
        echo: payload,
        status: "ok",
    })
}
