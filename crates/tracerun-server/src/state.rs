use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracerun_core::{
    CancelFlag, EchoGenerator, EngineError, ExecutionState, FlowGraph, Kernel, NodeRegistry,
    ReplayManager, ReplayMode, RunOptions, RunStatus, SinkSet, TraceReader, TraceStore,
    TraceWriter, default_graph, install_default_nodes,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    service: Arc<RunService>,
}

impl AppState {
    pub fn try_new(config: &AppConfig) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new());
        install_default_nodes(&registry, Arc::new(EchoGenerator))?;
        let service = RunService::new(registry, config)?;
        Ok(Self {
            service: Arc::new(service),
        })
    }

    pub fn service(&self) -> Arc<RunService> {
        self.service.clone()
    }
}

/// Per-run knobs accepted with a submission.
#[derive(Debug, Clone, Default)]
pub struct ExecutionParams {
    pub deadline_ms: Option<u64>,
}

/// In-memory record of one run. Lives only in the task table; durable
/// history is the trace store.
enum TaskEntry {
    Running { cancel: CancelFlag },
    Completed { dag_output: Value },
    Failed { error: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
    Unknown,
}

/// Snapshot returned by the status/result endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub trace_id: String,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dag_output: Option<Value>,
}

/// Dispatches runs to a bounded worker pool and tracks them in the
/// process-wide task table.
pub struct RunService {
    kernel: Arc<Kernel>,
    graphs: HashMap<String, Arc<FlowGraph>>,
    store: TraceStore,
    sinks: SinkSet,
    permits: Arc<Semaphore>,
    tasks: Arc<DashMap<String, TaskEntry>>,
    deadline: Option<Duration>,
    capture_io: bool,
    replay_mode: ReplayMode,
}

impl RunService {
    pub fn new(registry: Arc<NodeRegistry>, config: &AppConfig) -> Result<Self> {
        let sinks = SinkSet::from_config(&config.tracing);
        let kernel = Arc::new(Kernel::new(registry.clone(), sinks.clone()));

        let mut graphs = HashMap::new();
        let graph = default_graph(&registry)?;
        graphs.insert(graph.name().to_string(), Arc::new(graph));

        let deadline = (config.deadline_ms > 0).then(|| Duration::from_millis(config.deadline_ms));

        Ok(Self {
            kernel,
            graphs,
            store: TraceStore::new(config.trace_dir.clone(), config.sqlite_records),
            sinks,
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            tasks: Arc::new(DashMap::new()),
            deadline,
            capture_io: config.capture_io,
            replay_mode: config.replay_mode,
        })
    }

    pub fn node_names(&self) -> Vec<String> {
        self.kernel.registry().names()
    }

    /// Accept a task, dispatch it to a background worker, and return its
    /// fresh trace id immediately.
    pub fn submit(
        self: &Arc<Self>,
        task_name: String,
        input_context: Value,
        params: ExecutionParams,
    ) -> String {
        let trace_id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        self.tasks.insert(
            trace_id.clone(),
            TaskEntry::Running {
                cancel: cancel.clone(),
            },
        );

        let service = self.clone();
        let worker_trace_id = trace_id.clone();
        tokio::spawn(async move {
            service
                .execute(worker_trace_id, task_name, input_context, params, cancel, None)
                .await;
        });

        trace_id
    }

    /// Look up a stored trace and enqueue a replay run of it under a new id.
    pub fn replay(self: &Arc<Self>, source_trace_id: &str) -> Result<String, EngineError> {
        let manager = ReplayManager::new(TraceReader::new(self.store.clone()), self.replay_mode);
        let plan = manager.plan(source_trace_id, "control-plane")?;

        let trace_id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        self.tasks.insert(
            trace_id.clone(),
            TaskEntry::Running {
                cancel: cancel.clone(),
            },
        );

        let service = self.clone();
        let worker_trace_id = trace_id.clone();
        tokio::spawn(async move {
            let task_name = plan.task_name.clone();
            let input = plan.initial_input.clone();
            service
                .execute(
                    worker_trace_id,
                    task_name,
                    input,
                    ExecutionParams::default(),
                    cancel,
                    Some(plan),
                )
                .await;
        });

        Ok(trace_id)
    }

    async fn execute(
        &self,
        trace_id: String,
        task_name: String,
        input_context: Value,
        params: ExecutionParams,
        cancel: CancelFlag,
        replay: Option<tracerun_core::ReplayPlan>,
    ) {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                self.tasks.insert(
                    trace_id,
                    TaskEntry::Failed {
                        error: format!("worker pool unavailable: {err}"),
                    },
                );
                return;
            }
        };

        let mut writer = TraceWriter::new(self.store.clone(), self.capture_io);
        if let Err(err) = writer.init_trace(&task_name, Some(trace_id.clone())) {
            self.fail(&trace_id, err.to_string());
            return;
        }

        let graph = match self.graphs.get(&task_name) {
            Some(graph) => graph.clone(),
            None => {
                // Finalize the empty trace so the failure is durable too.
                if let Err(err) = writer.finalize() {
                    warn!(trace_id = %trace_id, error = %err, "failed to finalize trace");
                }
                self.fail(&trace_id, format!("task '{task_name}' not found"));
                return;
            }
        };

        let mut options = RunOptions {
            deadline: params
                .deadline_ms
                .map(Duration::from_millis)
                .or(self.deadline),
            cancel,
            replay_order: None,
        };

        let state = match &replay {
            Some(plan) => {
                if let Err(err) = writer.set_replay_info(plan.replay_info.clone()) {
                    self.fail(&trace_id, err.to_string());
                    return;
                }
                if !plan.replay_map.is_empty() {
                    options.replay_order = Some(plan.replay_order.clone());
                }
                plan.state(trace_id.clone())
            }
            None => ExecutionState::new(input_context, trace_id.clone()),
        };

        let outcome = self.kernel.run(&graph, state, &mut writer, options).await;
        drop(permit);

        match outcome {
            Ok(report) => match report.status {
                RunStatus::Completed => {
                    info!(trace_id = %trace_id, "run completed");
                    self.tasks.insert(
                        trace_id,
                        TaskEntry::Completed {
                            dag_output: report.dag_output,
                        },
                    );
                }
                RunStatus::Failed { message } => {
                    self.fail(&trace_id, message);
                }
            },
            Err(err) => {
                error!(trace_id = %trace_id, error = %err, "run errored");
                self.fail(&trace_id, err.to_string());
            }
        }
    }

    fn fail(&self, trace_id: &str, error: String) {
        warn!(trace_id = %trace_id, error = %error, "run failed");
        self.tasks
            .insert(trace_id.to_string(), TaskEntry::Failed { error });
    }

    /// Uniform lookup: unknown ids report `unknown`, never an HTTP error, so
    /// clients can poll without special-casing.
    pub fn snapshot(&self, trace_id: &str) -> TaskSnapshot {
        match self.tasks.get(trace_id) {
            Some(entry) => match entry.value() {
                TaskEntry::Running { .. } => TaskSnapshot {
                    trace_id: trace_id.to_string(),
                    status: TaskState::Running,
                    error: None,
                    dag_output: None,
                },
                TaskEntry::Completed { dag_output } => TaskSnapshot {
                    trace_id: trace_id.to_string(),
                    status: TaskState::Completed,
                    error: None,
                    dag_output: Some(dag_output.clone()),
                },
                TaskEntry::Failed { error } => TaskSnapshot {
                    trace_id: trace_id.to_string(),
                    status: TaskState::Failed,
                    error: Some(error.clone()),
                    dag_output: None,
                },
            },
            None => TaskSnapshot {
                trace_id: trace_id.to_string(),
                status: TaskState::Unknown,
                error: None,
                dag_output: None,
            },
        }
    }

    /// Signal a running task to stop before its next node. Returns whether a
    /// running task was found.
    pub fn cancel(&self, trace_id: &str) -> bool {
        match self.tasks.get(trace_id) {
            Some(entry) => match entry.value() {
                TaskEntry::Running { cancel } => {
                    cancel.cancel();
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Drain and close every sink; called once at shutdown.
    pub fn close_sinks(&self) {
        self.sinks.close();
    }
}
