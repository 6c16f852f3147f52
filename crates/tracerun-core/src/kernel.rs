//! The DAG kernel: sequential topological execution over a shared per-run
//! state, with deadline, cancellation, and replay-order support.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::event::TraceEvent;
use crate::graph::FlowGraph;
use crate::node::{NodeRegistry, NodeSpec, invoke_node};
use crate::record::{ExecStatus, NodeExecution, TraceRecord};
use crate::recorder::TraceWriter;
use crate::sink::SinkSet;
use crate::state::ExecutionState;

const DEADLINE_MESSAGE: &str = "deadline";
const CANCELLED_MESSAGE: &str = "cancelled";

/// Cooperative cancellation signal. The kernel checks it before invoking the
/// next node; the node already running completes naturally.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run knobs handed to [`Kernel::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Wall-clock budget for the whole run; `None` disables it.
    pub deadline: Option<Duration>,
    pub cancel: CancelFlag,
    /// For replay runs: execute nodes in exactly this order (the original
    /// record's execution order) instead of scheduling topologically.
    pub replay_order: Option<Vec<String>>,
}

/// Terminal status of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed { message: String },
}

impl RunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            RunStatus::Completed => None,
            RunStatus::Failed { message } => Some(message),
        }
    }
}

/// Everything a caller needs after a run: outcome, final outputs, and the
/// finalized trace record.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub trace_id: String,
    pub status: RunStatus,
    pub dag_output: Value,
    pub record: TraceRecord,
}

/// Executes graphs sequentially within a run. Each run owns its
/// `ExecutionState` and `TraceWriter`; the kernel itself is shareable across
/// concurrent runs.
pub struct Kernel {
    registry: Arc<NodeRegistry>,
    sinks: SinkSet,
}

impl Kernel {
    pub fn new(registry: Arc<NodeRegistry>, sinks: SinkSet) -> Self {
        Self { registry, sinks }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Run `graph` to completion over `state`. The writer must already hold
    /// the run's open trace, and `state.trace_id` must match it. The trace
    /// is finalized on every path out of this function.
    pub async fn run(
        &self,
        graph: &FlowGraph,
        mut state: ExecutionState,
        writer: &mut TraceWriter,
        options: RunOptions,
    ) -> Result<RunReport, EngineError> {
        debug_assert_eq!(writer.current_trace_id(), Some(state.trace_id.as_str()));
        info!(
            graph = graph.name(),
            trace_id = %state.trace_id,
            replay = state.is_replay,
            "run started"
        );

        let deadline_at = options.deadline.map(|budget| Instant::now() + budget);
        let outcome = match &options.replay_order {
            Some(order) => {
                self.drive(graph, &mut state, writer, &options, deadline_at, order.clone())
                    .await?
            }
            None => {
                let order = Plan::new(graph, &self.registry);
                self.drive_scheduled(graph, &mut state, writer, &options, deadline_at, order)
                    .await?
            }
        };

        let record = writer.finalize()?;
        let dag_output = state.node_outputs.to_value();
        match &outcome {
            RunStatus::Completed => {
                info!(trace_id = %state.trace_id, nodes = record.executed_nodes.len(), "run completed")
            }
            RunStatus::Failed { message } => {
                warn!(trace_id = %state.trace_id, error = %message, "run failed")
            }
        }

        Ok(RunReport {
            trace_id: state.trace_id.clone(),
            status: outcome,
            dag_output,
            record,
        })
    }

    /// Replay path: fixed node order taken from the original record.
    async fn drive(
        &self,
        graph: &FlowGraph,
        state: &mut ExecutionState,
        writer: &mut TraceWriter,
        options: &RunOptions,
        deadline_at: Option<Instant>,
        order: Vec<String>,
    ) -> Result<RunStatus, EngineError> {
        for name in order {
            if !graph.contains(&name) {
                warn!(node = %name, graph = graph.name(), "recorded node absent from graph; skipping");
                continue;
            }
            if options.cancel.is_cancelled() {
                return Ok(RunStatus::Failed {
                    message: CANCELLED_MESSAGE.to_string(),
                });
            }
            let spec = self
                .registry
                .get(&name)
                .ok_or_else(|| EngineError::UnknownNode(name.clone()))?;
            let (status, message) = self
                .invoke_with_deadline(&spec, state, writer, deadline_at)
                .await?;
            if !status.is_ok() {
                return Ok(RunStatus::Failed { message });
            }
        }
        Ok(RunStatus::Completed)
    }

    /// Live path: Kahn's algorithm, ready ties broken by registration order,
    /// router edges re-evaluated after each node.
    async fn drive_scheduled(
        &self,
        graph: &FlowGraph,
        state: &mut ExecutionState,
        writer: &mut TraceWriter,
        options: &RunOptions,
        deadline_at: Option<Instant>,
        mut plan: Plan,
    ) -> Result<RunStatus, EngineError> {
        plan.mark_ready(graph.entry());

        while let Some(name) = plan.next_ready() {
            if options.cancel.is_cancelled() {
                return Ok(RunStatus::Failed {
                    message: CANCELLED_MESSAGE.to_string(),
                });
            }
            let spec = self
                .registry
                .get(&name)
                .ok_or_else(|| EngineError::UnknownNode(name.clone()))?;
            let (status, message) = self
                .invoke_with_deadline(&spec, state, writer, deadline_at)
                .await?;
            if !status.is_ok() {
                return Ok(RunStatus::Failed { message });
            }

            // Routers narrow the frontier to the chosen branch; plain edges
            // release every successor.
            match graph.router(&name) {
                Some(router) => match router.route(state) {
                    Some(successor) => plan.release(graph, successor),
                    None => {
                        let message =
                            format!("router after '{name}' produced an undeclared outcome");
                        return Ok(RunStatus::Failed { message });
                    }
                },
                None => {
                    for successor in graph.successors(&name) {
                        plan.release(graph, successor);
                    }
                }
            }
        }

        Ok(RunStatus::Completed)
    }

    /// Invoke one node, bounded by the run deadline when one is set. On
    /// expiry the in-flight invocation is dropped and the node is recorded
    /// as a failure with the literal "deadline" message.
    async fn invoke_with_deadline(
        &self,
        spec: &NodeSpec,
        state: &mut ExecutionState,
        writer: &mut TraceWriter,
        deadline_at: Option<Instant>,
    ) -> Result<(ExecStatus, String), EngineError> {
        let outcome = match deadline_at {
            Some(at) => {
                let timed = timeout_at(at, invoke_node(spec, state, writer, &self.sinks)).await;
                timed.ok()
            }
            None => Some(invoke_node(spec, state, writer, &self.sinks).await),
        };

        let Some(result) = outcome else {
            let entry = NodeExecution {
                node_name: spec.name.clone(),
                version: spec.version.clone(),
                input: Value::Null,
                output: None,
                status: ExecStatus::Failure,
                runtime_ms: 0,
                timestamp: Utc::now(),
                error_message: Some(DEADLINE_MESSAGE.to_string()),
                input_hash: None,
                output_hash: None,
            };
            let event = TraceEvent::from_execution(&state.trace_id, &spec.tags, &entry);
            writer.record_node(entry)?;
            self.sinks.emit(&event);
            return Ok((ExecStatus::Failure, DEADLINE_MESSAGE.to_string()));
        };

        let report = result?;
        let message = report.error_message.unwrap_or_default();
        Ok((report.status, message))
    }
}

/// Ready-queue bookkeeping for the live scheduling path.
struct Plan {
    in_degree: HashMap<String, usize>,
    ready: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Plan {
    fn new(graph: &FlowGraph, registry: &NodeRegistry) -> Self {
        let positions = graph
            .nodes()
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    registry.position(name).unwrap_or(usize::MAX),
                )
            })
            .collect();
        Self {
            in_degree: graph.in_degrees(),
            ready: Vec::new(),
            positions,
        }
    }

    fn mark_ready(&mut self, name: &str) {
        if !self.ready.iter().any(|existing| existing == name) {
            self.ready.push(name.to_string());
        }
    }

    fn release(&mut self, graph: &FlowGraph, name: &str) {
        if let Some(degree) = self.in_degree.get_mut(name) {
            *degree = degree.saturating_sub(1);
            if *degree == 0 && graph.contains(name) {
                self.mark_ready(name);
            }
        }
    }

    /// Pop the ready node that was registered earliest; deterministic across
    /// runs, which replay depends on.
    fn next_ready(&mut self) -> Option<String> {
        if self.ready.is_empty() {
            return None;
        }
        let mut best = 0;
        for idx in 1..self.ready.len() {
            let a = self.positions.get(&self.ready[idx]).copied().unwrap_or(usize::MAX);
            let b = self.positions.get(&self.ready[best]).copied().unwrap_or(usize::MAX);
            if a < b {
                best = idx;
            }
        }
        Some(self.ready.swap_remove(best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::node::{InputSource, NodeHandler, NodeSpec};
    use crate::recorder::TraceStore;
    use crate::schema::{FieldType, Schema};
    use async_trait::async_trait;
    use serde_json::json;

    struct Tag(&'static str);

    #[async_trait]
    impl NodeHandler for Tag {
        async fn call(&self, _input: Value) -> anyhow::Result<Value> {
            Ok(json!({"tag": self.0}))
        }
    }

    struct Slow;

    #[async_trait]
    impl NodeHandler for Slow {
        async fn call(&self, _input: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    fn writer_in(dir: &tempfile::TempDir) -> TraceWriter {
        TraceWriter::new(TraceStore::new(dir.path(), false), true)
    }

    fn diamond_setup() -> (Arc<NodeRegistry>, FlowGraph) {
        let registry = Arc::new(NodeRegistry::new());
        // Registered in an order that differs from the alphabetical one so
        // the tie-break is observable: both "right" and "left" become ready
        // after "top"; "right" registered first must win.
        for (name, source) in [
            ("top", InputSource::Entry),
            ("right", InputSource::Upstream("top".to_string())),
            ("left", InputSource::Upstream("top".to_string())),
            (
                "bottom",
                InputSource::Join(vec!["left".to_string(), "right".to_string()]),
            ),
        ] {
            let mut spec = NodeSpec::new(name, "1.0", Arc::new(Tag(name)));
            spec.input_source = source;
            registry.register(spec).unwrap();
        }
        let graph = GraphBuilder::new("diamond")
            .add_node("top")
            .add_node("left")
            .add_node("right")
            .add_node("bottom")
            .add_edge("top", "left")
            .add_edge("top", "right")
            .add_edge("left", "bottom")
            .add_edge("right", "bottom")
            .set_entry("top")
            .build(&registry)
            .unwrap();
        (registry, graph)
    }

    #[tokio::test]
    async fn diamond_runs_in_registration_order() {
        let (registry, graph) = diamond_setup();
        let kernel = Kernel::new(registry, SinkSet::empty());
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        let trace_id = writer.init_trace("diamond", None).unwrap();
        let state = ExecutionState::new(json!({}), trace_id);

        let report = kernel
            .run(&graph, state, &mut writer, RunOptions::default())
            .await
            .unwrap();
        assert!(report.status.is_completed());

        let order: Vec<&str> = report
            .record
            .executed_nodes
            .iter()
            .map(|entry| entry.node_name.as_str())
            .collect();
        assert_eq!(order, vec!["top", "right", "left", "bottom"]);

        // The join node sees both upstream outputs keyed by producer.
        let bottom_input = &report.record.executed_nodes[3].input;
        assert_eq!(bottom_input["left"]["tag"], "left");
        assert_eq!(bottom_input["right"]["tag"], "right");
    }

    #[tokio::test]
    async fn router_skips_the_unchosen_branch() {
        let registry = Arc::new(NodeRegistry::new());
        for (name, source) in [
            ("gate", InputSource::Entry),
            ("accept", InputSource::Upstream("gate".to_string())),
            ("reject", InputSource::Upstream("gate".to_string())),
        ] {
            let mut spec = NodeSpec::new(name, "1.0", Arc::new(Tag(name)));
            spec.input_source = source;
            registry.register(spec).unwrap();
        }
        let graph = GraphBuilder::new("gated")
            .add_node("gate")
            .add_node("accept")
            .add_node("reject")
            .add_router(
                "gate",
                |state| {
                    if state.node_outputs.contains("gate") {
                        "ok".to_string()
                    } else {
                        "no".to_string()
                    }
                },
                [("ok", "accept"), ("no", "reject")],
            )
            .set_entry("gate")
            .build(&registry)
            .unwrap();

        let kernel = Kernel::new(registry, SinkSet::empty());
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        let trace_id = writer.init_trace("gated", None).unwrap();
        let state = ExecutionState::new(json!({}), trace_id);

        let report = kernel
            .run(&graph, state, &mut writer, RunOptions::default())
            .await
            .unwrap();
        assert!(report.status.is_completed());
        let names: Vec<&str> = report
            .record
            .executed_nodes
            .iter()
            .map(|entry| entry.node_name.as_str())
            .collect();
        assert_eq!(names, vec!["gate", "accept"]);
        assert!(report.dag_output.get("reject").is_none());
    }

    #[tokio::test]
    async fn failing_node_aborts_but_finalizes() {
        let registry = Arc::new(NodeRegistry::new());
        let strict_input = Schema::input().field("must_exist", FieldType::String);
        let mut first = NodeSpec::new("first", "1.0", Arc::new(Tag("first")));
        first.input_schema = strict_input;
        registry.register(first).unwrap();
        let mut second = NodeSpec::new("second", "1.0", Arc::new(Tag("second")));
        second.input_source = InputSource::Upstream("first".to_string());
        registry.register(second).unwrap();

        let graph = GraphBuilder::new("aborting")
            .add_node("first")
            .add_node("second")
            .add_edge("first", "second")
            .set_entry("first")
            .build(&registry)
            .unwrap();

        let kernel = Kernel::new(registry, SinkSet::empty());
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        let trace_id = writer.init_trace("aborting", None).unwrap();
        let state = ExecutionState::new(json!({"wrong": true}), trace_id);

        let report = kernel
            .run(&graph, state, &mut writer, RunOptions::default())
            .await
            .unwrap();
        assert!(!report.status.is_completed());
        assert_eq!(report.record.executed_nodes.len(), 1);
        assert_eq!(
            report.record.executed_nodes[0].status,
            ExecStatus::ValidationError
        );
        assert!(report.record.is_finalized());
    }

    #[tokio::test]
    async fn deadline_fails_the_current_node() {
        let registry = Arc::new(NodeRegistry::new());
        registry
            .register(NodeSpec::new("slow", "1.0", Arc::new(Slow)))
            .unwrap();
        let graph = GraphBuilder::new("slow")
            .add_node("slow")
            .set_entry("slow")
            .build(&registry)
            .unwrap();

        let kernel = Kernel::new(registry, SinkSet::empty());
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        let trace_id = writer.init_trace("slow", None).unwrap();
        let state = ExecutionState::new(json!({}), trace_id);

        let options = RunOptions {
            deadline: Some(Duration::from_millis(20)),
            ..RunOptions::default()
        };
        let report = kernel.run(&graph, state, &mut writer, options).await.unwrap();
        assert_eq!(report.status.error_message(), Some("deadline"));
        assert_eq!(
            report.record.executed_nodes[0].error_message.as_deref(),
            Some("deadline")
        );
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_node() {
        let (registry, graph) = diamond_setup();
        let kernel = Kernel::new(registry, SinkSet::empty());
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer_in(&dir);
        let trace_id = writer.init_trace("diamond", None).unwrap();
        let state = ExecutionState::new(json!({}), trace_id);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = RunOptions {
            cancel,
            ..RunOptions::default()
        };
        let report = kernel.run(&graph, state, &mut writer, options).await.unwrap();
        assert_eq!(report.status.error_message(), Some("cancelled"));
        assert!(report.record.executed_nodes.is_empty());
        assert!(report.record.is_finalized());
    }
}
