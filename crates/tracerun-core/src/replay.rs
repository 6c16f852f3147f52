//! Replay orchestration: reconstruct a run from its stored trace.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::ReplayMode;
use crate::error::EngineError;
use crate::record::ReplayMetadata;
use crate::recorder::TraceReader;
use crate::state::ExecutionState;

/// Everything needed to enqueue a replay run of a stored trace.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub task_name: String,
    pub initial_input: Value,
    /// Stored outputs keyed by node name; empty when re-executing.
    pub replay_map: HashMap<String, Value>,
    /// Node order of the original run.
    pub replay_order: Vec<String>,
    pub replay_info: ReplayMetadata,
}

impl ReplayPlan {
    /// Build the replay run's execution state under a fresh trace id.
    pub fn state(&self, trace_id: impl Into<String>) -> ExecutionState {
        ExecutionState::for_replay(
            self.initial_input.clone(),
            trace_id,
            self.replay_map.clone(),
        )
    }
}

/// Loads stored traces and derives replay plans from them.
pub struct ReplayManager {
    reader: TraceReader,
    mode: ReplayMode,
}

impl ReplayManager {
    pub fn new(reader: TraceReader, mode: ReplayMode) -> Self {
        Self { reader, mode }
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    /// Load `trace_id` and derive a plan for replaying it.
    ///
    /// `requested_by` names the consumer asking for the replay and lands in
    /// the new record's `replay_info.generated_for`.
    pub fn plan(&self, trace_id: &str, requested_by: &str) -> Result<ReplayPlan, EngineError> {
        let source = self.reader.load(trace_id)?;

        let initial_input = source
            .executed_nodes
            .first()
            .map(|entry| entry.input.clone())
            .unwrap_or(Value::Null);

        let replay_map = match self.mode {
            ReplayMode::ShortCircuit => source.replayable_outputs().into_iter().collect(),
            ReplayMode::ReExecute => HashMap::new(),
        };

        let replay_order = source
            .executed_nodes
            .iter()
            .map(|entry| entry.node_name.clone())
            .collect();

        Ok(ReplayPlan {
            task_name: source.task_name.clone(),
            initial_input,
            replay_map,
            replay_order,
            replay_info: ReplayMetadata {
                replay_count: source.replay_info.replay_count + 1,
                source_trace_id: Some(source.trace_id.clone()),
                generated_for: vec![requested_by.to_string()],
            },
        })
    }
}
