//! Trace data model: per-node execution entries and whole-run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single wrapped node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Success,
    Failure,
    ValidationError,
    SkippedReplay,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Success => "success",
            ExecStatus::Failure => "failure",
            ExecStatus::ValidationError => "validation_error",
            ExecStatus::SkippedReplay => "skipped_replay",
        }
    }

    /// Whether the run may continue past a node with this status.
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecStatus::Success | ExecStatus::SkippedReplay)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one node invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_name: String,
    pub version: String,
    pub input: Value,
    pub output: Option<Value>,
    pub status: ExecStatus,
    pub runtime_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
}

/// Replay lineage carried by every record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayMetadata {
    pub replay_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_for: Vec<String>,
}

/// Complete recorded history of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: String,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_nodes: Vec<NodeExecution>,
    #[serde(default)]
    pub replay_info: ReplayMetadata,
}

impl TraceRecord {
    pub fn new(trace_id: impl Into<String>, task_name: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            task_name: task_name.into(),
            start_time: Utc::now(),
            end_time: None,
            executed_nodes: Vec::new(),
            replay_info: ReplayMetadata::default(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }

    /// Stored output of `node_name`, if the run produced one.
    pub fn output_of(&self, node_name: &str) -> Option<&Value> {
        self.executed_nodes
            .iter()
            .rev()
            .find(|entry| entry.node_name == node_name)
            .and_then(|entry| entry.output.as_ref())
    }

    /// Outputs of every node that finished (or was short-circuited), keyed by
    /// node name; the seed for a replay map.
    pub fn replayable_outputs(&self) -> Vec<(String, Value)> {
        self.executed_nodes
            .iter()
            .filter(|entry| entry.status.is_ok())
            .filter_map(|entry| {
                entry
                    .output
                    .clone()
                    .map(|output| (entry.node_name.clone(), output))
            })
            .collect()
    }
}
