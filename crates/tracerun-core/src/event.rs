//! Per-invocation events emitted to trace sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{ExecStatus, NodeExecution};

/// One node invocation as seen by the sinks: the `NodeExecution` fields that
/// matter for observability, plus trace and span identifiers. Sinks never see
/// raw payloads, only content hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub span_id: String,
    pub node_name: String,
    pub version: String,
    pub status: ExecStatus,
    pub timestamp: DateTime<Utc>,
    pub runtime_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl TraceEvent {
    pub fn from_execution(trace_id: &str, tags: &[String], entry: &NodeExecution) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            span_id: Uuid::new_v4().to_string(),
            node_name: entry.node_name.clone(),
            version: entry.version.clone(),
            status: entry.status,
            timestamp: entry.timestamp,
            runtime_ms: entry.runtime_ms,
            input_hash: entry.input_hash.clone(),
            output_hash: entry.output_hash.clone(),
            error_message: entry.error_message.clone(),
            tags: tags.to_vec(),
        }
    }

    /// Pub-stream topic for this event.
    pub fn topic(&self) -> String {
        format!("/svc/{}/{}", self.status, self.node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topic_encodes_status_and_node() {
        let entry = NodeExecution {
            node_name: "retriever".to_string(),
            version: "1.0".to_string(),
            input: json!({}),
            output: None,
            status: ExecStatus::ValidationError,
            runtime_ms: 3,
            timestamp: Utc::now(),
            error_message: Some("bad input".to_string()),
            input_hash: None,
            output_hash: None,
        };
        let event = TraceEvent::from_execution("t1", &[], &entry);
        assert_eq!(event.topic(), "/svc/validation_error/retriever");
        assert!(!event.span_id.is_empty());
    }
}
