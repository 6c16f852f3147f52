//! Node registry and the wrapped invocation contract.
//!
//! Every node invocation goes through [`invoke_node`], which enforces the
//! same ordered steps regardless of what the node body does: replay
//! short-circuit, input resolution, schema validation, trace-id injection,
//! content hashing, timing, metadata attachment, and trace emission.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::canonical::content_hash;
use crate::error::EngineError;
use crate::event::TraceEvent;
use crate::record::{ExecStatus, NodeExecution};
use crate::recorder::TraceWriter;
use crate::schema::{CONTEXT_TAGS_FIELD, EXECUTION_TIMESTAMP_FIELD, NODE_META_FIELD, NodeMeta, Schema, TRACE_ID_FIELD};
use crate::sink::SinkSet;
use crate::state::ExecutionState;

/// A unit of computation. The kernel does not distinguish LLM-backed nodes
/// from pure functions; both are `input value -> output value`.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

/// Where the wrapper resolves a node's raw input from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// The run's submitted payload.
    Entry,
    /// The most recent output of a single upstream producer.
    Upstream(String),
    /// Outputs of several upstreams, concatenated as `{upstream: output}`.
    Join(Vec<String>),
}

/// Registration record for one named, versioned node. Immutable once
/// registered.
pub struct NodeSpec {
    pub name: String,
    pub version: String,
    pub tags: Vec<String>,
    pub input_schema: Schema,
    pub output_schema: Schema,
    pub input_source: InputSource,
    handler: Arc<dyn NodeHandler>,
}

impl NodeSpec {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tags: Vec::new(),
            input_schema: Schema::input(),
            output_schema: Schema::output(),
            input_source: InputSource::Entry,
            handler,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.tags.sort();
        self.tags.dedup();
        self
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.input_source = InputSource::Upstream(upstream.into());
        self
    }

    pub fn with_join(mut self, upstreams: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.input_source = InputSource::Join(upstreams.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Default)]
struct RegistryInner {
    specs: HashMap<String, Arc<NodeSpec>>,
    order: Vec<String>,
}

/// Holds the process's node implementations by unique name.
///
/// Read-mostly after startup: lookups take the shared lock, registration the
/// exclusive one.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: NodeSpec) -> Result<(), EngineError> {
        if spec.name.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "node name must not be empty".into(),
            ));
        }
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        if inner.specs.contains_key(&spec.name) {
            return Err(EngineError::AlreadyRegistered(spec.name));
        }
        debug!(node = %spec.name, version = %spec.version, "node registered");
        inner.order.push(spec.name.clone());
        inner.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeSpec>> {
        self.inner
            .read()
            .expect("node registry lock poisoned")
            .specs
            .get(name)
            .cloned()
    }

    /// Node names in registration order; the kernel's scheduling tie-break.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("node registry lock poisoned")
            .order
            .clone()
    }

    /// Position of `name` in registration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.inner
            .read()
            .expect("node registry lock poisoned")
            .order
            .iter()
            .position(|existing| existing == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("node registry lock poisoned")
            .specs
            .contains_key(name)
    }
}

/// What the wrapper reports back to the kernel for one invocation.
#[derive(Debug, Clone)]
pub struct InvokeReport {
    pub node_name: String,
    pub status: ExecStatus,
    pub error_message: Option<String>,
}

impl InvokeReport {
    fn new(node_name: &str, status: ExecStatus, error_message: Option<String>) -> Self {
        Self {
            node_name: node_name.to_string(),
            status,
            error_message,
        }
    }
}

/// Run one node through the full wrapper contract, recording the outcome in
/// the trace writer and emitting an event to every sink.
///
/// Returns `Err` only for recorder faults; node-level problems (validation,
/// missing upstream, body failure) come back as a non-ok [`InvokeReport`]
/// with the failing entry already recorded.
pub async fn invoke_node(
    spec: &NodeSpec,
    state: &mut ExecutionState,
    writer: &mut TraceWriter,
    sinks: &SinkSet,
) -> Result<InvokeReport, EngineError> {
    let capture = writer.capture_io();

    // Replay short-circuit: emit the stored output without calling the body.
    if state.is_replay
        && let Some(stored) = state.replay_map.get(&spec.name).cloned()
    {
        debug!(node = %spec.name, trace_id = %state.trace_id, "replay short-circuit");
        let entry = NodeExecution {
            node_name: spec.name.clone(),
            version: spec.version.clone(),
            input: Value::Null,
            output: Some(stored.clone()),
            status: ExecStatus::SkippedReplay,
            runtime_ms: 0,
            timestamp: Utc::now(),
            error_message: None,
            input_hash: None,
            output_hash: capture.then(|| content_hash(&stored)),
        };
        emit(spec, state, writer, sinks, entry)?;
        state.node_outputs.insert(spec.name.clone(), stored);
        return Ok(InvokeReport::new(&spec.name, ExecStatus::SkippedReplay, None));
    }

    // Resolve the raw input before validation.
    let mut input = match resolve_input(spec, state) {
        Ok(input) => input,
        Err(message) => {
            let entry = NodeExecution {
                node_name: spec.name.clone(),
                version: spec.version.clone(),
                input: Value::Null,
                output: None,
                status: ExecStatus::Failure,
                runtime_ms: 0,
                timestamp: Utc::now(),
                error_message: Some(message.clone()),
                input_hash: None,
                output_hash: None,
            };
            emit(spec, state, writer, sinks, entry)?;
            return Ok(InvokeReport::new(&spec.name, ExecStatus::Failure, Some(message)));
        }
    };

    if let Err(violation) = spec.input_schema.validate(&input) {
        let message = format!("input rejected: {violation}");
        warn!(node = %spec.name, trace_id = %state.trace_id, %violation, "input validation failed");
        let entry = NodeExecution {
            node_name: spec.name.clone(),
            version: spec.version.clone(),
            input,
            output: None,
            status: ExecStatus::ValidationError,
            runtime_ms: 0,
            timestamp: Utc::now(),
            error_message: Some(message.clone()),
            input_hash: None,
            output_hash: None,
        };
        emit(spec, state, writer, sinks, entry)?;
        return Ok(InvokeReport::new(&spec.name, ExecStatus::ValidationError, Some(message)));
    }

    // Validation guarantees an object; stamp the run's trace id onto it.
    if let Some(map) = input.as_object_mut() {
        map.insert(TRACE_ID_FIELD.to_string(), json!(state.trace_id));
        map.entry(CONTEXT_TAGS_FIELD.to_string())
            .or_insert_with(|| json!([]));
    }

    let input_hash = capture.then(|| content_hash(&input));

    let started = Instant::now();
    let body_result = spec.handler.call(input.clone()).await;
    let runtime_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

    let raw_output = match body_result {
        Ok(output) => output,
        Err(err) => {
            let message = err.to_string();
            warn!(node = %spec.name, trace_id = %state.trace_id, error = %message, "node body failed");
            let entry = NodeExecution {
                node_name: spec.name.clone(),
                version: spec.version.clone(),
                input,
                output: None,
                status: ExecStatus::Failure,
                runtime_ms,
                timestamp: Utc::now(),
                error_message: Some(message.clone()),
                input_hash,
                output_hash: None,
            };
            emit(spec, state, writer, sinks, entry)?;
            return Ok(InvokeReport::new(&spec.name, ExecStatus::Failure, Some(message)));
        }
    };

    if let Err(violation) = spec.output_schema.validate(&raw_output) {
        let message = format!("output rejected: {violation}");
        warn!(node = %spec.name, trace_id = %state.trace_id, %violation, "output validation failed");
        let entry = NodeExecution {
            node_name: spec.name.clone(),
            version: spec.version.clone(),
            input,
            output: Some(raw_output),
            status: ExecStatus::ValidationError,
            runtime_ms,
            timestamp: Utc::now(),
            error_message: Some(message.clone()),
            input_hash,
            output_hash: None,
        };
        emit(spec, state, writer, sinks, entry)?;
        return Ok(InvokeReport::new(&spec.name, ExecStatus::ValidationError, Some(message)));
    }

    let output = attach_meta(spec, state, raw_output)?;
    let output_hash = capture.then(|| content_hash(&output));

    let entry = NodeExecution {
        node_name: spec.name.clone(),
        version: spec.version.clone(),
        input,
        output: Some(output.clone()),
        status: ExecStatus::Success,
        runtime_ms,
        timestamp: Utc::now(),
        error_message: None,
        input_hash,
        output_hash,
    };
    emit(spec, state, writer, sinks, entry)?;

    state.node_outputs.insert(spec.name.clone(), output);
    Ok(InvokeReport::new(&spec.name, ExecStatus::Success, None))
}

fn resolve_input(spec: &NodeSpec, state: &ExecutionState) -> Result<Value, String> {
    match &spec.input_source {
        InputSource::Entry => Ok(state.initial_input.clone()),
        InputSource::Upstream(upstream) => state
            .node_outputs
            .get(upstream)
            .cloned()
            .ok_or_else(|| format!("missing upstream output '{upstream}'")),
        InputSource::Join(upstreams) => {
            let mut joined = serde_json::Map::new();
            for upstream in upstreams {
                let output = state
                    .node_outputs
                    .get(upstream)
                    .cloned()
                    .ok_or_else(|| format!("missing upstream output '{upstream}'"))?;
                joined.insert(upstream.clone(), output);
            }
            Ok(Value::Object(joined))
        }
    }
}

fn attach_meta(
    spec: &NodeSpec,
    state: &ExecutionState,
    mut output: Value,
) -> Result<Value, EngineError> {
    let now = Utc::now();
    let meta = NodeMeta {
        node_name: spec.name.clone(),
        version: spec.version.clone(),
        tags: spec.tags.clone(),
        replay_trace_id: Some(state.trace_id.clone()),
        runtime_timestamp: now,
    };
    let map = output
        .as_object_mut()
        .expect("output validated as an object");
    map.insert(
        NODE_META_FIELD.to_string(),
        serde_json::to_value(&meta).map_err(|err| EngineError::Other(err.into()))?,
    );
    map.insert(
        EXECUTION_TIMESTAMP_FIELD.to_string(),
        json!(now.to_rfc3339()),
    );
    Ok(output)
}

fn emit(
    spec: &NodeSpec,
    state: &ExecutionState,
    writer: &mut TraceWriter,
    sinks: &SinkSet,
    mut entry: NodeExecution,
) -> Result<(), EngineError> {
    // Fill hashes before the event is derived so the record and the sinks
    // agree on what they saw.
    if writer.capture_io() {
        if entry.input_hash.is_none() && !entry.input.is_null() {
            entry.input_hash = Some(content_hash(&entry.input));
        }
        if entry.output_hash.is_none()
            && let Some(output) = &entry.output
        {
            entry.output_hash = Some(content_hash(output));
        }
    }
    let event = TraceEvent::from_execution(&state.trace_id, &spec.tags, &entry);
    writer.record_node(entry)?;
    sinks.emit(&event);
    Ok(())
}
