//! Core primitives for the TraceRun execution engine.
//!
//! A workflow is a directed acyclic graph of typed nodes. Every run is fully
//! recorded — per-node inputs, outputs, content hashes, timing — so the same
//! inputs can be deterministically re-played for audit, debugging, or
//! offline learning:
//! - node registry with explicit I/O schemas and a wrapped invocation
//!   contract
//! - sequential DAG kernel with deadline, cancellation, and replay support
//! - trace recorder with append-only sinks (line-JSON, embedded SQL,
//!   pub-stream)

mod canonical;
mod config;
mod error;
mod event;
mod graph;
mod kernel;
mod node;
mod nodes;
mod record;
mod recorder;
mod replay;
mod schema;
mod sink;
mod state;
mod telemetry;

pub use canonical::{canonical_json, content_hash, encode_binary};
pub use config::{
    ConfigLoader, EngineConfig, KernelConfig, ReplayMode, StorageConfig, TracingConfig,
};
pub use error::{EngineError, SchemaViolation};
pub use event::TraceEvent;
pub use graph::{FlowGraph, GraphBuilder, Router};
pub use kernel::{CancelFlag, Kernel, RunOptions, RunReport, RunStatus};
pub use node::{InputSource, InvokeReport, NodeHandler, NodeRegistry, NodeSpec, invoke_node};
pub use nodes::{
    DEFAULT_TASK, EchoGenerator, TextGenerator, default_graph, install_default_nodes,
};
pub use record::{ExecStatus, NodeExecution, ReplayMetadata, TraceRecord};
pub use recorder::{TraceReader, TraceStore, TraceWriter};
pub use replay::{ReplayManager, ReplayPlan};
pub use schema::{FieldSpec, FieldType, NodeMeta, Schema};
pub use sink::{JsonlSink, SinkSet, SqliteSink, StreamSink, TraceSink};
pub use state::{ExecutionState, OutputMap};
pub use telemetry::{TelemetryOptions, init_telemetry};
