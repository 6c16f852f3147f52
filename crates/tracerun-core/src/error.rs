use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Core error type for the TraceRun engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("node '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("node '{0}' is not registered")]
    UnknownNode(String),
    #[error("graph '{graph}' contains a cycle through node '{node}'")]
    CyclicGraph { graph: String, node: String },
    #[error("graph '{0}' has no entry node")]
    MissingEntry(String),
    #[error("edge target '{target}' is not part of graph '{graph}'")]
    UnknownEdgeTarget { graph: String, target: String },
    #[error("node '{node}' expects input from '{upstream}', which has not produced output")]
    MissingUpstream { node: String, upstream: String },
    #[error("trace '{0}' not found")]
    TraceNotFound(String),
    #[error("trace writer already holds an active trace '{0}'")]
    AlreadyActive(String),
    #[error("no active trace; call init_trace first")]
    NoActiveTrace,
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error while accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("trace store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn io(path: PathBuf, source: std::io::Error) -> Self {
        Self::Io { path, source }
    }
}

/// A schema violation raised by the wrapper when validating node I/O.
#[derive(Debug, Clone)]
pub struct SchemaViolation {
    pub field: Option<String>,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(field: impl Into<Option<String>>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "field '{field}': {}", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl std::error::Error for SchemaViolation {}
