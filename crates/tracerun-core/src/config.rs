use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const DEFAULT_CONFIG_PATH: &str = "tracerun.toml";
const CONFIG_PATH_ENV: &str = "TRACERUN_CONFIG";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: KernelConfig,
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument (must exist).
    /// 2. `TRACERUN_CONFIG` environment variable (must exist).
    /// 3. `tracerun.toml` in the current working directory, falling back to
    ///    built-in defaults when absent.
    pub fn load(path: Option<PathBuf>) -> Result<EngineConfig, EngineError> {
        let (candidate, required) = resolve_path(path);
        if !required && !candidate.exists() {
            let config = EngineConfig::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| EngineError::io(candidate.clone(), err))?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|err| EngineError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &EngineConfig) -> Result<(), EngineError> {
        if config.engine.workers == 0 {
            return Err(EngineError::InvalidConfiguration(
                "engine.workers must be at least 1".into(),
            ));
        }
        if config.tracing.stream_enabled && config.tracing.stream_host.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "tracing.stream_host must be set when the stream sink is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV)
        && !from_env.trim().is_empty()
    {
        return (PathBuf::from(from_env), true);
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

/// `[tracing]`: which sinks are live and where they write.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "TracingConfig::default_enabled")]
    pub jsonl_enabled: bool,
    #[serde(default)]
    pub sqlite_enabled: bool,
    #[serde(default)]
    pub stream_enabled: bool,
    #[serde(default = "TracingConfig::default_jsonl_path")]
    pub jsonl_path: String,
    #[serde(default = "TracingConfig::default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "TracingConfig::default_stream_host")]
    pub stream_host: String,
    #[serde(default = "TracingConfig::default_stream_port")]
    pub stream_port: u16,
    /// When false, node payload hashes are omitted from trace records.
    #[serde(default = "TracingConfig::default_enabled")]
    pub capture_io: bool,
}

impl TracingConfig {
    const fn default_enabled() -> bool {
        true
    }

    fn default_jsonl_path() -> String {
        "data/trace_events.jsonl".to_string()
    }

    fn default_sqlite_path() -> String {
        "data/traces.db".to_string()
    }

    fn default_stream_host() -> String {
        "127.0.0.1".to_string()
    }

    const fn default_stream_port() -> u16 {
        5555
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            jsonl_enabled: true,
            sqlite_enabled: false,
            stream_enabled: false,
            jsonl_path: Self::default_jsonl_path(),
            sqlite_path: Self::default_sqlite_path(),
            stream_host: Self::default_stream_host(),
            stream_port: Self::default_stream_port(),
            capture_io: true,
        }
    }
}

/// `[storage]`: where finalized trace records live.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_trace_dir")]
    pub trace_dir: PathBuf,
    /// Mirror finalized records into `records.db` inside `trace_dir`.
    #[serde(default)]
    pub sqlite_records: bool,
}

impl StorageConfig {
    fn default_trace_dir() -> PathBuf {
        PathBuf::from("data/traces")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            trace_dir: Self::default_trace_dir(),
            sqlite_records: false,
        }
    }
}

/// `[engine]`: scheduling limits and replay behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "KernelConfig::default_workers")]
    pub workers: usize,
    /// Per-run deadline in milliseconds; 0 disables the deadline.
    #[serde(default)]
    pub deadline_ms: u64,
    #[serde(default)]
    pub replay_mode: ReplayMode,
}

impl KernelConfig {
    const fn default_workers() -> usize {
        4
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            deadline_ms: 0,
            replay_mode: ReplayMode::default(),
        }
    }
}

/// How a replay run treats nodes found in the stored trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Emit the stored output without invoking the node body.
    #[default]
    ShortCircuit,
    /// Re-run every node body against the original initial input.
    ReExecute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.tracing.jsonl_enabled);
        assert!(!config.tracing.sqlite_enabled);
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.replay_mode, ReplayMode::ShortCircuit);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let raw = r#"
            [tracing]
            sqlite_enabled = true
            sqlite_path = "/tmp/t.db"

            [engine]
            workers = 2
            replay_mode = "re_execute"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert!(config.tracing.sqlite_enabled);
        assert_eq!(config.tracing.sqlite_path, "/tmp/t.db");
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.replay_mode, ReplayMode::ReExecute);
        assert_eq!(config.storage.trace_dir, PathBuf::from("data/traces"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracerun.toml");
        std::fs::write(&path, "[engine]\nworkers = 0\n").unwrap();
        let err = ConfigLoader::load(Some(path)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn explicit_missing_path_errors() {
        let err = ConfigLoader::load(Some(PathBuf::from("/nonexistent/tracerun.toml"))).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
