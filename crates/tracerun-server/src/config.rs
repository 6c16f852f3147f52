use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracerun_core::{ReplayMode, TracingConfig};

/// Control-plane configuration, resolved from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub listen_addr: String,
    /// Bounded background worker pool for run dispatch.
    pub workers: usize,
    /// Per-run deadline in milliseconds; 0 disables it.
    pub deadline_ms: u64,
    pub capture_io: bool,
    pub replay_mode: ReplayMode,
    pub trace_dir: PathBuf,
    pub sqlite_records: bool,
    pub tracing: TracingConfig,
}

impl AppConfig {
    const DEFAULT_LISTEN_ADDR: &'static str = "0.0.0.0:8080";
    const DEFAULT_WORKERS: usize = 4;

    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("TRACERUN_LISTEN_ADDR")
            .unwrap_or_else(|_| Self::DEFAULT_LISTEN_ADDR.to_string());

        let workers = env::var("TRACERUN_WORKERS")
            .ok()
            .map(|value| {
                value
                    .parse::<usize>()
                    .with_context(|| "TRACERUN_WORKERS must be a positive integer")
            })
            .transpose()?
            .filter(|value| *value > 0)
            .unwrap_or(Self::DEFAULT_WORKERS);

        let deadline_ms = env::var("TRACERUN_DEADLINE_MS")
            .ok()
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| "TRACERUN_DEADLINE_MS must be an integer")
            })
            .transpose()?
            .unwrap_or(0);

        let capture_io = env_bool("TRACERUN_CAPTURE_IO").unwrap_or(true);

        let replay_mode = match env::var("TRACERUN_REPLAY_MODE").ok().as_deref() {
            None | Some("short_circuit") => ReplayMode::ShortCircuit,
            Some("re_execute") => ReplayMode::ReExecute,
            Some(other) => {
                bail!("TRACERUN_REPLAY_MODE must be short_circuit or re_execute, got '{other}'")
            }
        };

        let trace_dir = env::var("TRACERUN_TRACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/traces"));

        let sqlite_records = env_bool("TRACERUN_SQLITE_RECORDS").unwrap_or(false);

        let mut tracing = TracingConfig::default();
        if let Some(enabled) = env_bool("TRACERUN_JSONL_ENABLED") {
            tracing.jsonl_enabled = enabled;
        }
        if let Ok(path) = env::var("TRACERUN_JSONL_PATH") {
            tracing.jsonl_path = path;
        }
        if let Some(enabled) = env_bool("TRACERUN_SQLITE_ENABLED") {
            tracing.sqlite_enabled = enabled;
        }
        if let Ok(path) = env::var("TRACERUN_SQLITE_PATH") {
            tracing.sqlite_path = path;
        }
        if let Some(enabled) = env_bool("TRACERUN_STREAM_ENABLED") {
            tracing.stream_enabled = enabled;
        }
        if let Ok(host) = env::var("TRACERUN_STREAM_HOST") {
            tracing.stream_host = host;
        }
        if let Ok(port) = env::var("TRACERUN_STREAM_PORT") {
            tracing.stream_port = port
                .parse::<u16>()
                .with_context(|| "TRACERUN_STREAM_PORT must be a port number")?;
        }
        tracing.capture_io = capture_io;

        Ok(Self {
            listen_addr,
            workers,
            deadline_ms,
            capture_io,
            replay_mode,
            trace_dir,
            sqlite_records,
            tracing,
        })
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
