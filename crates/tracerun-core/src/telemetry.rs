use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Options for the process-wide tracing subscriber.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Filter directives; falls back to `RUST_LOG`, then `"info"`.
    pub env_filter: Option<String>,
    pub with_ansi: bool,
    /// Include the emitting module path in log lines.
    pub with_target: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
            with_target: false,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), EngineError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = match options.env_filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(options.with_ansi)
        .with_target(options.with_target)
        .try_init()
        .map_err(|err| {
            EngineError::InvalidConfiguration(format!("telemetry init failed: {err}"))
        })?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
