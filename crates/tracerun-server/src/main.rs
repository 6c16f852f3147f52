use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tracerun_core::{TelemetryOptions, init_telemetry};
use tracerun_server::{config::AppConfig, routes, state::AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryOptions::default())?;

    let config = AppConfig::from_env()?;
    let state = AppState::try_new(&config)?;
    let service = state.service();

    let app: Router = routes::build_router(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(address = %config.listen_addr, "tracerun-server listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            error!(error = %err, "server shutdown with error");
            err
        })?;

    service.close_sinks();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            stream.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
