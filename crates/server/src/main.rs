//! DeskRelay server binary

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deskrelay_server::config::LogFormat;
use deskrelay_server::routes::create_router;
use deskrelay_server::websocket::{LivenessMonitor, RoomRegistry};
use deskrelay_server::{AppState, Config};
use deskrelay_shared::close_codes;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for sockets to finish closing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Pretty);
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };
    init_tracing(config.log_format);

    let state = AppState::from_config(config.clone()).context("Failed to initialize relay")?;
    tracing::info!(
        instance_id = %config.instance_id,
        broker = config.broker.transport_name(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Relay initialized"
    );

    tokio::spawn(
        LivenessMonitor::new(Arc::clone(&state.registry), config.heartbeat_interval).run(),
    );

    let registry = Arc::clone(&state.registry);
    let app = create_router(state);

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(Arc::clone(&registry)))
        .await
        .context("Server error")?;

    drain(&registry).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "deskrelay_server=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

/// Resolves on SIGINT/SIGTERM after asking every socket to close
async fn shutdown(registry: Arc<RoomRegistry>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let closing = registry
        .close_all(close_codes::GOING_AWAY, "server shutting down")
        .await;
    tracing::info!(connections = closing, "Shutdown signal received, closing connections");
}

/// Wait for socket tasks to leave their rooms, up to the grace period
async fn drain(registry: &RoomRegistry) {
    let wait = async {
        while registry.connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
        tracing::warn!(
            remaining = registry.connection_count().await,
            "Shutdown grace period elapsed with connections still open"
        );
    }
}
