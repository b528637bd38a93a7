use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helmet_core::runtime::configure_ort_dylib;
use helmet_server::config::ServerConfig;
use helmet_server::router::build_router;
use helmet_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "helmet_server=debug,helmet_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Models ---
    configure_ort_dylib();
    let loader_config = config.clone();
    let state = tokio::task::spawn_blocking(move || AppState::load(&loader_config))
        .await
        .context("model loading task failed")??;
    tracing::info!(upload_dir = %config.upload_dir.display(), "Models loaded");

    // --- Router ---
    let app = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    tracing::info!("Listening on {}", config.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}
