mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use testbox_common::config::Settings;
use testbox_engine::config::LanguageConfigManager;
use testbox_engine::docker::DockerRuntime;
use testbox_engine::policy::DenylistPolicy;
use testbox_engine::Orchestrator;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Testbox API booting...");

    let settings = Settings::from_env().context("Invalid TESTBOX_* settings")?;
    let languages = LanguageConfigManager::load(&settings.languages_path)?;
    info!(languages = ?languages.list_languages(), "Loaded language configs");

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    runtime.ping().await.context("Docker daemon is not responding")?;
    info!("Connected to Docker");

    let orchestrator = Orchestrator::new(
        Arc::new(runtime),
        languages,
        Arc::new(DenylistPolicy),
        settings.clone(),
    )
    .await
    .context("Failed to initialise orchestrator")?;

    tokio::spawn(orchestrator.reaper().run_periodic(settings.reaper_interval));

    let state = Arc::new(AppState { orchestrator });
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!("HTTP server listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Testbox API shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining in-flight runs");
}
