use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use prwarden::config::Config;
use prwarden::gateway::{self, AppState};
use prwarden::platform::AzureDevOpsStore;
use prwarden::providers::build_provider;
use prwarden::review::{RateGate, ReviewOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("prwarden.toml"));
    let config = Config::load(&config_path)?;

    let store = Arc::new(AzureDevOpsStore::new(&config.platform)?);
    let provider = build_provider(&config)?;
    tracing::info!(
        organization = %config.platform.organization,
        provider = provider.display_name(),
        mode = ?config.orchestration.mode,
        "prwarden starting"
    );

    let orchestrator = Arc::new(ReviewOrchestrator::new(
        store,
        provider,
        Arc::new(RateGate::new()),
        &config,
    ));

    let app = gateway::router(AppState { orchestrator }, &config.server);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "listening");
    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
