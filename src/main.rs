use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use waypoint::api::{self, AppState};
use waypoint::config::Config;
use waypoint::events::EventStream;
use waypoint::runstate::RunStateStore;
use waypoint::specstore::SpecStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load()?;

    let specs = if config.spec_dir.is_dir() {
        SpecStore::load_dir(&config.spec_dir)
            .with_context(|| format!("Failed to load specs from {}", config.spec_dir.display()))?
    } else {
        tracing::warn!(dir = %config.spec_dir.display(), "spec directory missing, starting empty");
        SpecStore::new()
    };

    let runs = match &config.data_dir {
        Some(dir) => RunStateStore::new(dir.clone())?,
        None => RunStateStore::in_memory(),
    };

    let state = Arc::new(AppState {
        specs: Arc::new(specs),
        runs: Arc::new(runs),
        events: Arc::new(EventStream::new()),
    });

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    tracing::info!(addr = %config.addr, "waypoint listening");
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
