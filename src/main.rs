mod api;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod ingest;
mod mapper;
mod models;
mod query;
mod report;
mod store;

use anyhow::{Context, Result};
use config::Config;
use error::StoreError;
use ingest::Ingestor;
use query::QueryService;
use store::HostStore;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub ingestor: Ingestor,
    pub queries: QueryService,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let store = HostStore::open(&config.db_path, config.storage_busy_timeout)?;
        Ok(Self {
            ingestor: Ingestor::new(store.clone()),
            queries: QueryService::new(store),
            config,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recon_store=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let state = AppState::new(config.clone())
        .with_context(|| format!("Failed opening host store at {}", config.db_path.display()))?;
    info!(db = %config.db_path.display(), "Host store ready");

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("recon-store listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
