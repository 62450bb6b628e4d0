//! Shardline Node Binary
//!
//! Runs the outbox coordinator against a local SQLite database and logs every
//! drained event.
//!
//! # Environment Variables
//!
//! - `SHARDLINE_DATABASE`: SQLite path (default: shardline.db)
//! - `SHARDLINE_SHARDS_*`, `SHARDLINE_PROCESSORS_*`: settings overrides
//! - `RUST_LOG`: log filter (default: info)
//!
//! # Example
//!
//! ```bash
//! export SHARDLINE_SHARDS_STATIC=true
//! export SHARDLINE_SHARDS_TOTAL_COUNT=4
//! export SHARDLINE_SHARDS_ASSIGNED=0,1
//! cargo run --bin shardline-node -- shardline.toml
//! ```

use shardline_coordination::{CoordinationSettings, CoordinationStrategy, TracingSink};
use shardline_metadata::SqliteMetadataStore;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => {
            info!(path = %path, "Loading settings");
            CoordinationSettings::load(&path)?
        }
        None => {
            let mut settings = CoordinationSettings::default();
            settings.apply_env_overrides()?;
            settings
        }
    };

    let database = std::env::var("SHARDLINE_DATABASE").unwrap_or_else(|_| "shardline.db".to_string());
    info!(database = %database, "Opening metadata store");
    let store = Arc::new(SqliteMetadataStore::new(&database).await?);

    let strategy = CoordinationStrategy::builder()
        .settings(settings)
        .store(Arc::clone(&store))
        .sink(Arc::new(TracingSink))
        .build()?;

    strategy.start().await?;
    info!("Shardline node running, press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, draining processors");
        }
        result = strategy.completion() => {
            if let Err(e) = result {
                error!(error = %e, "Event processing ended");
            }
        }
    }

    if let Err(e) = strategy.pre_stop().await {
        error!(error = %e, "Processors stopped with errors");
    }
    strategy.stop().await?;
    store.close().await;

    Ok(())
}
