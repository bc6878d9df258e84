//! Shared application state.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use storage::{ForecastStore, MemoryStore, PostgresStore};

use crate::config::ApiConfig;
use crate::tile_cache::TileCache;

pub struct AppState {
    pub store: Arc<dyn ForecastStore>,
    pub tile_cache: TileCache,
}

impl AppState {
    pub async fn new(config: &ApiConfig) -> Result<Self> {
        let store: Arc<dyn ForecastStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresStore::connect(url).await?;
                store.migrate().await?;
                info!("connected to PostgreSQL store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set, serving from an empty in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self {
            store,
            tile_cache: TileCache::new(config.tile_cache_capacity, config.tile_cache_ttl),
        })
    }

    /// State over an existing store, used by tests.
    pub fn with_store(store: Arc<dyn ForecastStore>, config: &ApiConfig) -> Self {
        Self {
            store,
            tile_cache: TileCache::new(config.tile_cache_capacity, config.tile_cache_ttl),
        }
    }
}
