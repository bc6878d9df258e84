//! Environment-driven service configuration.

use std::time::Duration;

/// Query API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// PostgreSQL connection string. Absent means the in-memory store,
    /// which only makes sense for tests and demos.
    pub database_url: Option<String>,
    /// Maximum cached tile responses.
    pub tile_cache_capacity: usize,
    /// Tile response time-to-live.
    pub tile_cache_ttl: Duration,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let tile_cache_capacity = std::env::var("QUERY_API_TILE_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024);
        let ttl_secs = std::env::var("QUERY_API_TILE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            tile_cache_capacity,
            tile_cache_ttl: Duration::from_secs(ttl_secs),
        }
    }
}
