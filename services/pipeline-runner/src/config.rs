//! Environment-driven service configuration.

use storage::RecordProfile;
use tracing::warn;

/// Pipeline runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// PostgreSQL connection string. Absent means the in-memory store,
    /// which only makes sense for tests and demos.
    pub database_url: Option<String>,
    /// Representation built for published runs.
    pub profile: RecordProfile,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        let profile = match std::env::var("PIPELINE_PROFILE").ok().as_deref() {
            Some("raster") => RecordProfile::Raster,
            Some("point") | None => RecordProfile::Point,
            Some(other) => {
                warn!(profile = other, "unknown PIPELINE_PROFILE, using point");
                RecordProfile::Point
            }
        };

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            profile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_is_the_default_profile() {
        let config = RunnerConfig {
            database_url: None,
            profile: RecordProfile::Point,
        };
        assert!(config.database_url.is_none());
        assert_eq!(config.profile, RecordProfile::Point);
    }
}
