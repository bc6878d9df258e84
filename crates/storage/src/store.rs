//! Store traits shared by the in-memory and PostgreSQL backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipeline_common::{BoundingBox, PipelineResult, TimeRange};

use crate::records::{BatchId, Location, LocationId, SpatialRecord};

/// One sample of a point-query series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// Promoted records intersecting one requested tile.
#[derive(Debug, Clone)]
pub enum TileQueryResult {
    /// Stored raster tiles overlapping the request bbox, deduplicated to the
    /// most recent publication per tile position.
    Raster(Vec<SpatialRecord>),
    /// Point samples inside the request bbox with resolved coordinates.
    Points(Vec<(Location, f64)>),
}

impl TileQueryResult {
    pub fn is_empty(&self) -> bool {
        match self {
            TileQueryResult::Raster(tiles) => tiles.is_empty(),
            TileQueryResult::Points(points) => points.is_empty(),
        }
    }
}

/// Lookup-or-insert catalog of quantized grid coordinates.
#[async_trait]
pub trait LocationCatalog: Send + Sync {
    /// Resolve a batch of `(lon, lat)` coordinates to stable ids, inserting
    /// unseen coordinates. Output order matches input order. Never issues
    /// one round trip per coordinate.
    async fn resolve_locations(&self, coords: &[(f64, f64)]) -> PipelineResult<Vec<LocationId>>;

    /// Nearest catalog location to the given coordinate, if the catalog is
    /// non-empty.
    async fn nearest_location(&self, lat: f64, lon: f64) -> PipelineResult<Option<Location>>;
}

/// Staged, atomically promoted forecast storage.
///
/// Lifecycle per model run: `begin_batch`, any number of `stage` calls,
/// then exactly one of `promote` or `discard`. A staging error poisons the
/// batch; further staging and promotion are rejected, only `discard`
/// remains valid.
#[async_trait]
pub trait ForecastStore: LocationCatalog {
    async fn begin_batch(&self, reference_time: DateTime<Utc>) -> PipelineResult<BatchId>;

    async fn stage(&self, batch: BatchId, records: &[SpatialRecord]) -> PipelineResult<()>;

    /// Atomically replace the publication for the batch's reference time.
    /// Returns the number of records made visible. Idempotent per
    /// reference time: re-promoting a rerun replaces, never duplicates.
    async fn promote(&self, batch: BatchId) -> PipelineResult<u64>;

    /// Drop a batch and everything staged into it. Discarding an unknown
    /// batch is a no-op so failure paths can call it unconditionally.
    async fn discard(&self, batch: BatchId) -> PipelineResult<()>;

    /// Ordered `(time, value)` series for one location and variable from
    /// the promoted data. When several published runs cover the same valid
    /// time the most recent run wins. An empty series is not an error.
    async fn query_series(
        &self,
        location: LocationId,
        variable: &str,
        range: Option<TimeRange>,
    ) -> PipelineResult<Vec<SeriesPoint>>;

    /// Promoted records for one variable and valid time intersecting the
    /// bbox.
    async fn query_tile(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
        bbox: &BoundingBox,
    ) -> PipelineResult<TileQueryResult>;

    /// Union bbox of all promoted records for a variable, or `None` when
    /// nothing is published.
    async fn production_extent(&self, variable: &str) -> PipelineResult<Option<BoundingBox>>;

    /// Time of the most recent promotion, or `None` when nothing is
    /// published. Changes on every promote, so derived caches can key on
    /// it and never outlive the publication they were built from.
    async fn last_promoted_at(&self) -> PipelineResult<Option<DateTime<Utc>>>;
}
