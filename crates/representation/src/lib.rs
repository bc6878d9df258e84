//! Representation Builder: turns a derived grid into storable records.
//!
//! A deployment runs one of two profiles:
//! - **Raster**: the grid is cut into fixed-size tiles (f32-LE payloads),
//!   edge tiles padded with no-data. Deterministic row-major tile order.
//! - **Point**: one record per grid cell holding a real value; no-data
//!   cells produce no record at all. Coordinates resolve through a single
//!   batch catalog call, in row-major cell order.

pub mod point;
pub mod raster;

use chrono::{DateTime, Utc};
use pipeline_common::{PipelineError, PipelineResult};
use storage::{LocationCatalog, RecordProfile, SpatialRecord};
use transforms::DerivedVariable;

pub use raster::TILE_SIZE;

/// Build the records for one derived variable at one valid time.
///
/// Raster tiling fans out over rayon, so it runs in a blocking task rather
/// than on the async workers.
pub async fn build_records(
    profile: RecordProfile,
    derived: &DerivedVariable,
    valid_time: DateTime<Utc>,
    catalog: &dyn LocationCatalog,
) -> PipelineResult<Vec<SpatialRecord>> {
    match profile {
        RecordProfile::Raster => {
            let derived = derived.clone();
            tokio::task::spawn_blocking(move || {
                raster::build_raster_tiles(&derived, valid_time, TILE_SIZE)
            })
            .await
            .map_err(|e| PipelineError::Internal(format!("tiling task panicked: {}", e)))
        }
        RecordProfile::Point => point::build_point_records(derived, valid_time, catalog).await,
    }
}
