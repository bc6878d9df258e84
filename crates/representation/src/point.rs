//! Point-record building: one record per grid cell with a real value.

use chrono::{DateTime, Utc};
use tracing::debug;

use pipeline_common::{is_no_data, PipelineResult};
use storage::{LocationCatalog, SpatialRecord};
use transforms::DerivedVariable;

/// Build point records in row-major cell order. Cells holding the no-data
/// sentinel produce no record. All coordinates resolve to catalog ids in a
/// single batch call, never one round trip per cell.
pub async fn build_point_records(
    derived: &DerivedVariable,
    valid_time: DateTime<Utc>,
    catalog: &dyn LocationCatalog,
) -> PipelineResult<Vec<SpatialRecord>> {
    let spec = derived.slice.spec();

    let mut coords = Vec::new();
    let mut values = Vec::new();
    for j in 0..spec.ny {
        for i in 0..spec.nx {
            let value = derived.slice.get(i, j);
            if is_no_data(value) {
                continue;
            }
            if let Some((lon, lat)) = spec.index_to_coord(i, j) {
                coords.push((lon, lat));
                values.push(value);
            }
        }
    }

    let ids = catalog.resolve_locations(&coords).await?;

    let records: Vec<SpatialRecord> = ids
        .into_iter()
        .zip(values)
        .map(|(location, value)| SpatialRecord::Point {
            location,
            variable: derived.name.clone(),
            valid_time,
            value: value as f64,
        })
        .collect();

    debug!(
        variable = %derived.name,
        valid_time = %valid_time,
        cells = spec.len(),
        records = records.len(),
        "built point records"
    );
    Ok(records)
}
