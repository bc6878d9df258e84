//! In-memory store backend for tests and single-node deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use pipeline_common::{BoundingBox, PipelineError, PipelineResult, TimeRange};

use crate::location::LocationIndex;
use crate::records::{BatchId, Location, LocationId, SpatialRecord};
use crate::store::{ForecastStore, LocationCatalog, SeriesPoint, TileQueryResult};

struct StagingBatch {
    reference_time: DateTime<Utc>,
    records: Vec<SpatialRecord>,
    poisoned: bool,
}

#[derive(Default)]
struct Inner {
    staging: HashMap<BatchId, StagingBatch>,
    /// Promoted records, keyed by reference time. Promotion swaps a whole
    /// entry at once.
    published: BTreeMap<DateTime<Utc>, Vec<SpatialRecord>>,
    last_promoted: Option<DateTime<Utc>>,
    locations: LocationIndex,
}

/// Single-process [`ForecastStore`] over a tokio `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationCatalog for MemoryStore {
    async fn resolve_locations(&self, coords: &[(f64, f64)]) -> PipelineResult<Vec<LocationId>> {
        let mut inner = self.inner.write().await;
        Ok(coords
            .iter()
            .map(|(lon, lat)| inner.locations.insert_or_get(*lon, *lat))
            .collect())
    }

    async fn nearest_location(&self, lat: f64, lon: f64) -> PipelineResult<Option<Location>> {
        let inner = self.inner.read().await;
        Ok(inner.locations.nearest(lat, lon))
    }
}

#[async_trait]
impl ForecastStore for MemoryStore {
    async fn begin_batch(&self, reference_time: DateTime<Utc>) -> PipelineResult<BatchId> {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.staging.insert(
            id,
            StagingBatch {
                reference_time,
                records: Vec::new(),
                poisoned: false,
            },
        );
        debug!(batch_id = %id, reference_time = %reference_time, "opened staging batch");
        Ok(id)
    }

    async fn stage(&self, batch: BatchId, records: &[SpatialRecord]) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .staging
            .get_mut(&batch)
            .ok_or_else(|| PipelineError::Staging(format!("unknown batch {}", batch)))?;

        if entry.poisoned {
            return Err(PipelineError::Staging(format!(
                "batch {} is poisoned by an earlier staging error",
                batch
            )));
        }

        for record in records {
            if let Err(e) = record.validate() {
                entry.poisoned = true;
                return Err(e);
            }
        }

        entry.records.extend_from_slice(records);
        Ok(())
    }

    async fn promote(&self, batch: BatchId) -> PipelineResult<u64> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .staging
            .remove(&batch)
            .ok_or_else(|| PipelineError::Promotion(format!("unknown batch {}", batch)))?;

        if entry.poisoned {
            inner.staging.insert(batch, entry);
            return Err(PipelineError::Promotion(format!(
                "batch {} is poisoned and cannot be promoted",
                batch
            )));
        }

        let count = entry.records.len() as u64;
        let replaced = inner
            .published
            .insert(entry.reference_time, entry.records)
            .is_some();
        // Strictly monotonic even when two promotions land on the same
        // clock reading.
        let stamp = Utc::now();
        inner.last_promoted = Some(match inner.last_promoted {
            Some(prev) if stamp <= prev => prev + chrono::Duration::nanoseconds(1),
            _ => stamp,
        });
        info!(
            batch_id = %batch,
            reference_time = %entry.reference_time,
            records = count,
            replaced,
            "promoted batch"
        );
        Ok(count)
    }

    async fn discard(&self, batch: BatchId) -> PipelineResult<()> {
        let mut inner = self.inner.write().await;
        if inner.staging.remove(&batch).is_some() {
            debug!(batch_id = %batch, "discarded staging batch");
        }
        Ok(())
    }

    async fn query_series(
        &self,
        location: LocationId,
        variable: &str,
        range: Option<TimeRange>,
    ) -> PipelineResult<Vec<SeriesPoint>> {
        let inner = self.inner.read().await;

        // Ascending reference-time iteration, so later runs overwrite
        // earlier ones at shared valid times.
        let mut series: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
        for records in inner.published.values() {
            for record in records {
                let SpatialRecord::Point {
                    location: loc,
                    variable: var,
                    valid_time,
                    value,
                } = record
                else {
                    continue;
                };
                if *loc != location || var != variable {
                    continue;
                }
                if let Some(r) = &range {
                    if !r.contains(valid_time) {
                        continue;
                    }
                }
                series.insert(*valid_time, *value);
            }
        }

        Ok(series
            .into_iter()
            .map(|(time, value)| SeriesPoint { time, value })
            .collect())
    }

    async fn query_tile(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
        bbox: &BoundingBox,
    ) -> PipelineResult<TileQueryResult> {
        let inner = self.inner.read().await;

        let mut rasters: BTreeMap<(u32, u32), SpatialRecord> = BTreeMap::new();
        let mut points: BTreeMap<LocationId, f64> = BTreeMap::new();

        for records in inner.published.values() {
            for record in records {
                if record.variable() != variable || record.valid_time() != valid_time {
                    continue;
                }
                match record {
                    SpatialRecord::Raster {
                        tile_row,
                        tile_col,
                        bbox: tile_bbox,
                        ..
                    } => {
                        if tile_bbox.intersects(bbox) {
                            rasters.insert((*tile_row, *tile_col), record.clone());
                        }
                    }
                    SpatialRecord::Point {
                        location, value, ..
                    } => {
                        if let Some(loc) = inner.locations.get(*location) {
                            if bbox.contains_point(loc.lon, loc.lat) {
                                points.insert(*location, *value);
                            }
                        }
                    }
                }
            }
        }

        if !rasters.is_empty() {
            return Ok(TileQueryResult::Raster(rasters.into_values().collect()));
        }

        let resolved = points
            .into_iter()
            .filter_map(|(id, value)| inner.locations.get(id).map(|loc| (loc, value)))
            .collect();
        Ok(TileQueryResult::Points(resolved))
    }

    async fn production_extent(&self, variable: &str) -> PipelineResult<Option<BoundingBox>> {
        let inner = self.inner.read().await;

        let mut extent: Option<BoundingBox> = None;
        let mut grow = |b: BoundingBox| {
            extent = Some(match extent {
                Some(e) => e.union(&b),
                None => b,
            });
        };

        for records in inner.published.values() {
            for record in records {
                if record.variable() != variable {
                    continue;
                }
                match record {
                    SpatialRecord::Raster { bbox, .. } => grow(*bbox),
                    SpatialRecord::Point { location, .. } => {
                        if let Some(loc) = inner.locations.get(*location) {
                            grow(BoundingBox::new(loc.lon, loc.lat, loc.lon, loc.lat));
                        }
                    }
                }
            }
        }

        Ok(extent)
    }

    async fn last_promoted_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read().await;
        Ok(inner.last_promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()
    }

    fn point(location: LocationId, hour: u32, value: f64) -> SpatialRecord {
        SpatialRecord::Point {
            location,
            variable: "temperature_2m".to_string(),
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap(),
            value,
        }
    }

    #[tokio::test]
    async fn test_records_invisible_until_promoted() {
        let store = MemoryStore::new();
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();
        let batch = store.begin_batch(reference_time()).await.unwrap();
        store.stage(batch, &[point(ids[0], 1, 28.4)]).await.unwrap();

        let series = store
            .query_series(ids[0], "temperature_2m", None)
            .await
            .unwrap();
        assert!(series.is_empty());

        let count = store.promote(batch).await.unwrap();
        assert_eq!(count, 1);

        let series = store
            .query_series(ids[0], "temperature_2m", None)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].value - 28.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repromotion_replaces_not_duplicates() {
        let store = MemoryStore::new();
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();

        let first = store.begin_batch(reference_time()).await.unwrap();
        store
            .stage(first, &[point(ids[0], 1, 20.0), point(ids[0], 2, 21.0)])
            .await
            .unwrap();
        store.promote(first).await.unwrap();

        let rerun = store.begin_batch(reference_time()).await.unwrap();
        store.stage(rerun, &[point(ids[0], 1, 25.0)]).await.unwrap();
        store.promote(rerun).await.unwrap();

        let series = store
            .query_series(ids[0], "temperature_2m", None)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].value - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_staging_error_poisons_batch() {
        let store = MemoryStore::new();
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();
        let batch = store.begin_batch(reference_time()).await.unwrap();

        store.stage(batch, &[point(ids[0], 1, 20.0)]).await.unwrap();
        let bad = SpatialRecord::Point {
            location: ids[0],
            variable: "temperature_2m".to_string(),
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
            value: f64::INFINITY,
        };
        assert!(store.stage(batch, &[bad]).await.is_err());

        // Poisoned: further staging and promotion both rejected
        assert!(store.stage(batch, &[point(ids[0], 3, 20.0)]).await.is_err());
        let err = store.promote(batch).await.unwrap_err();
        assert!(matches!(err, PipelineError::Promotion(_)));

        // Nothing leaked into production
        let series = store
            .query_series(ids[0], "temperature_2m", None)
            .await
            .unwrap();
        assert!(series.is_empty());

        store.discard(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_last_promoted_at_advances_on_repromotion() {
        let store = MemoryStore::new();
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();
        assert!(store.last_promoted_at().await.unwrap().is_none());

        let first = store.begin_batch(reference_time()).await.unwrap();
        store.stage(first, &[point(ids[0], 1, 20.0)]).await.unwrap();
        store.promote(first).await.unwrap();
        let stamp1 = store.last_promoted_at().await.unwrap().unwrap();

        let rerun = store.begin_batch(reference_time()).await.unwrap();
        store.stage(rerun, &[point(ids[0], 1, 25.0)]).await.unwrap();
        store.promote(rerun).await.unwrap();
        let stamp2 = store.last_promoted_at().await.unwrap().unwrap();

        assert!(stamp2 > stamp1);
    }

    #[tokio::test]
    async fn test_discard_unknown_batch_is_noop() {
        let store = MemoryStore::new();
        store.discard(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_series_range_filter_and_order() {
        let store = MemoryStore::new();
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();
        let batch = store.begin_batch(reference_time()).await.unwrap();
        store
            .stage(
                batch,
                &[
                    point(ids[0], 3, 23.0),
                    point(ids[0], 1, 21.0),
                    point(ids[0], 2, 22.0),
                ],
            )
            .await
            .unwrap();
        store.promote(batch).await.unwrap();

        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
        );
        let series = store
            .query_series(ids[0], "temperature_2m", Some(range))
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
        assert!(series[0].time < series[1].time);
        assert!((series[0].value - 21.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_production_extent_from_points() {
        let store = MemoryStore::new();
        let ids = store
            .resolve_locations(&[(-50.0, -17.0), (-49.0, -16.0)])
            .await
            .unwrap();
        let batch = store.begin_batch(reference_time()).await.unwrap();
        store
            .stage(batch, &[point(ids[0], 1, 1.0), point(ids[1], 1, 2.0)])
            .await
            .unwrap();
        store.promote(batch).await.unwrap();

        let extent = store
            .production_extent("temperature_2m")
            .await
            .unwrap()
            .unwrap();
        assert!((extent.min_x - (-50.0)).abs() < 1e-9);
        assert!((extent.max_y - (-16.0)).abs() < 1e-9);

        assert!(store
            .production_extent("wind_speed_10m")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_query_tile_points_in_bbox() {
        let store = MemoryStore::new();
        let ids = store
            .resolve_locations(&[(-49.25, -16.68), (-40.0, -10.0)])
            .await
            .unwrap();
        let batch = store.begin_batch(reference_time()).await.unwrap();
        store
            .stage(batch, &[point(ids[0], 1, 28.4), point(ids[1], 1, 30.0)])
            .await
            .unwrap();
        store.promote(batch).await.unwrap();

        let bbox = BoundingBox::new(-50.0, -17.0, -49.0, -16.0);
        let result = store
            .query_tile(
                "temperature_2m",
                Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap(),
                &bbox,
            )
            .await
            .unwrap();
        match result {
            TileQueryResult::Points(points) => {
                assert_eq!(points.len(), 1);
                assert!((points[0].1 - 28.4).abs() < 1e-9);
            }
            TileQueryResult::Raster(_) => panic!("expected point records"),
        }
    }
}
