//! End-to-end coordinator tests over the in-memory store.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pipeline::{Coordinator, RunStage};
use pipeline_common::{BoundingBox, PipelineError, PipelineResult, TimeRange};
use storage::{
    BatchId, ForecastStore, Location, LocationCatalog, LocationId, MemoryStore, RecordProfile,
    SeriesPoint, SpatialRecord, TileQueryResult,
};
use test_utils::DatasetBuilder;

fn goias_dataset(times: usize) -> test_utils::BuiltDataset {
    DatasetBuilder::new(20, 20)
        .origin(-50.0, -17.5)
        .step(0.1, 0.1)
        .times(times)
        .variable("t2m", |_, _, _| 301.55)
        .variable("d2m", |_, _, _| 296.55)
        .variable("u10", |_, _, _| 3.0)
        .variable("v10", |_, _, _| 4.0)
        .variable("precip_acc", |_, _, t| 0.5 * (t + 1) as f32)
        .write()
}

#[tokio::test]
async fn test_point_run_round_trip_at_goiania() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);
    let dataset = goias_dataset(3);

    let result = coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect("run succeeds");
    assert_eq!(result.timesteps, 3);
    assert!(result.promoted_count > 0);

    // Nearest grid point to Goiânia, then its temperature series
    let location = store
        .nearest_location(-16.68, -49.25)
        .await
        .unwrap()
        .expect("catalog populated");
    let series = store
        .query_series(location.id, "temperature_2m", None)
        .await
        .unwrap();

    assert_eq!(series.len(), 3);
    for point in &series {
        assert!((point.value - 28.4).abs() < 1e-3, "value = {}", point.value);
    }
}

#[tokio::test]
async fn test_first_timestep_precipitation_absent_in_point_profile() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);
    let dataset = goias_dataset(3);

    coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect("run succeeds");

    let location = store.nearest_location(-16.68, -49.25).await.unwrap().unwrap();
    let series = store
        .query_series(location.id, "precipitation_1h", None)
        .await
        .unwrap();

    // First valid time emits only no-data, so only two records survive,
    // each the hourly accumulation difference
    assert_eq!(series.len(), 2);
    assert_eq!(series[0].time, dataset.times[1]);
    for point in &series {
        assert!((point.value - 0.5).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_rerun_replaces_instead_of_duplicating() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);

    let dataset = goias_dataset(2);
    coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect("first run succeeds");

    let location = store.nearest_location(-16.68, -49.25).await.unwrap().unwrap();
    let before = store
        .query_series(location.id, "temperature_2m", None)
        .await
        .unwrap();

    let rerun = goias_dataset(2);
    coordinator
        .run(rerun.dir.path(), &AtomicBool::new(false))
        .await
        .expect("rerun succeeds");

    let after = store
        .query_series(location.id, "temperature_2m", None)
        .await
        .unwrap();
    assert_eq!(before.len(), after.len());
}

#[tokio::test]
async fn test_missing_required_variable_fails_in_extracting() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);

    let dataset = DatasetBuilder::new(4, 4)
        .variable("t2m", |_, _, _| 300.0)
        .write();

    let failure = coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect_err("run must fail");
    assert_eq!(failure.stage, RunStage::Extracting);
    assert_eq!(failure.kind, pipeline_common::ErrorKind::SourceFormat);

    // Nothing promoted
    assert!(store
        .production_extent("temperature_2m")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_cancellation_before_promotion_leaves_nothing_visible() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);
    let dataset = goias_dataset(2);

    let cancel = AtomicBool::new(true);
    let failure = coordinator
        .run(dataset.dir.path(), &cancel)
        .await
        .expect_err("cancelled run must fail");
    assert!(failure.message.contains("cancelled"));

    assert!(store
        .production_extent("temperature_2m")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_raster_run_serves_tiles() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Raster);
    let dataset = goias_dataset(1);

    coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect("run succeeds");

    let extent = store
        .production_extent("temperature_2m")
        .await
        .unwrap()
        .expect("extent published");
    assert!(extent.contains_point(-49.25, -16.68));

    let result = store
        .query_tile("temperature_2m", dataset.times[0], &extent)
        .await
        .unwrap();
    match result {
        TileQueryResult::Raster(tiles) => assert!(!tiles.is_empty()),
        TileQueryResult::Points(_) => panic!("expected raster records"),
    }
}

/// Store wrapper that fails every `stage` call, for rollback tests.
struct FailingStore {
    inner: MemoryStore,
}

#[async_trait]
impl LocationCatalog for FailingStore {
    async fn resolve_locations(&self, coords: &[(f64, f64)]) -> PipelineResult<Vec<LocationId>> {
        self.inner.resolve_locations(coords).await
    }

    async fn nearest_location(&self, lat: f64, lon: f64) -> PipelineResult<Option<Location>> {
        self.inner.nearest_location(lat, lon).await
    }
}

#[async_trait]
impl ForecastStore for FailingStore {
    async fn begin_batch(&self, reference_time: DateTime<Utc>) -> PipelineResult<BatchId> {
        self.inner.begin_batch(reference_time).await
    }

    async fn stage(&self, _batch: BatchId, _records: &[SpatialRecord]) -> PipelineResult<()> {
        Err(PipelineError::Staging("no space left on device".to_string()))
    }

    async fn promote(&self, batch: BatchId) -> PipelineResult<u64> {
        self.inner.promote(batch).await
    }

    async fn discard(&self, batch: BatchId) -> PipelineResult<()> {
        self.inner.discard(batch).await
    }

    async fn query_series(
        &self,
        location: LocationId,
        variable: &str,
        range: Option<TimeRange>,
    ) -> PipelineResult<Vec<SeriesPoint>> {
        self.inner.query_series(location, variable, range).await
    }

    async fn query_tile(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
        bbox: &BoundingBox,
    ) -> PipelineResult<TileQueryResult> {
        self.inner.query_tile(variable, valid_time, bbox).await
    }

    async fn production_extent(&self, variable: &str) -> PipelineResult<Option<BoundingBox>> {
        self.inner.production_extent(variable).await
    }

    async fn last_promoted_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        self.inner.last_promoted_at().await
    }
}

#[tokio::test]
async fn test_staging_failure_rolls_back_and_never_promotes() {
    let store = Arc::new(FailingStore {
        inner: MemoryStore::new(),
    });
    let coordinator = Coordinator::new(store.clone(), RecordProfile::Point);
    let dataset = goias_dataset(2);

    let failure = coordinator
        .run(dataset.dir.path(), &AtomicBool::new(false))
        .await
        .expect_err("run must fail in staging");
    assert_eq!(failure.stage, RunStage::Staging);
    assert_eq!(failure.kind, pipeline_common::ErrorKind::Staging);

    // Zero records visible anywhere
    assert!(store
        .production_extent("temperature_2m")
        .await
        .unwrap()
        .is_none());
    let location = store.nearest_location(-16.68, -49.25).await.unwrap();
    if let Some(location) = location {
        let series = store
            .query_series(location.id, "temperature_2m", None)
            .await
            .unwrap();
        assert!(series.is_empty());
    }
}
