//! The coordinator drives one run through the stage machine, staging every
//! timestep's records into one batch and promoting it atomically at the
//! end. Any failure discards the open batch and surfaces a structured
//! [`RunFailure`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use grid_reader::GridDataset;
use pipeline_common::{PipelineError, PipelineResult};
use representation::build_records;
use storage::{BatchId, ForecastStore, RecordProfile};
use transforms::{
    apply_all, required_inputs, DerivedVariable, RawInputs, Transform, TransformContext,
};

use crate::run::{RunFailure, RunResult, RunStage};

/// Drives ingest runs against one store.
pub struct Coordinator {
    store: Arc<dyn ForecastStore>,
    transforms: Vec<Arc<dyn Transform>>,
    profile: RecordProfile,
    /// Reference times with a run in flight. One run per model run at a
    /// time; different reference times may run concurrently.
    active: Mutex<HashSet<DateTime<Utc>>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn ForecastStore>, profile: RecordProfile) -> Self {
        Self {
            store,
            transforms: transforms::default_registry(),
            profile,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<Arc<dyn Transform>>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Execute one run from a source dataset directory.
    ///
    /// `cancel` is checked between stages and between timesteps; once
    /// promotion has begun it is ignored, so a cancelled run is either
    /// fully absent or fully published.
    pub async fn run(
        &self,
        source: &Path,
        cancel: &AtomicBool,
    ) -> Result<RunResult, RunFailure> {
        let source = source.to_path_buf();

        // Pre-read the reference time so the in-flight guard and the span
        // can be keyed by it.
        let dataset = Arc::new(
            open_dataset(source.clone())
                .await
                .map_err(|e| fail(RunStage::Extracting, e))?,
        );
        let reference_time = dataset.descriptor().reference_time;

        {
            let mut active = self.active.lock().await;
            if !active.insert(reference_time) {
                return Err(fail(
                    RunStage::Pending,
                    PipelineError::Internal(format!(
                        "a run for reference time {} is already in flight",
                        reference_time
                    )),
                ));
            }
        }

        let span = info_span!("run", reference_time = %reference_time);
        let result = self
            .execute(dataset, source, cancel)
            .instrument(span)
            .await;

        self.active.lock().await.remove(&reference_time);
        result
    }

    async fn execute(
        &self,
        dataset: Arc<GridDataset>,
        source: PathBuf,
        cancel: &AtomicBool,
    ) -> Result<RunResult, RunFailure> {
        let descriptor = dataset.descriptor().clone();
        info!(
            source = %source.display(),
            timesteps = descriptor.times.len(),
            variables = descriptor.variables.len(),
            "run started"
        );

        let required = required_inputs(&self.transforms);
        for name in &required {
            if descriptor.variable_index(name).is_none() {
                return Err(fail(
                    RunStage::Extracting,
                    PipelineError::SourceFormat(format!(
                        "dataset does not provide required variable {}",
                        name
                    )),
                ));
            }
        }

        let batch = self
            .store
            .begin_batch(descriptor.reference_time)
            .await
            .map_err(|e| fail(RunStage::Staging, e))?;

        match self.ingest_timesteps(&dataset, batch, cancel).await {
            Ok(()) => {}
            Err(failure) => {
                self.abort(batch).await;
                return Err(failure);
            }
        }

        if cancel.load(Ordering::SeqCst) {
            warn!("run cancelled before promotion");
            self.abort(batch).await;
            return Err(fail(
                RunStage::Staging,
                PipelineError::Internal("run cancelled".to_string()),
            ));
        }

        // Point of no return: cancellation is ignored from here on.
        let promoted_count = match self.store.promote(batch).await {
            Ok(count) => count,
            Err(e) => {
                self.abort(batch).await;
                return Err(fail(RunStage::Promoting, e));
            }
        };

        info!(promoted_count, "run complete");
        Ok(RunResult {
            reference_time: descriptor.reference_time,
            promoted_count,
            timesteps: descriptor.times.len(),
            variables: self
                .transforms
                .iter()
                .map(|t| t.name().to_string())
                .collect(),
        })
    }

    /// Read, transform, build and stage every valid time in ascending
    /// order, carrying the previous timestep's raw inputs for temporal
    /// transforms.
    async fn ingest_timesteps(
        &self,
        dataset: &Arc<GridDataset>,
        batch: BatchId,
        cancel: &AtomicBool,
    ) -> Result<(), RunFailure> {
        let descriptor = dataset.descriptor();
        let required: Vec<String> = required_inputs(&self.transforms).into_iter().collect();

        let mut previous: Option<RawInputs> = None;
        for valid_time in descriptor.times.iter().copied() {
            if cancel.load(Ordering::SeqCst) {
                return Err(fail(
                    RunStage::Extracting,
                    PipelineError::Internal("run cancelled".to_string()),
                ));
            }

            let inputs = read_timestep(dataset.clone(), required.clone(), valid_time)
                .await
                .map_err(|e| fail(RunStage::Extracting, e))?;

            let (derived, inputs) =
                transform_timestep(self.transforms.clone(), inputs, previous.take(), valid_time)
                    .await
                    .map_err(|e| fail(RunStage::Transforming, e))?;

            let mut records = Vec::new();
            for variable in &derived {
                let built = build_records(self.profile, variable, valid_time, self.store.as_ref())
                    .await
                    .map_err(|e| fail(RunStage::Building, e))?;
                records.extend(built);
            }

            self.store
                .stage(batch, &records)
                .await
                .map_err(|e| fail(RunStage::Staging, e))?;

            previous = Some(inputs);
        }

        Ok(())
    }

    async fn abort(&self, batch: BatchId) {
        if let Err(e) = self.store.discard(batch).await {
            error!(batch_id = %batch, error = %e, "failed to discard batch after run failure");
        }
    }
}

fn fail(stage: RunStage, error: PipelineError) -> RunFailure {
    error!(stage = %stage, kind = %error.kind(), error = %error, "run failed");
    RunFailure {
        stage,
        kind: error.kind(),
        message: error.to_string(),
    }
}

/// Dataset open is blocking file I/O; keep it off the async workers.
async fn open_dataset(source: PathBuf) -> PipelineResult<GridDataset> {
    tokio::task::spawn_blocking(move || GridDataset::open(&source))
        .await
        .map_err(|e| PipelineError::Internal(format!("reader task panicked: {}", e)))?
}

/// Transforms fan out over rayon, so they run in a blocking task like the
/// reader calls. Hands the inputs back for the next timestep's temporal
/// context.
async fn transform_timestep(
    transforms: Vec<Arc<dyn Transform>>,
    inputs: RawInputs,
    previous: Option<RawInputs>,
    valid_time: DateTime<Utc>,
) -> PipelineResult<(Vec<DerivedVariable>, RawInputs)> {
    tokio::task::spawn_blocking(move || {
        let ctx = TransformContext {
            valid_time,
            previous: previous.as_ref(),
        };
        let derived = apply_all(&transforms, &inputs, &ctx)?;
        Ok((derived, inputs))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("transform task panicked: {}", e)))?
}

/// Read all required raw slices for one valid time in a blocking task.
async fn read_timestep(
    dataset: Arc<GridDataset>,
    variables: Vec<String>,
    valid_time: DateTime<Utc>,
) -> PipelineResult<RawInputs> {
    tokio::task::spawn_blocking(move || {
        let mut inputs = RawInputs::new();
        for variable in &variables {
            let slice = dataset.read_slice(variable, valid_time)?;
            inputs.insert(variable.clone(), slice);
        }
        Ok(inputs)
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("reader task panicked: {}", e)))?
}
