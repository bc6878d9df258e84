//! Variable Transformer: pure functions mapping raw grid slices to derived
//! variables.
//!
//! Two transform classes exist:
//! - **Stateless**: depends only on the current valid time's inputs
//!   (unit conversion, humidity from temperature + dew point, wind speed).
//! - **Temporal**: depends on the current and immediately preceding valid
//!   time (hourly precipitation from an accumulating field). The first
//!   valid time of a run has no predecessor and emits the no-data sentinel
//!   instead of failing.
//!
//! Numeric policy: no-data sentinels propagate through every transform, and
//! non-finite results (division blow-ups, overflow) become no-data rather
//! than leaking NaN/inf downstream. This is enforced by the slice
//! combinators in `pipeline-common`, so individual formulas stay plain.

pub mod stateless;
pub mod temporal;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pipeline_common::{GridSlice, PipelineError, PipelineResult};
use rayon::prelude::*;

pub use stateless::{RelativeHumidity2m, Temperature2m, WindSpeed10m};
pub use temporal::Precipitation1h;

/// Raw inputs for one valid time, keyed by raw variable name.
pub type RawInputs = HashMap<String, GridSlice>;

/// A named, unit-tagged derived slice.
///
/// Invariant: the slice keeps the input grid definition; no resampling
/// happens at this stage.
#[derive(Debug, Clone)]
pub struct DerivedVariable {
    pub name: String,
    pub unit: String,
    pub slice: GridSlice,
}

/// Transform classification, used by the coordinator to decide whether the
/// previous valid time's inputs must be carried along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Stateless,
    Temporal,
}

/// Per-timestep context handed to every transform.
pub struct TransformContext<'a> {
    pub valid_time: DateTime<Utc>,
    /// Raw inputs of the immediately preceding valid time, if any.
    pub previous: Option<&'a RawInputs>,
}

/// A pure derived-variable function.
pub trait Transform: Send + Sync {
    /// Derived variable name, e.g. "temperature_2m".
    fn name(&self) -> &'static str;

    /// Output unit.
    fn unit(&self) -> &'static str;

    fn kind(&self) -> TransformKind;

    /// Raw variable names this transform reads.
    fn inputs(&self) -> &'static [&'static str];

    fn apply(&self, inputs: &RawInputs, ctx: &TransformContext) -> PipelineResult<DerivedVariable>;
}

/// The default product set.
pub fn default_registry() -> Vec<Arc<dyn Transform>> {
    vec![
        Arc::new(Temperature2m),
        Arc::new(RelativeHumidity2m),
        Arc::new(WindSpeed10m),
        Arc::new(Precipitation1h),
    ]
}

/// Union of raw inputs required by a transform set.
pub fn required_inputs(transforms: &[Arc<dyn Transform>]) -> BTreeSet<String> {
    transforms
        .iter()
        .flat_map(|t| t.inputs().iter().map(|s| s.to_string()))
        .collect()
}

/// Apply every transform to one timestep's inputs, in parallel.
///
/// Transforms are independent over shared read-only inputs, so this is a
/// plain data-parallel map; output order matches the registry order.
pub fn apply_all(
    transforms: &[Arc<dyn Transform>],
    inputs: &RawInputs,
    ctx: &TransformContext,
) -> PipelineResult<Vec<DerivedVariable>> {
    transforms
        .par_iter()
        .map(|t| t.apply(inputs, ctx))
        .collect()
}

/// Fetch a required raw input or fail the transform.
pub(crate) fn require<'a>(inputs: &'a RawInputs, name: &str) -> PipelineResult<&'a GridSlice> {
    inputs
        .get(name)
        .ok_or_else(|| PipelineError::Transform(format!("missing required input: {}", name)))
}
