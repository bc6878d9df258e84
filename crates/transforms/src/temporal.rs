//! Temporal transforms: depend on the current and preceding valid time.

use pipeline_common::{GridSlice, PipelineResult};

use crate::{require, DerivedVariable, RawInputs, Transform, TransformContext, TransformKind};

/// Hourly precipitation from the model's accumulating precipitation field.
///
/// The first valid time of a run has no predecessor; the accumulation
/// interval is unknown there, so the whole slice is emitted as no-data
/// rather than failing the run. Negative differences (accumulator reset)
/// clamp to zero.
pub struct Precipitation1h;

impl Transform for Precipitation1h {
    fn name(&self) -> &'static str {
        "precipitation_1h"
    }

    fn unit(&self) -> &'static str {
        "mm"
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Temporal
    }

    fn inputs(&self) -> &'static [&'static str] {
        &["precip_acc"]
    }

    fn apply(&self, inputs: &RawInputs, ctx: &TransformContext) -> PipelineResult<DerivedVariable> {
        let current = require(inputs, "precip_acc")?;

        let slice = match ctx.previous {
            Some(previous_inputs) => {
                let previous = require(previous_inputs, "precip_acc")?;
                current.zip_map(previous, |cur, prev| (cur - prev).max(0.0))?
            }
            None => GridSlice::filled_no_data(current.spec().clone()),
        };

        Ok(DerivedVariable {
            name: self.name().to_string(),
            unit: self.unit().to_string(),
            slice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pipeline_common::grid::is_no_data;
    use pipeline_common::GridSpec;

    fn slice(values: Vec<f32>) -> GridSlice {
        GridSlice::new(GridSpec::new(2, 2, 0.5, 0.5, -50.0, -17.0), values).unwrap()
    }

    fn inputs(acc: Vec<f32>) -> RawInputs {
        let mut m = RawInputs::new();
        m.insert("precip_acc".to_string(), slice(acc));
        m
    }

    #[test]
    fn test_first_timestep_emits_sentinel() {
        let ctx = TransformContext {
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap(),
            previous: None,
        };

        let out = Precipitation1h.apply(&inputs(vec![2.0; 4]), &ctx).unwrap();
        assert!(out.slice.values().iter().all(|v| is_no_data(*v)));
    }

    #[test]
    fn test_hourly_difference() {
        let previous = inputs(vec![1.0, 2.0, 3.0, 4.0]);
        let ctx = TransformContext {
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
            previous: Some(&previous),
        };

        let out = Precipitation1h
            .apply(&inputs(vec![1.5, 4.0, 3.0, 6.0]), &ctx)
            .unwrap();
        assert_eq!(out.slice.values(), &[0.5, 2.0, 0.0, 2.0]);
    }

    #[test]
    fn test_accumulator_reset_clamps_to_zero() {
        let previous = inputs(vec![10.0; 4]);
        let ctx = TransformContext {
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
            previous: Some(&previous),
        };

        let out = Precipitation1h.apply(&inputs(vec![0.5; 4]), &ctx).unwrap();
        assert_eq!(out.slice.values(), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_no_data_in_either_input_propagates() {
        let mut prev_vals = vec![1.0_f32; 4];
        prev_vals[1] = pipeline_common::NO_DATA;
        let previous = inputs(prev_vals);

        let mut cur_vals = vec![2.0_f32; 4];
        cur_vals[2] = pipeline_common::NO_DATA;

        let ctx = TransformContext {
            valid_time: Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
            previous: Some(&previous),
        };

        let out = Precipitation1h.apply(&inputs(cur_vals), &ctx).unwrap();
        assert!(is_no_data(out.slice.values()[1]));
        assert!(is_no_data(out.slice.values()[2]));
        assert_eq!(out.slice.values()[0], 1.0);
    }
}
