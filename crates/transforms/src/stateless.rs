//! Stateless transforms: depend only on the current valid time's inputs.

use pipeline_common::{PipelineResult, NO_DATA};

use crate::{require, DerivedVariable, RawInputs, Transform, TransformContext, TransformKind};

const KELVIN_OFFSET: f32 = 273.15;

/// 2 m air temperature, Kelvin to Celsius.
pub struct Temperature2m;

impl Transform for Temperature2m {
    fn name(&self) -> &'static str {
        "temperature_2m"
    }

    fn unit(&self) -> &'static str {
        "degC"
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Stateless
    }

    fn inputs(&self) -> &'static [&'static str] {
        &["t2m"]
    }

    fn apply(&self, inputs: &RawInputs, _ctx: &TransformContext) -> PipelineResult<DerivedVariable> {
        let t2m = require(inputs, "t2m")?;
        Ok(DerivedVariable {
            name: self.name().to_string(),
            unit: self.unit().to_string(),
            slice: t2m.map(|k| k - KELVIN_OFFSET),
        })
    }
}

/// 2 m relative humidity from temperature and dew point.
///
/// Uses the Magnus saturation-vapor-pressure approximation:
/// `es(T) = 6.112 * exp(17.67 T / (T + 243.5))` with T in Celsius.
pub struct RelativeHumidity2m;

/// Saturation vapor pressure (hPa) for a temperature in Celsius.
fn saturation_vapor_pressure(t_c: f32) -> f32 {
    6.112 * (17.67 * t_c / (t_c + 243.5)).exp()
}

impl Transform for RelativeHumidity2m {
    fn name(&self) -> &'static str {
        "relative_humidity_2m"
    }

    fn unit(&self) -> &'static str {
        "%"
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Stateless
    }

    fn inputs(&self) -> &'static [&'static str] {
        &["t2m", "d2m"]
    }

    fn apply(&self, inputs: &RawInputs, _ctx: &TransformContext) -> PipelineResult<DerivedVariable> {
        let t2m = require(inputs, "t2m")?;
        let d2m = require(inputs, "d2m")?;

        let slice = t2m.zip_map(d2m, |t_k, d_k| {
            let t_c = t_k - KELVIN_OFFSET;
            let d_c = d_k - KELVIN_OFFSET;
            // Magnus denominator goes singular near -243.5C; such cells
            // carry no physical meaning, so they become no-data.
            if (t_c + 243.5).abs() < 1.0 || (d_c + 243.5).abs() < 1.0 {
                return NO_DATA;
            }
            let es = saturation_vapor_pressure(t_c);
            if es < 1e-6 {
                return NO_DATA;
            }
            let rh = 100.0 * saturation_vapor_pressure(d_c) / es;
            rh.clamp(0.0, 100.0)
        })?;

        Ok(DerivedVariable {
            name: self.name().to_string(),
            unit: self.unit().to_string(),
            slice,
        })
    }
}

/// 10 m wind speed from the u/v components.
pub struct WindSpeed10m;

impl Transform for WindSpeed10m {
    fn name(&self) -> &'static str {
        "wind_speed_10m"
    }

    fn unit(&self) -> &'static str {
        "m/s"
    }

    fn kind(&self) -> TransformKind {
        TransformKind::Stateless
    }

    fn inputs(&self) -> &'static [&'static str] {
        &["u10", "v10"]
    }

    fn apply(&self, inputs: &RawInputs, _ctx: &TransformContext) -> PipelineResult<DerivedVariable> {
        let u = require(inputs, "u10")?;
        let v = require(inputs, "v10")?;
        Ok(DerivedVariable {
            name: self.name().to_string(),
            unit: self.unit().to_string(),
            slice: u.zip_map(v, f32::hypot)?,
        })
    }
}
