//! Record types staged into and served from a [`crate::ForecastStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pipeline_common::{BoundingBox, PipelineError, PipelineResult};

/// Identifier of one staging batch. Each batch belongs to exactly one
/// model-run reference time.
pub type BatchId = Uuid;

/// Stable identifier of a quantized grid coordinate in the location catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i64);

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A catalog location with its exact coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub lon: f64,
    pub lat: f64,
}

/// Which record shape a deployment produces and serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordProfile {
    Raster,
    Point,
}

/// One storable unit of derived forecast data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpatialRecord {
    /// One real value at one catalog location and valid time.
    Point {
        location: LocationId,
        variable: String,
        valid_time: DateTime<Utc>,
        value: f64,
    },
    /// One fixed-size raster tile: single-band little-endian f32 payload.
    Raster {
        tile_row: u32,
        tile_col: u32,
        variable: String,
        valid_time: DateTime<Utc>,
        bbox: BoundingBox,
        width: u32,
        height: u32,
        payload: Vec<u8>,
    },
}

impl SpatialRecord {
    pub fn variable(&self) -> &str {
        match self {
            SpatialRecord::Point { variable, .. } => variable,
            SpatialRecord::Raster { variable, .. } => variable,
        }
    }

    pub fn valid_time(&self) -> DateTime<Utc> {
        match self {
            SpatialRecord::Point { valid_time, .. } => *valid_time,
            SpatialRecord::Raster { valid_time, .. } => *valid_time,
        }
    }

    /// Staging-time validation. A record failing this check poisons the
    /// whole batch it was staged into.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.variable().is_empty() {
            return Err(PipelineError::Staging(
                "record has an empty variable name".to_string(),
            ));
        }

        match self {
            SpatialRecord::Point { value, .. } => {
                if !value.is_finite() {
                    return Err(PipelineError::Staging(format!(
                        "non-finite point value for {}",
                        self.variable()
                    )));
                }
            }
            SpatialRecord::Raster {
                width,
                height,
                payload,
                ..
            } => {
                if *width == 0 || *height == 0 {
                    return Err(PipelineError::Staging(format!(
                        "raster record for {} has zero dimensions ({}x{})",
                        self.variable(),
                        width,
                        height
                    )));
                }
                let expected = *width as usize * *height as usize * 4;
                if payload.len() != expected {
                    return Err(PipelineError::Staging(format!(
                        "raster payload is {} bytes, expected {} for {}x{}",
                        payload.len(),
                        expected,
                        width,
                        height
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap()
    }

    #[test]
    fn test_valid_point_passes() {
        let rec = SpatialRecord::Point {
            location: LocationId(1),
            variable: "temperature_2m".to_string(),
            valid_time: ts(),
            value: 28.4,
        };
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn test_non_finite_point_rejected() {
        let rec = SpatialRecord::Point {
            location: LocationId(1),
            variable: "temperature_2m".to_string(),
            valid_time: ts(),
            value: f64::NAN,
        };
        assert!(matches!(
            rec.validate().unwrap_err(),
            PipelineError::Staging(_)
        ));
    }

    #[test]
    fn test_empty_variable_rejected() {
        let rec = SpatialRecord::Point {
            location: LocationId(1),
            variable: String::new(),
            valid_time: ts(),
            value: 1.0,
        };
        assert!(rec.validate().is_err());
    }

    #[test]
    fn test_zero_dimension_raster_rejected() {
        let rec = SpatialRecord::Raster {
            tile_row: 0,
            tile_col: 0,
            variable: "temperature_2m".to_string(),
            valid_time: ts(),
            bbox: BoundingBox::new(-50.0, -17.0, -49.0, -16.0),
            width: 0,
            height: 0,
            payload: Vec::new(),
        };
        assert!(matches!(
            rec.validate().unwrap_err(),
            PipelineError::Staging(_)
        ));
    }

    #[test]
    fn test_raster_payload_size_checked() {
        let rec = SpatialRecord::Raster {
            tile_row: 0,
            tile_col: 0,
            variable: "temperature_2m".to_string(),
            valid_time: ts(),
            bbox: BoundingBox::new(-50.0, -17.0, -49.0, -16.0),
            width: 4,
            height: 4,
            payload: vec![0u8; 63],
        };
        assert!(rec.validate().is_err());

        let ok = SpatialRecord::Raster {
            tile_row: 0,
            tile_col: 0,
            variable: "temperature_2m".to_string(),
            valid_time: ts(),
            bbox: BoundingBox::new(-50.0, -17.0, -49.0, -16.0),
            width: 4,
            height: 4,
            payload: vec![0u8; 64],
        };
        assert!(ok.validate().is_ok());
    }
}
