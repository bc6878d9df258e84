//! Dataset metadata descriptor.

use chrono::{DateTime, Utc};
use pipeline_common::{GridSpec, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

/// Metadata for one model run's output.
///
/// Immutable once extracted; the payload size is fully determined by
/// `grid`, `variables` and `times`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Model initialization time; identifies the run.
    pub reference_time: DateTime<Utc>,
    /// Spatial grid definition shared by every slice. Steps must be
    /// positive: rows scan west to east, south to north.
    pub grid: GridSpec,
    /// Raw variable names available in the payload, in payload order.
    pub variables: Vec<String>,
    /// Forecast valid times, in payload order.
    pub times: Vec<DateTime<Utc>>,
}

impl DatasetDescriptor {
    /// Expected payload size in bytes (4-byte f32 per cell).
    pub fn expected_payload_len(&self) -> u64 {
        4 * self.times.len() as u64 * self.variables.len() as u64 * self.grid.len() as u64
    }

    /// Structural validation of the descriptor itself.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.grid.is_empty() {
            return Err(PipelineError::SourceFormat(
                "descriptor declares an empty grid".to_string(),
            ));
        }
        if self.grid.dx <= 0.0 || self.grid.dy <= 0.0 {
            return Err(PipelineError::SourceFormat(format!(
                "grid steps must be positive, got dx={} dy={}",
                self.grid.dx, self.grid.dy
            )));
        }
        if self.variables.is_empty() {
            return Err(PipelineError::SourceFormat(
                "descriptor declares no variables".to_string(),
            ));
        }
        if self.times.is_empty() {
            return Err(PipelineError::SourceFormat(
                "descriptor declares no valid times".to_string(),
            ));
        }
        for pair in self.times.windows(2) {
            if pair[1] <= pair[0] {
                return Err(PipelineError::SourceFormat(
                    "valid times must be strictly increasing".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Position of a variable in payload order.
    pub fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    /// Position of a valid time in payload order.
    pub fn time_index(&self, valid_time: DateTime<Utc>) -> Option<usize> {
        self.times.iter().position(|t| *t == valid_time)
    }
}
