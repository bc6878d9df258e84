//! Slice-at-a-time reader over a dataset directory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use pipeline_common::{GridSlice, PipelineError, PipelineResult};

use crate::descriptor::DatasetDescriptor;
use crate::{MANIFEST_FILE, PAYLOAD_FILE};

/// An opened dataset: validated descriptor plus the payload path.
///
/// Opening verifies the payload size against the descriptor; slices are
/// read lazily with a seek per slice, never the whole payload at once.
#[derive(Debug)]
pub struct GridDataset {
    descriptor: DatasetDescriptor,
    payload_path: PathBuf,
}

impl GridDataset {
    /// Open a dataset directory and validate its contract.
    pub fn open(source: &Path) -> PipelineResult<Self> {
        let manifest_path = source.join(MANIFEST_FILE);
        let manifest = std::fs::read_to_string(&manifest_path).map_err(|e| {
            PipelineError::SourceFormat(format!(
                "cannot read {}: {}",
                manifest_path.display(),
                e
            ))
        })?;

        let descriptor: DatasetDescriptor = serde_json::from_str(&manifest)
            .map_err(|e| PipelineError::SourceFormat(format!("invalid manifest: {}", e)))?;
        descriptor.validate()?;

        let payload_path = source.join(PAYLOAD_FILE);
        let actual_len = std::fs::metadata(&payload_path)
            .map_err(|e| {
                PipelineError::SourceFormat(format!(
                    "cannot stat {}: {}",
                    payload_path.display(),
                    e
                ))
            })?
            .len();

        let expected_len = descriptor.expected_payload_len();
        if actual_len != expected_len {
            return Err(PipelineError::SourceFormat(format!(
                "payload is {} bytes, descriptor requires {}",
                actual_len, expected_len
            )));
        }

        debug!(
            reference_time = %descriptor.reference_time,
            variables = descriptor.variables.len(),
            times = descriptor.times.len(),
            "Opened dataset"
        );

        Ok(Self {
            descriptor,
            payload_path,
        })
    }

    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    /// Read the slice for one variable at one valid time.
    pub fn read_slice(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
    ) -> PipelineResult<GridSlice> {
        let var_idx = self.descriptor.variable_index(variable).ok_or_else(|| {
            PipelineError::SourceFormat(format!("variable not in dataset: {}", variable))
        })?;
        let time_idx = self
            .descriptor
            .time_index(valid_time)
            .ok_or(PipelineError::MissingTimestamp(valid_time))?;

        let cells = self.descriptor.grid.len();
        let slice_bytes = cells * 4;
        let offset =
            ((time_idx * self.descriptor.variables.len() + var_idx) * slice_bytes) as u64;

        let mut file = File::open(&self.payload_path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; slice_bytes];
        file.read_exact(&mut buf).map_err(|e| {
            PipelineError::SourceFormat(format!("short read at offset {}: {}", offset, e))
        })?;

        let values: Vec<f32> = buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        GridSlice::new(self.descriptor.grid.clone(), values)
    }
}
