//! Grid Reader: opens a gridded dataset and exposes typed slices.
//!
//! A dataset source is a directory containing:
//! - `manifest.json` — the [`DatasetDescriptor`]: run reference time, grid
//!   definition, variable list, valid-time list.
//! - `data.bin` — flat little-endian f32 payload, layout
//!   `[time][variable][row-major grid]`, whose size is fully determined by
//!   the descriptor.
//!
//! The reader is read-only and reads one slice at a time, so peak memory is
//! bounded by a single grid regardless of dataset size.

pub mod descriptor;
pub mod reader;

pub use descriptor::DatasetDescriptor;
pub use reader::GridDataset;

/// Manifest file name inside a dataset directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Payload file name inside a dataset directory.
pub const PAYLOAD_FILE: &str = "data.bin";
