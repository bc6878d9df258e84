//! Common types and utilities shared across all forecast-pipeline crates.

pub mod bbox;
pub mod error;
pub mod grid;
pub mod tile;
pub mod time;

pub use bbox::BoundingBox;
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use grid::{is_no_data, GridSlice, GridSpec, NO_DATA};
pub use tile::TileCoord;
pub use time::TimeRange;
