//! Storage layer: the spatial record model, the staging/promotion store
//! traits, and the two store backends (in-memory and PostgreSQL).
//!
//! Writes go through a staging batch bound to one model-run reference time.
//! Promotion is a single metadata-level swap, so readers see either the
//! previous publication for that run or the new one, never a mix.

pub mod location;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod store;

pub use location::LocationIndex;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use records::{BatchId, Location, LocationId, RecordProfile, SpatialRecord};
pub use store::{ForecastStore, LocationCatalog, SeriesPoint, TileQueryResult};
