//! Query/Tile service library.

pub mod config;
pub mod handlers;
pub mod png;
pub mod state;
pub mod tile_cache;
