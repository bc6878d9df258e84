//! Pipeline runner service library.

pub mod config;
pub mod server;
