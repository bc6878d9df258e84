//! Pipeline Coordinator: drives one model run from source dataset to
//! promoted publication.

pub mod coordinator;
pub mod run;

pub use coordinator::Coordinator;
pub use run::{RunFailure, RunResult, RunStage};
