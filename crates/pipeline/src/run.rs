//! Run lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipeline_common::ErrorKind;

/// Stages of one ingest run.
///
/// Transitions are strictly forward; `Failed` is reachable from every
/// non-terminal stage and `Done` only from `Promoting`. A run that fails
/// in `Staging` never reaches `Promoting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Pending,
    Extracting,
    Transforming,
    Building,
    Staging,
    Promoting,
    Done,
    Failed,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Done | RunStage::Failed)
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStage::Pending => "pending",
            RunStage::Extracting => "extracting",
            RunStage::Transforming => "transforming",
            RunStage::Building => "building",
            RunStage::Staging => "staging",
            RunStage::Promoting => "promoting",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Structured failure report handed back to the external trigger. The
/// pipeline never retries internally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    /// Stage the run was in when it failed.
    pub stage: RunStage,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run failed in {}: [{}] {}", self.stage, self.kind, self.message)
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub reference_time: DateTime<Utc>,
    pub promoted_count: u64,
    pub timesteps: usize,
    pub variables: Vec<String>,
}
