//! HTTP surface of the runner.
//!
//! `POST /runs` triggers one ingest run over a source dataset directory,
//! `GET /runs` reports active and recently finished runs, `GET /health`
//! is the liveness probe.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use pipeline::{Coordinator, RunFailure, RunResult, RunStage};

/// Shared state for the HTTP server.
pub struct RunnerState {
    pub coordinator: Coordinator,
    pub tracker: RunTracker,
}

impl RunnerState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            tracker: RunTracker::new(),
        }
    }
}

/// Request body for `POST /runs`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Directory holding the dataset manifest and payload.
    pub source_path: String,
}

/// Response body for `POST /runs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<RunStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&RunResult> for RunResponse {
    fn from(result: &RunResult) -> Self {
        Self {
            success: true,
            reference_time: Some(result.reference_time),
            promoted_count: Some(result.promoted_count),
            stage: None,
            error: None,
        }
    }
}

impl From<&RunFailure> for RunResponse {
    fn from(failure: &RunFailure) -> Self {
        Self {
            success: false,
            reference_time: None,
            promoted_count: None,
            stage: Some(failure.stage),
            error: Some(failure.message.clone()),
        }
    }
}

/// Tracking for run operations.
pub struct RunTracker {
    active: Mutex<HashMap<String, ActiveRun>>,
    completed: Mutex<VecDeque<CompletedRun>>,
    max_completed: usize,
}

/// A run currently in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub id: String,
    pub source_path: String,
    pub started_at: DateTime<Utc>,
}

/// A finished run, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedRun {
    pub id: String,
    pub source_path: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub reference_time: Option<DateTime<Utc>>,
    pub promoted_count: u64,
    pub stage: Option<RunStage>,
    pub error: Option<String>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            max_completed: 100,
        }
    }

    pub async fn start(&self, id: &str, source_path: &str) {
        let run = ActiveRun {
            id: id.to_string(),
            source_path: source_path.to_string(),
            started_at: Utc::now(),
        };
        self.active.lock().await.insert(id.to_string(), run);
    }

    pub async fn complete(&self, id: &str, outcome: &Result<RunResult, RunFailure>) {
        let mut active = self.active.lock().await;
        let Some(run) = active.remove(id) else {
            return;
        };
        let completed_at = Utc::now();
        let duration_ms = (completed_at - run.started_at).num_milliseconds() as u64;

        let completed = match outcome {
            Ok(result) => CompletedRun {
                id: run.id,
                source_path: run.source_path,
                started_at: run.started_at,
                completed_at,
                duration_ms,
                success: true,
                reference_time: Some(result.reference_time),
                promoted_count: result.promoted_count,
                stage: None,
                error: None,
            },
            Err(failure) => CompletedRun {
                id: run.id,
                source_path: run.source_path,
                started_at: run.started_at,
                completed_at,
                duration_ms,
                success: false,
                reference_time: None,
                promoted_count: 0,
                stage: Some(failure.stage),
                error: Some(failure.message.clone()),
            },
        };

        let mut completed_list = self.completed.lock().await;
        completed_list.push_front(completed);
        while completed_list.len() > self.max_completed {
            completed_list.pop_back();
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let active = self.active.lock().await;
        let completed = self.completed.lock().await;
        StatusResponse {
            active: active.values().cloned().collect(),
            recent: completed.iter().take(20).cloned().collect(),
            total_completed: completed.len(),
        }
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Response for `GET /runs`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub active: Vec<ActiveRun>,
    pub recent: Vec<CompletedRun>,
    pub total_completed: usize,
}

/// Run one source through the coordinator, tracking it start to finish.
pub async fn execute_run(state: &RunnerState, source_path: &str) -> RunResponse {
    let id = Uuid::new_v4().to_string();
    info!(id = %id, source_path = %source_path, "run requested");

    state.tracker.start(&id, source_path).await;

    let outcome = state
        .coordinator
        .run(Path::new(source_path), &AtomicBool::new(false))
        .await;
    state.tracker.complete(&id, &outcome).await;

    match &outcome {
        Ok(result) => {
            info!(
                id = %id,
                reference_time = %result.reference_time,
                promoted_count = result.promoted_count,
                "run promoted"
            );
            RunResponse::from(result)
        }
        Err(failure) => {
            error!(id = %id, stage = %failure.stage, error = %failure.message, "run failed");
            RunResponse::from(failure)
        }
    }
}

/// POST /runs
pub async fn trigger_run_handler(
    Extension(state): Extension<Arc<RunnerState>>,
    Json(request): Json<RunRequest>,
) -> impl IntoResponse {
    let response = execute_run(&state, &request.source_path).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response))
}

/// GET /runs
pub async fn run_status_handler(
    Extension(state): Extension<Arc<RunnerState>>,
) -> impl IntoResponse {
    Json(state.tracker.status().await)
}

/// GET /health
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pipeline-runner",
    }))
}
