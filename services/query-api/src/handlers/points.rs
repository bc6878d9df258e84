//! Nearest-point series queries.

use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use pipeline_common::time::parse_iso8601;
use pipeline_common::{PipelineError, PipelineResult, TimeRange};
use storage::{Location, SeriesPoint};

use crate::handlers::error_response;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PointsParams {
    pub lat: f64,
    pub lon: f64,
    pub parameter: String,
    /// Optional ISO 8601 range bounds; both or neither.
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PointsResponse {
    pub location: Location,
    pub parameter: String,
    pub series: Vec<SeriesPoint>,
}

/// GET /points?lat&lon&parameter[&start&end]
pub async fn points_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<PointsParams>,
) -> Response {
    match points_response(&state, params).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Core of the points endpoint, separated from axum for testability.
pub async fn points_response(
    state: &AppState,
    params: PointsParams,
) -> PipelineResult<PointsResponse> {
    let range = parse_range(params.start.as_deref(), params.end.as_deref())?;

    let location = state
        .store
        .nearest_location(params.lat, params.lon)
        .await?
        .ok_or_else(|| PipelineError::NotFound("no published locations".to_string()))?;

    // An empty series is a valid answer, not an error
    let series = state
        .store
        .query_series(location.id, &params.parameter, range)
        .await?;

    Ok(PointsResponse {
        location,
        parameter: params.parameter,
        series,
    })
}

fn parse_range(start: Option<&str>, end: Option<&str>) -> PipelineResult<Option<TimeRange>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => {
            let start = parse_iso8601(start)
                .map_err(|e| PipelineError::SourceFormat(format!("invalid start: {}", e)))?;
            let end = parse_iso8601(end)
                .map_err(|e| PipelineError::SourceFormat(format!("invalid end: {}", e)))?;
            if end < start {
                return Err(PipelineError::SourceFormat(
                    "range end precedes start".to_string(),
                ));
            }
            Ok(Some(TimeRange::new(start, end)))
        }
        _ => Err(PipelineError::SourceFormat(
            "start and end must be given together".to_string(),
        )),
    }
}
