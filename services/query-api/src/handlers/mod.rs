//! HTTP handlers.

pub mod health;
pub mod points;
pub mod tiles;

use axum::http::{header, StatusCode};
use axum::response::Response;

use pipeline_common::PipelineError;

/// Map a pipeline error onto a JSON error response.
pub(crate) fn error_response(error: &PipelineError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.to_string().into())
        .unwrap()
}
