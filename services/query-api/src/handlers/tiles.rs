//! On-demand XYZ tile generation from promoted records.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;

use pipeline_common::tile::tile_bbox;
use pipeline_common::time::parse_iso8601;
use pipeline_common::{is_no_data, PipelineError, PipelineResult, TileCoord, NO_DATA};
use storage::{Location, SpatialRecord, TileQueryResult};

use crate::handlers::error_response;
use crate::png;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TileParams {
    pub parameter: String,
    /// Forecast valid time, ISO 8601.
    pub time: String,
}

/// A generated tile body.
#[derive(Debug)]
pub struct TileBody {
    pub content_type: &'static str,
    pub body: Bytes,
}

/// GET /tiles/:z/:x/:y?parameter&time
pub async fn tiles_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((z, x, y)): Path<(u32, u32, u32)>,
    Query(params): Query<TileParams>,
) -> Response {
    match tile_response(&state, TileCoord::new(z, x, y), &params).await {
        Ok(tile) => Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, tile.content_type)
            .header(header::CACHE_CONTROL, "max-age=300")
            .body(tile.body.into())
            .unwrap(),
        Err(e) => error_response(&e),
    }
}

/// Core of the tile endpoint, separated from axum for testability.
pub async fn tile_response(
    state: &AppState,
    coord: TileCoord,
    params: &TileParams,
) -> PipelineResult<TileBody> {
    if !coord.is_valid() {
        return Err(PipelineError::SourceFormat(format!(
            "tile {} out of range at zoom {}",
            coord.cache_key(),
            coord.z
        )));
    }
    let valid_time = parse_iso8601(&params.time)
        .map_err(|e| PipelineError::SourceFormat(format!("invalid time: {}", e)))?;

    // Cache keys carry the promotion stamp; a re-promotion changes the
    // stamp and the stale entries simply stop matching.
    let promoted_at = state.store.last_promoted_at().await?;
    if let Some(hit) = state
        .tile_cache
        .get(&coord, &params.parameter, valid_time, promoted_at)
        .await
    {
        return Ok(TileBody {
            content_type: hit.content_type,
            body: hit.body,
        });
    }

    let bbox = tile_bbox(&coord);
    let extent = state
        .store
        .production_extent(&params.parameter)
        .await?
        .ok_or_else(|| {
            PipelineError::NotFound(format!("no promoted data for {}", params.parameter))
        })?;
    if !extent.intersects(&bbox) {
        return Err(PipelineError::NotFound(format!(
            "tile {} outside production extent",
            coord.cache_key()
        )));
    }

    let result = state
        .store
        .query_tile(&params.parameter, valid_time, &bbox)
        .await?;
    if result.is_empty() {
        return Err(PipelineError::NotFound(format!(
            "no promoted data for {} at {}",
            params.parameter, valid_time
        )));
    }

    let tile = match result {
        TileQueryResult::Raster(tiles) => render_raster(&coord, &tiles)?,
        TileQueryResult::Points(points) => render_geojson(&params.parameter, &points)?,
    };

    state
        .tile_cache
        .put(
            &coord,
            &params.parameter,
            valid_time,
            promoted_at,
            tile.content_type,
            tile.body.clone(),
        )
        .await;
    Ok(tile)
}

/// Decoded stored raster tile.
struct SourceTile {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    width: usize,
    height: usize,
    cells: Vec<f32>,
}

/// Nearest-neighbor resample of stored raster tiles into one 256x256
/// grayscale+alpha PNG. Pixel rows map to latitude through the inverse
/// Web-Mercator projection; stored tiles are regular lat/lon grids, so
/// sampling inside one tile is linear.
fn render_raster(coord: &TileCoord, tiles: &[SpatialRecord]) -> PipelineResult<TileBody> {
    let sources: Vec<SourceTile> = tiles.iter().filter_map(decode_raster).collect();
    if sources.is_empty() {
        return Err(PipelineError::Internal(
            "raster records carried no decodable payload".to_string(),
        ));
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for source in &sources {
        for &value in &source.cells {
            if !is_no_data(value) {
                min = min.min(value);
                max = max.max(value);
            }
        }
    }
    if min > max {
        // All cells are no-data; encode a fully transparent tile
        min = 0.0;
        max = 1.0;
    }

    let n = (1u64 << coord.z) as f64;
    let size = png::TILE_PIXELS;
    let mut values = vec![NO_DATA; size * size];
    for py in 0..size {
        let global_y = coord.y as f64 + (py as f64 + 0.5) / size as f64;
        let lat = (std::f64::consts::PI * (1.0 - 2.0 * global_y / n))
            .sinh()
            .atan()
            .to_degrees();
        for px in 0..size {
            let global_x = coord.x as f64 + (px as f64 + 0.5) / size as f64;
            let lon = global_x / n * 360.0 - 180.0;
            values[py * size + px] = sample(&sources, lon, lat);
        }
    }

    let bytes = png::encode_grayscale_alpha(&values, size, size, min, max)
        .map_err(PipelineError::Internal)?;
    Ok(TileBody {
        content_type: "image/png",
        body: Bytes::from(bytes),
    })
}

fn decode_raster(record: &SpatialRecord) -> Option<SourceTile> {
    let SpatialRecord::Raster {
        bbox,
        width,
        height,
        payload,
        ..
    } = record
    else {
        return None;
    };

    let cells: Vec<f32> = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    if cells.len() != *width as usize * *height as usize {
        return None;
    }

    Some(SourceTile {
        min_x: bbox.min_x,
        min_y: bbox.min_y,
        max_x: bbox.max_x,
        max_y: bbox.max_y,
        width: *width as usize,
        height: *height as usize,
        cells,
    })
}

fn sample(sources: &[SourceTile], lon: f64, lat: f64) -> f32 {
    for source in sources {
        if lon < source.min_x || lon > source.max_x || lat < source.min_y || lat > source.max_y {
            continue;
        }
        let fx = (lon - source.min_x) / (source.max_x - source.min_x).max(f64::EPSILON);
        let fy = (lat - source.min_y) / (source.max_y - source.min_y).max(f64::EPSILON);
        let i = ((fx * (source.width - 1) as f64).round() as usize).min(source.width - 1);
        let j = ((fy * (source.height - 1) as f64).round() as usize).min(source.height - 1);
        return source.cells[j * source.width + i];
    }
    NO_DATA
}

/// GeoJSON FeatureCollection of the point records inside the tile.
fn render_geojson(parameter: &str, points: &[(Location, f64)]) -> PipelineResult<TileBody> {
    let features: Vec<serde_json::Value> = points
        .iter()
        .map(|(location, value)| {
            serde_json::json!({
                "type": "Feature",
                "geometry": {
                    "type": "Point",
                    "coordinates": [location.lon, location.lat],
                },
                "properties": {
                    "location_id": location.id,
                    "parameter": parameter,
                    "value": value,
                },
            })
        })
        .collect();

    let collection = serde_json::json!({
        "type": "FeatureCollection",
        "features": features,
    });

    Ok(TileBody {
        content_type: "application/geo+json",
        body: Bytes::from(collection.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pipeline_common::tile::latlon_to_tile;
    use pipeline_common::BoundingBox;
    use std::time::Duration;
    use storage::{ForecastStore, LocationCatalog, MemoryStore};

    use crate::config::ApiConfig;

    fn config() -> ApiConfig {
        ApiConfig {
            database_url: None,
            tile_cache_capacity: 16,
            tile_cache_ttl: Duration::from_secs(60),
        }
    }

    fn valid_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap()
    }

    fn raster_record(values: &[f32], width: u32, height: u32) -> SpatialRecord {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        SpatialRecord::Raster {
            tile_row: 0,
            tile_col: 0,
            variable: "temperature_2m".to_string(),
            valid_time: valid_time(),
            bbox: BoundingBox::new(-50.0, -17.5, -48.0, -15.5),
            width,
            height,
            payload,
        }
    }

    async fn raster_state() -> AppState {
        let store = std::sync::Arc::new(MemoryStore::new());
        let batch = store
            .begin_batch(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
            .await
            .unwrap();
        store
            .stage(batch, &[raster_record(&[20.0, 25.0, 30.0, 35.0], 2, 2)])
            .await
            .unwrap();
        store.promote(batch).await.unwrap();
        AppState::with_store(store, &config())
    }

    #[tokio::test]
    async fn test_raster_tile_is_png() {
        let state = raster_state().await;
        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-10T01:00:00Z".to_string(),
        };

        let tile = tile_response(&state, coord, &params).await.unwrap();
        assert_eq!(tile.content_type, "image/png");
        assert_eq!(&tile.body[..8], &[137, 80, 78, 71, 13, 10, 26, 10]);
    }

    #[tokio::test]
    async fn test_tile_outside_extent_is_not_found() {
        let state = raster_state().await;
        // A tile over the Atlantic, far from the production extent
        let coord = latlon_to_tile(0.0, 0.0, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-10T01:00:00Z".to_string(),
        };

        let err = tile_response(&state, coord, &params).await.unwrap_err();
        assert_eq!(err.http_status_code(), 404);
    }

    #[tokio::test]
    async fn test_unpublished_time_is_not_found() {
        let state = raster_state().await;
        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-11T01:00:00Z".to_string(),
        };

        let err = tile_response(&state, coord, &params).await.unwrap_err();
        assert_eq!(err.http_status_code(), 404);
    }

    #[tokio::test]
    async fn test_invalid_time_is_bad_request() {
        let state = raster_state().await;
        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "not-a-time".to_string(),
        };

        let err = tile_response(&state, coord, &params).await.unwrap_err();
        assert_eq!(err.http_status_code(), 400);
    }

    #[tokio::test]
    async fn test_point_profile_serves_geojson() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let ids = store.resolve_locations(&[(-49.25, -16.68)]).await.unwrap();
        let batch = store
            .begin_batch(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
            .await
            .unwrap();
        store
            .stage(
                batch,
                &[SpatialRecord::Point {
                    location: ids[0],
                    variable: "temperature_2m".to_string(),
                    valid_time: valid_time(),
                    value: 28.4,
                }],
            )
            .await
            .unwrap();
        store.promote(batch).await.unwrap();
        let state = AppState::with_store(store, &config());

        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-10T01:00:00Z".to_string(),
        };

        let tile = tile_response(&state, coord, &params).await.unwrap();
        assert_eq!(tile.content_type, "application/geo+json");
        let body: serde_json::Value = serde_json::from_slice(&tile.body).unwrap();
        assert_eq!(body["type"], "FeatureCollection");
        assert_eq!(body["features"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_request_served_from_cache() {
        let state = raster_state().await;
        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-10T01:00:00Z".to_string(),
        };

        let first = tile_response(&state, coord, &params).await.unwrap();
        let second = tile_response(&state, coord, &params).await.unwrap();
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn test_repromotion_bypasses_cached_tile() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let batch = store
            .begin_batch(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
            .await
            .unwrap();
        store
            .stage(batch, &[raster_record(&[20.0, 25.0, 30.0, 35.0], 2, 2)])
            .await
            .unwrap();
        store.promote(batch).await.unwrap();
        let state = AppState::with_store(store.clone(), &config());

        let coord = latlon_to_tile(-16.68, -49.25, 8);
        let params = TileParams {
            parameter: "temperature_2m".to_string(),
            time: "2024-03-10T01:00:00Z".to_string(),
        };
        let before = tile_response(&state, coord, &params).await.unwrap();

        // Rerun of the same reference time with different values; the
        // long TTL alone would keep serving the first tile.
        let rerun = store
            .begin_batch(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap())
            .await
            .unwrap();
        store
            .stage(rerun, &[raster_record(&[20.0, 20.0, 20.0, 20.0], 2, 2)])
            .await
            .unwrap();
        store.promote(rerun).await.unwrap();

        let after = tile_response(&state, coord, &params).await.unwrap();
        assert_ne!(before.body, after.body);
    }
}
