//! PostgreSQL store backend using sqlx.
//!
//! Staged records live in `staged_points` / `staged_rasters` keyed by
//! batch id. Promotion never copies rows: it upserts a single
//! `published_batches` row mapping the reference time to the batch, inside
//! one transaction, and drops the batch it replaced. Readers join through
//! `published_batches`, so the swap is atomic from their point of view.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use pipeline_common::{BoundingBox, PipelineError, PipelineResult, TimeRange};

use crate::location::quantize;
use crate::records::{BatchId, Location, LocationId, SpatialRecord};
use crate::store::{ForecastStore, LocationCatalog, SeriesPoint, TileQueryResult};

/// PostgreSQL-backed [`ForecastStore`].
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect from a database URL.
    pub async fn connect(database_url: &str) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| PipelineError::Database(format!("Connection failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Run idempotent schema migrations.
    pub async fn migrate(&self) -> PipelineResult<()> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| PipelineError::Database(format!("Migration failed: {}", e)))?;
            }
        }

        Ok(())
    }

    async fn batch_state(&self, batch: BatchId) -> PipelineResult<Option<(DateTime<Utc>, bool)>> {
        let row = sqlx::query(
            "SELECT reference_time, poisoned FROM staging_batches WHERE id = $1",
        )
        .bind(batch)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        Ok(row.map(|r| (r.get("reference_time"), r.get("poisoned"))))
    }

    async fn poison(&self, batch: BatchId) -> PipelineResult<()> {
        sqlx::query("UPDATE staging_batches SET poisoned = TRUE WHERE id = $1")
            .bind(batch)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Database(format!("Update failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl LocationCatalog for PostgresStore {
    async fn resolve_locations(&self, coords: &[(f64, f64)]) -> PipelineResult<Vec<LocationId>> {
        if coords.is_empty() {
            return Ok(Vec::new());
        }

        let mut qlons = Vec::with_capacity(coords.len());
        let mut qlats = Vec::with_capacity(coords.len());
        let mut lons = Vec::with_capacity(coords.len());
        let mut lats = Vec::with_capacity(coords.len());
        for (lon, lat) in coords {
            qlons.push(quantize(*lon));
            qlats.push(quantize(*lat));
            lons.push(*lon);
            lats.push(*lat);
        }

        // Two round trips total: insert the unseen coordinates, then read
        // every id back in one query.
        sqlx::query(
            "INSERT INTO locations (qlon, qlat, lon, lat) \
             SELECT * FROM UNNEST($1::bigint[], $2::bigint[], $3::float8[], $4::float8[]) \
             ON CONFLICT (qlon, qlat) DO NOTHING",
        )
        .bind(&qlons)
        .bind(&qlats)
        .bind(&lons)
        .bind(&lats)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Insert failed: {}", e)))?;

        let rows = sqlx::query(
            "SELECT l.id, l.qlon, l.qlat FROM locations l \
             JOIN UNNEST($1::bigint[], $2::bigint[]) AS u(qlon, qlat) \
             ON l.qlon = u.qlon AND l.qlat = u.qlat",
        )
        .bind(&qlons)
        .bind(&qlats)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        let mut by_coord: HashMap<(i64, i64), i64> = HashMap::with_capacity(rows.len());
        for row in rows {
            by_coord.insert((row.get("qlon"), row.get("qlat")), row.get("id"));
        }

        qlons
            .iter()
            .zip(qlats.iter())
            .map(|(qlon, qlat)| {
                by_coord
                    .get(&(*qlon, *qlat))
                    .map(|id| LocationId(*id))
                    .ok_or_else(|| {
                        PipelineError::Database(format!(
                            "location ({}, {}) missing after upsert",
                            qlon, qlat
                        ))
                    })
            })
            .collect()
    }

    async fn nearest_location(&self, lat: f64, lon: f64) -> PipelineResult<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT id, lon, lat FROM locations \
             ORDER BY (lon - $1) * (lon - $1) + (lat - $2) * (lat - $2) ASC LIMIT 1",
        )
        .bind(lon)
        .bind(lat)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        Ok(row.map(|r| r.into()))
    }
}

#[async_trait]
impl ForecastStore for PostgresStore {
    async fn begin_batch(&self, reference_time: DateTime<Utc>) -> PipelineResult<BatchId> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO staging_batches (id, reference_time) VALUES ($1, $2)")
            .bind(id)
            .bind(reference_time)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Database(format!("Insert failed: {}", e)))?;

        debug!(batch_id = %id, reference_time = %reference_time, "opened staging batch");
        Ok(id)
    }

    async fn stage(&self, batch: BatchId, records: &[SpatialRecord]) -> PipelineResult<()> {
        match self.batch_state(batch).await? {
            None => {
                return Err(PipelineError::Staging(format!("unknown batch {}", batch)));
            }
            Some((_, true)) => {
                return Err(PipelineError::Staging(format!(
                    "batch {} is poisoned by an earlier staging error",
                    batch
                )));
            }
            Some((_, false)) => {}
        }

        for record in records {
            if let Err(e) = record.validate() {
                self.poison(batch).await?;
                return Err(e);
            }
        }

        let mut locations = Vec::new();
        let mut variables = Vec::new();
        let mut valid_times = Vec::new();
        let mut values = Vec::new();
        let mut rasters = RasterColumns::default();

        for record in records {
            match record {
                SpatialRecord::Point {
                    location,
                    variable,
                    valid_time,
                    value,
                } => {
                    locations.push(location.0);
                    variables.push(variable.clone());
                    valid_times.push(*valid_time);
                    values.push(*value);
                }
                raster @ SpatialRecord::Raster { .. } => rasters.push(raster),
            }
        }

        // One UNNEST insert per record shape, never one per record.
        if !rasters.is_empty() {
            sqlx::query(
                "INSERT INTO staged_rasters (batch_id, tile_row, tile_col, variable, \
                 valid_time, bbox_min_x, bbox_min_y, bbox_max_x, bbox_max_y, \
                 width, height, payload) \
                 SELECT $1, * FROM UNNEST($2::int[], $3::int[], $4::text[], \
                 $5::timestamptz[], $6::float8[], $7::float8[], $8::float8[], \
                 $9::float8[], $10::int[], $11::int[], $12::bytea[])",
            )
            .bind(batch)
            .bind(&rasters.tile_rows)
            .bind(&rasters.tile_cols)
            .bind(&rasters.variables)
            .bind(&rasters.valid_times)
            .bind(&rasters.min_xs)
            .bind(&rasters.min_ys)
            .bind(&rasters.max_xs)
            .bind(&rasters.max_ys)
            .bind(&rasters.widths)
            .bind(&rasters.heights)
            .bind(&rasters.payloads)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Staging(format!("Insert failed: {}", e)))?;
        }

        if !locations.is_empty() {
            sqlx::query(
                "INSERT INTO staged_points (batch_id, location_id, variable, valid_time, value) \
                 SELECT $1, * FROM UNNEST($2::bigint[], $3::text[], $4::timestamptz[], $5::float8[])",
            )
            .bind(batch)
            .bind(&locations)
            .bind(&variables)
            .bind(&valid_times)
            .bind(&values)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Staging(format!("Insert failed: {}", e)))?;
        }

        Ok(())
    }

    async fn promote(&self, batch: BatchId) -> PipelineResult<u64> {
        let (reference_time, poisoned) = self
            .batch_state(batch)
            .await?
            .ok_or_else(|| PipelineError::Promotion(format!("unknown batch {}", batch)))?;

        if poisoned {
            return Err(PipelineError::Promotion(format!(
                "batch {} is poisoned and cannot be promoted",
                batch
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::Database(format!("Transaction failed: {}", e)))?;

        let replaced: Option<Uuid> = sqlx::query_scalar(
            "SELECT batch_id FROM published_batches WHERE reference_time = $1 FOR UPDATE",
        )
        .bind(reference_time)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PipelineError::Promotion(format!("Query failed: {}", e)))?;

        sqlx::query(
            "INSERT INTO published_batches (reference_time, batch_id, promoted_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (reference_time) \
             DO UPDATE SET batch_id = EXCLUDED.batch_id, promoted_at = EXCLUDED.promoted_at",
        )
        .bind(reference_time)
        .bind(batch)
        .execute(&mut *tx)
        .await
        .map_err(|e| PipelineError::Promotion(format!("Publish failed: {}", e)))?;

        // The replaced batch's rows cascade away with its header row.
        if let Some(old) = replaced {
            if old != batch {
                sqlx::query("DELETE FROM staging_batches WHERE id = $1")
                    .bind(old)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| PipelineError::Promotion(format!("Cleanup failed: {}", e)))?;
            }
        }

        let points: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staged_points WHERE batch_id = $1")
            .bind(batch)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| PipelineError::Promotion(format!("Count failed: {}", e)))?;
        let rasters: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM staged_rasters WHERE batch_id = $1")
                .bind(batch)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| PipelineError::Promotion(format!("Count failed: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| PipelineError::Promotion(format!("Commit failed: {}", e)))?;

        let count = (points + rasters) as u64;
        info!(
            batch_id = %batch,
            reference_time = %reference_time,
            records = count,
            replaced = replaced.is_some(),
            "promoted batch"
        );
        Ok(count)
    }

    async fn discard(&self, batch: BatchId) -> PipelineResult<()> {
        // Cascade removes the staged rows. A published batch keeps its
        // rows because its header is referenced by published_batches and
        // the coordinator never discards after promotion.
        let result = sqlx::query(
            "DELETE FROM staging_batches WHERE id = $1 \
             AND NOT EXISTS (SELECT 1 FROM published_batches WHERE batch_id = $1)",
        )
        .bind(batch)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Delete failed: {}", e)))?;

        if result.rows_affected() > 0 {
            debug!(batch_id = %batch, "discarded staging batch");
        }
        Ok(())
    }

    async fn query_series(
        &self,
        location: LocationId,
        variable: &str,
        range: Option<TimeRange>,
    ) -> PipelineResult<Vec<SeriesPoint>> {
        let mut sql = String::from(
            "SELECT DISTINCT ON (p.valid_time) p.valid_time, p.value \
             FROM staged_points p \
             JOIN published_batches pb ON pb.batch_id = p.batch_id \
             WHERE p.location_id = $1 AND p.variable = $2",
        );
        if range.is_some() {
            sql.push_str(" AND p.valid_time >= $3 AND p.valid_time <= $4");
        }
        sql.push_str(" ORDER BY p.valid_time ASC, pb.reference_time DESC");

        let mut query = sqlx::query(&sql).bind(location.0).bind(variable);
        if let Some(r) = &range {
            query = query.bind(r.start).bind(r.end);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| SeriesPoint {
                time: r.get("valid_time"),
                value: r.get("value"),
            })
            .collect())
    }

    async fn query_tile(
        &self,
        variable: &str,
        valid_time: DateTime<Utc>,
        bbox: &BoundingBox,
    ) -> PipelineResult<TileQueryResult> {
        let raster_rows = sqlx::query_as::<_, RasterRow>(
            "SELECT DISTINCT ON (r.tile_row, r.tile_col) \
             r.tile_row, r.tile_col, r.variable, r.valid_time, \
             r.bbox_min_x, r.bbox_min_y, r.bbox_max_x, r.bbox_max_y, \
             r.width, r.height, r.payload \
             FROM staged_rasters r \
             JOIN published_batches pb ON pb.batch_id = r.batch_id \
             WHERE r.variable = $1 AND r.valid_time = $2 \
             AND r.bbox_min_x <= $3 AND r.bbox_max_x >= $4 \
             AND r.bbox_min_y <= $5 AND r.bbox_max_y >= $6 \
             ORDER BY r.tile_row, r.tile_col, pb.reference_time DESC",
        )
        .bind(variable)
        .bind(valid_time)
        .bind(bbox.max_x)
        .bind(bbox.min_x)
        .bind(bbox.max_y)
        .bind(bbox.min_y)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        if !raster_rows.is_empty() {
            return Ok(TileQueryResult::Raster(
                raster_rows.into_iter().map(|r| r.into()).collect(),
            ));
        }

        let point_rows = sqlx::query(
            "SELECT DISTINCT ON (p.location_id) \
             l.id, l.lon, l.lat, p.value \
             FROM staged_points p \
             JOIN published_batches pb ON pb.batch_id = p.batch_id \
             JOIN locations l ON l.id = p.location_id \
             WHERE p.variable = $1 AND p.valid_time = $2 \
             AND l.lon >= $3 AND l.lon <= $4 AND l.lat >= $5 AND l.lat <= $6 \
             ORDER BY p.location_id, pb.reference_time DESC",
        )
        .bind(variable)
        .bind(valid_time)
        .bind(bbox.min_x)
        .bind(bbox.max_x)
        .bind(bbox.min_y)
        .bind(bbox.max_y)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        Ok(TileQueryResult::Points(
            point_rows
                .into_iter()
                .map(|r| {
                    (
                        Location {
                            id: LocationId(r.get("id")),
                            lon: r.get("lon"),
                            lat: r.get("lat"),
                        },
                        r.get("value"),
                    )
                })
                .collect(),
        ))
    }

    async fn production_extent(&self, variable: &str) -> PipelineResult<Option<BoundingBox>> {
        let raster: Option<(f64, f64, f64, f64)> = sqlx::query_as(
            "SELECT MIN(r.bbox_min_x), MIN(r.bbox_min_y), MAX(r.bbox_max_x), MAX(r.bbox_max_y) \
             FROM staged_rasters r \
             JOIN published_batches pb ON pb.batch_id = r.batch_id \
             WHERE r.variable = $1 \
             HAVING COUNT(*) > 0",
        )
        .bind(variable)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        if let Some((min_x, min_y, max_x, max_y)) = raster {
            return Ok(Some(BoundingBox::new(min_x, min_y, max_x, max_y)));
        }

        let points: Option<(f64, f64, f64, f64)> = sqlx::query_as(
            "SELECT MIN(l.lon), MIN(l.lat), MAX(l.lon), MAX(l.lat) \
             FROM staged_points p \
             JOIN published_batches pb ON pb.batch_id = p.batch_id \
             JOIN locations l ON l.id = p.location_id \
             WHERE p.variable = $1 \
             HAVING COUNT(*) > 0",
        )
        .bind(variable)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))?;

        Ok(points.map(|(min_x, min_y, max_x, max_y)| BoundingBox::new(min_x, min_y, max_x, max_y)))
    }

    async fn last_promoted_at(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        sqlx::query_scalar("SELECT MAX(promoted_at) FROM published_batches")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::Database(format!("Query failed: {}", e)))
    }
}

/// Column-major raster rows for a single UNNEST insert.
#[derive(Default)]
struct RasterColumns {
    tile_rows: Vec<i32>,
    tile_cols: Vec<i32>,
    variables: Vec<String>,
    valid_times: Vec<DateTime<Utc>>,
    min_xs: Vec<f64>,
    min_ys: Vec<f64>,
    max_xs: Vec<f64>,
    max_ys: Vec<f64>,
    widths: Vec<i32>,
    heights: Vec<i32>,
    payloads: Vec<Vec<u8>>,
}

impl RasterColumns {
    fn push(&mut self, record: &SpatialRecord) {
        let SpatialRecord::Raster {
            tile_row,
            tile_col,
            variable,
            valid_time,
            bbox,
            width,
            height,
            payload,
        } = record
        else {
            return;
        };
        self.tile_rows.push(*tile_row as i32);
        self.tile_cols.push(*tile_col as i32);
        self.variables.push(variable.clone());
        self.valid_times.push(*valid_time);
        self.min_xs.push(bbox.min_x);
        self.min_ys.push(bbox.min_y);
        self.max_xs.push(bbox.max_x);
        self.max_ys.push(bbox.max_y);
        self.widths.push(*width as i32);
        self.heights.push(*height as i32);
        self.payloads.push(payload.clone());
    }

    fn is_empty(&self) -> bool {
        self.tile_rows.is_empty()
    }
}

#[derive(FromRow)]
struct LocationRow {
    id: i64,
    lon: f64,
    lat: f64,
}

impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Location {
            id: LocationId(row.id),
            lon: row.lon,
            lat: row.lat,
        }
    }
}

#[derive(FromRow)]
struct RasterRow {
    tile_row: i32,
    tile_col: i32,
    variable: String,
    valid_time: DateTime<Utc>,
    bbox_min_x: f64,
    bbox_min_y: f64,
    bbox_max_x: f64,
    bbox_max_y: f64,
    width: i32,
    height: i32,
    payload: Vec<u8>,
}

impl From<RasterRow> for SpatialRecord {
    fn from(row: RasterRow) -> Self {
        SpatialRecord::Raster {
            tile_row: row.tile_row as u32,
            tile_col: row.tile_col as u32,
            variable: row.variable,
            valid_time: row.valid_time,
            bbox: BoundingBox::new(
                row.bbox_min_x,
                row.bbox_min_y,
                row.bbox_max_x,
                row.bbox_max_y,
            ),
            width: row.width as u32,
            height: row.height as u32,
            payload: row.payload,
        }
    }
}

/// Database schema SQL.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS locations (
    id BIGSERIAL PRIMARY KEY,
    qlon BIGINT NOT NULL,
    qlat BIGINT NOT NULL,
    lon DOUBLE PRECISION NOT NULL,
    lat DOUBLE PRECISION NOT NULL,

    UNIQUE(qlon, qlat)
);

CREATE TABLE IF NOT EXISTS staging_batches (
    id UUID PRIMARY KEY,
    reference_time TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    poisoned BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS staged_points (
    batch_id UUID NOT NULL REFERENCES staging_batches(id) ON DELETE CASCADE,
    location_id BIGINT NOT NULL REFERENCES locations(id),
    variable VARCHAR(100) NOT NULL,
    valid_time TIMESTAMPTZ NOT NULL,
    value DOUBLE PRECISION NOT NULL
);

CREATE TABLE IF NOT EXISTS staged_rasters (
    batch_id UUID NOT NULL REFERENCES staging_batches(id) ON DELETE CASCADE,
    tile_row INTEGER NOT NULL,
    tile_col INTEGER NOT NULL,
    variable VARCHAR(100) NOT NULL,
    valid_time TIMESTAMPTZ NOT NULL,
    bbox_min_x DOUBLE PRECISION NOT NULL,
    bbox_min_y DOUBLE PRECISION NOT NULL,
    bbox_max_x DOUBLE PRECISION NOT NULL,
    bbox_max_y DOUBLE PRECISION NOT NULL,
    width INTEGER NOT NULL,
    height INTEGER NOT NULL,
    payload BYTEA NOT NULL
);

CREATE TABLE IF NOT EXISTS published_batches (
    reference_time TIMESTAMPTZ PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES staging_batches(id),
    promoted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_staged_points_batch ON staged_points(batch_id, variable, valid_time);
CREATE INDEX IF NOT EXISTS idx_staged_points_location ON staged_points(location_id, variable);
CREATE INDEX IF NOT EXISTS idx_staged_rasters_batch ON staged_rasters(batch_id, variable, valid_time);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raster_columns_pack_rasters_only() {
        let valid_time = Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap();
        let raster = SpatialRecord::Raster {
            tile_row: 1,
            tile_col: 2,
            variable: "temperature_2m".to_string(),
            valid_time,
            bbox: BoundingBox::new(-50.0, -17.0, -49.0, -16.0),
            width: 2,
            height: 2,
            payload: vec![0u8; 16],
        };
        let point = SpatialRecord::Point {
            location: LocationId(1),
            variable: "temperature_2m".to_string(),
            valid_time,
            value: 28.4,
        };

        let mut columns = RasterColumns::default();
        columns.push(&raster);
        columns.push(&point);
        columns.push(&raster);

        assert_eq!(columns.tile_rows, vec![1, 1]);
        assert_eq!(columns.tile_cols, vec![2, 2]);
        assert_eq!(columns.payloads.len(), 2);
        assert_eq!(columns.widths, vec![2, 2]);
        assert!(!columns.is_empty());
    }

    #[test]
    fn test_schema_statements_non_empty() {
        let statements: Vec<_> = SCHEMA_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(statements.len(), 8);
        assert!(statements[0].starts_with("CREATE TABLE IF NOT EXISTS locations"));
    }
}
