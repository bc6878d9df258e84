//! Fixed-size raster tiling of a derived grid.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::debug;

use pipeline_common::{BoundingBox, GridSpec};
use storage::SpatialRecord;
use transforms::DerivedVariable;

/// Default tile edge length in cells.
pub const TILE_SIZE: usize = 256;

/// Cut the derived grid into `tile_size` x `tile_size` tiles in row-major
/// tile order. Edge tiles are padded with no-data so every payload is the
/// same shape. Tiles are built in parallel; rayon's indexed collect keeps
/// the output order deterministic.
pub fn build_raster_tiles(
    derived: &DerivedVariable,
    valid_time: DateTime<Utc>,
    tile_size: usize,
) -> Vec<SpatialRecord> {
    let spec = derived.slice.spec();
    let tiles_x = spec.nx.div_ceil(tile_size);
    let tiles_y = spec.ny.div_ceil(tile_size);

    let positions: Vec<(usize, usize)> = (0..tiles_y)
        .flat_map(|row| (0..tiles_x).map(move |col| (row, col)))
        .collect();

    let records: Vec<SpatialRecord> = positions
        .par_iter()
        .map(|&(row, col)| build_tile(derived, valid_time, tile_size, row, col))
        .collect();

    debug!(
        variable = %derived.name,
        valid_time = %valid_time,
        tiles = records.len(),
        "built raster tiles"
    );
    records
}

fn build_tile(
    derived: &DerivedVariable,
    valid_time: DateTime<Utc>,
    tile_size: usize,
    row: usize,
    col: usize,
) -> SpatialRecord {
    let spec = derived.slice.spec();
    let i0 = col * tile_size;
    let j0 = row * tile_size;

    let mut payload = Vec::with_capacity(tile_size * tile_size * 4);
    for tj in 0..tile_size {
        for ti in 0..tile_size {
            // GridSlice::get yields no-data outside the grid, which is
            // exactly the padding we want.
            let value = derived.slice.get(i0 + ti, j0 + tj);
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }

    SpatialRecord::Raster {
        tile_row: row as u32,
        tile_col: col as u32,
        variable: derived.name.clone(),
        valid_time,
        bbox: tile_cell_bbox(spec, i0, j0, tile_size),
        width: tile_size as u32,
        height: tile_size as u32,
        payload,
    }
}

/// Geographic bbox of the cells a tile covers, extended by half a cell so
/// adjacent tiles share edges without gaps.
fn tile_cell_bbox(spec: &GridSpec, i0: usize, j0: usize, tile_size: usize) -> BoundingBox {
    let i1 = (i0 + tile_size - 1).min(spec.nx.saturating_sub(1));
    let j1 = (j0 + tile_size - 1).min(spec.ny.saturating_sub(1));

    let x_a = spec.first_x + i0 as f64 * spec.dx;
    let x_b = spec.first_x + i1 as f64 * spec.dx;
    let y_a = spec.first_y + j0 as f64 * spec.dy;
    let y_b = spec.first_y + j1 as f64 * spec.dy;

    let half_dx = spec.dx.abs() / 2.0;
    let half_dy = spec.dy.abs() / 2.0;

    BoundingBox::new(
        x_a.min(x_b) - half_dx,
        y_a.min(y_b) - half_dy,
        x_a.max(x_b) + half_dx,
        y_a.max(y_b) + half_dy,
    )
}
