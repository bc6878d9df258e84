//! Grid specifications and slices for meteorological data.

use crate::{BoundingBox, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};

/// Sentinel marking an absent/invalid measurement in a grid cell.
///
/// Code should go through [`is_no_data`] rather than comparing against this
/// value directly; NaN never compares equal to itself.
pub const NO_DATA: f32 = f32::NAN;

/// Check whether a grid value is the no-data sentinel.
#[inline]
pub fn is_no_data(value: f32) -> bool {
    !value.is_finite()
}

/// Specification of a regular lat/lon grid.
///
/// `first_x`/`first_y` are the coordinates of cell (0, 0); `dx`/`dy` are the
/// cell steps and may be negative for grids scanning north to south.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Number of points in X (longitude) direction
    pub nx: usize,
    /// Number of points in Y (latitude) direction
    pub ny: usize,
    /// Grid step in X direction (degrees)
    pub dx: f64,
    /// Grid step in Y direction (degrees)
    pub dy: f64,
    /// First grid point longitude
    pub first_x: f64,
    /// First grid point latitude
    pub first_y: f64,
    /// Coordinate reference system, e.g. "EPSG:4326"
    pub crs: String,
}

impl GridSpec {
    pub fn new(nx: usize, ny: usize, dx: f64, dy: f64, first_x: f64, first_y: f64) -> Self {
        Self {
            nx,
            ny,
            dx,
            dy,
            first_x,
            first_y,
            crs: "EPSG:4326".to_string(),
        }
    }

    /// Calculate the bounding box of this grid.
    pub fn bbox(&self) -> BoundingBox {
        let last_x = self.first_x + (self.nx.saturating_sub(1)) as f64 * self.dx;
        let last_y = self.first_y + (self.ny.saturating_sub(1)) as f64 * self.dy;

        BoundingBox {
            min_x: self.first_x.min(last_x),
            min_y: self.first_y.min(last_y),
            max_x: self.first_x.max(last_x),
            max_y: self.first_y.max(last_y),
        }
    }

    /// Convert a grid index to (lon, lat).
    pub fn index_to_coord(&self, i: usize, j: usize) -> Option<(f64, f64)> {
        if i >= self.nx || j >= self.ny {
            return None;
        }
        Some((
            self.first_x + i as f64 * self.dx,
            self.first_y + j as f64 * self.dy,
        ))
    }

    /// Convert (lon, lat) to the nearest grid index.
    pub fn coord_to_index(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let i = ((x - self.first_x) / self.dx).round() as isize;
        let j = ((y - self.first_y) / self.dy).round() as isize;

        if i < 0 || j < 0 || i >= self.nx as isize || j >= self.ny as isize {
            return None;
        }

        Some((i as usize, j as usize))
    }

    /// Get the 1D array index for a 2D grid position (row-major).
    pub fn flat_index(&self, i: usize, j: usize) -> usize {
        j * self.nx + i
    }

    /// Total number of grid points.
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    /// Check if grid is empty.
    pub fn is_empty(&self) -> bool {
        self.nx == 0 || self.ny == 0
    }
}

/// A single variable at a single valid time, as a row-major 2D array.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSlice {
    spec: GridSpec,
    values: Vec<f32>,
}

impl GridSlice {
    /// Create a slice, enforcing that the value count matches the grid shape.
    pub fn new(spec: GridSpec, values: Vec<f32>) -> PipelineResult<Self> {
        if values.len() != spec.len() {
            return Err(PipelineError::SourceFormat(format!(
                "grid slice has {} values, expected {} ({}x{})",
                values.len(),
                spec.len(),
                spec.nx,
                spec.ny
            )));
        }
        Ok(Self { spec, values })
    }

    /// A slice filled entirely with the no-data sentinel.
    pub fn filled_no_data(spec: GridSpec) -> Self {
        let len = spec.len();
        Self {
            spec,
            values: vec![NO_DATA; len],
        }
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at grid index (i, j); out-of-range indices read as no-data.
    pub fn get(&self, i: usize, j: usize) -> f32 {
        if i >= self.spec.nx || j >= self.spec.ny {
            return NO_DATA;
        }
        self.values[self.spec.flat_index(i, j)]
    }

    /// Apply `f` element-wise over the whole slice.
    ///
    /// No-data cells propagate unchanged; `f` never sees the sentinel. If
    /// `f` produces a non-finite value it becomes no-data as well, so
    /// division blow-ups never leak downstream.
    pub fn map<F>(&self, f: F) -> GridSlice
    where
        F: Fn(f32) -> f32 + Sync,
    {
        let values = self
            .values
            .iter()
            .map(|&v| {
                if is_no_data(v) {
                    NO_DATA
                } else {
                    sanitize(f(v))
                }
            })
            .collect();
        GridSlice {
            spec: self.spec.clone(),
            values,
        }
    }

    /// Combine two slices element-wise.
    ///
    /// Any no-data input cell yields a no-data output cell at that index.
    /// Returns an error if the grid definitions differ (no resampling at
    /// this stage).
    pub fn zip_map<F>(&self, other: &GridSlice, f: F) -> PipelineResult<GridSlice>
    where
        F: Fn(f32, f32) -> f32 + Sync,
    {
        if self.spec != other.spec {
            return Err(PipelineError::Transform(
                "grid definitions differ between transform inputs".to_string(),
            ));
        }
        let values = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                if is_no_data(a) || is_no_data(b) {
                    NO_DATA
                } else {
                    sanitize(f(a, b))
                }
            })
            .collect();
        Ok(GridSlice {
            spec: self.spec.clone(),
            values,
        })
    }

    /// Number of cells carrying a real value.
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| !is_no_data(**v)).count()
    }
}

#[inline]
fn sanitize(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        NO_DATA
    }
}
