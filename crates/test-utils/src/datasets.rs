//! Synthetic dataset builder.
//!
//! Writes a `manifest.json` + `data.bin` pair into a tempdir, matching the
//! grid-reader input contract, without depending on the reader crate.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

/// Per-cell value function: (i, j, time_index) -> value.
type CellFn = Box<dyn Fn(usize, usize, usize) -> f32>;

/// Builder for an on-disk synthetic dataset.
///
/// Defaults to a grid over the Goiás region (origin −50.0, −17.0, step
/// 0.1°) so the common test coordinates fall inside it.
pub struct DatasetBuilder {
    nx: usize,
    ny: usize,
    dx: f64,
    dy: f64,
    first_x: f64,
    first_y: f64,
    reference_time: DateTime<Utc>,
    n_times: usize,
    variables: Vec<(String, CellFn)>,
}

/// A dataset written to disk; keep the tempdir alive while reading it.
pub struct BuiltDataset {
    pub dir: TempDir,
    pub reference_time: DateTime<Utc>,
    pub times: Vec<DateTime<Utc>>,
}

impl DatasetBuilder {
    pub fn new(nx: usize, ny: usize) -> Self {
        Self {
            nx,
            ny,
            dx: 0.1,
            dy: 0.1,
            first_x: -50.0,
            first_y: -17.0,
            reference_time: Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap(),
            n_times: 1,
            variables: Vec::new(),
        }
    }

    pub fn origin(mut self, first_x: f64, first_y: f64) -> Self {
        self.first_x = first_x;
        self.first_y = first_y;
        self
    }

    pub fn step(mut self, dx: f64, dy: f64) -> Self {
        self.dx = dx;
        self.dy = dy;
        self
    }

    pub fn reference_time(mut self, t: DateTime<Utc>) -> Self {
        self.reference_time = t;
        self
    }

    /// Number of hourly valid times, starting at reference_time + 1h.
    pub fn times(mut self, n: usize) -> Self {
        self.n_times = n;
        self
    }

    /// Add a variable with a per-cell value function (i, j, time_index).
    pub fn variable<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f32 + 'static,
    {
        self.variables.push((name.to_string(), Box::new(f)));
        self
    }

    /// Write manifest + payload into a fresh tempdir.
    pub fn write(self) -> BuiltDataset {
        let dir = TempDir::new().expect("create tempdir");

        let times: Vec<DateTime<Utc>> = (1..=self.n_times)
            .map(|h| self.reference_time + Duration::hours(h as i64))
            .collect();

        let manifest = serde_json::json!({
            "reference_time": self.reference_time.to_rfc3339(),
            "grid": {
                "nx": self.nx,
                "ny": self.ny,
                "dx": self.dx,
                "dy": self.dy,
                "first_x": self.first_x,
                "first_y": self.first_y,
                "crs": "EPSG:4326",
            },
            "variables": self.variables.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
            "times": times.iter().map(|t| t.to_rfc3339()).collect::<Vec<_>>(),
        });

        std::fs::write(
            dir.path().join("manifest.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .expect("write manifest");

        // Payload layout: [time][variable][row-major grid], f32 LE
        let mut payload =
            Vec::with_capacity(self.n_times * self.variables.len() * self.nx * self.ny * 4);
        for t in 0..self.n_times {
            for (_, f) in &self.variables {
                for j in 0..self.ny {
                    for i in 0..self.nx {
                        payload.extend_from_slice(&f(i, j, t).to_le_bytes());
                    }
                }
            }
        }
        std::fs::write(dir.path().join("data.bin"), payload).expect("write payload");

        BuiltDataset {
            dir,
            reference_time: self.reference_time,
            times,
        }
    }
}
