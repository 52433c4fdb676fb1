/// Spatial density grid and high-density zone detection
use common::crowd::Centroid;
use serde::{Deserialize, Serialize};

/// Grid geometry, fixed for the lifetime of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    rows: usize,
    cols: usize,
    cell_size: u32,
}

impl GridLayout {
    /// Derive the layout from the frame resolution. Each dimension keeps at
    /// least one cell so frames smaller than a cell still bin every person.
    pub fn new(frame_width: u32, frame_height: u32, cell_size: u32) -> Self {
        let cell_size = cell_size.max(1);
        Self {
            rows: ((frame_height / cell_size) as usize).max(1),
            cols: ((frame_width / cell_size) as usize).max(1),
            cell_size,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn cell_size(&self) -> u32 {
        self.cell_size
    }

    /// `(row, col)` of the cell holding a centroid. Points on or past the
    /// bottom/right edge land in the last row/column, negative ones in the first.
    pub fn cell_of(&self, centroid: &Centroid) -> (usize, usize) {
        let cell = self.cell_size as i64;
        let row = (i64::from(centroid.y).max(0) / cell) as usize;
        let col = (i64::from(centroid.x).max(0) / cell) as usize;
        (row.min(self.rows - 1), col.min(self.cols - 1))
    }

    /// Build a fresh grid for one frame
    pub fn compute_grid(&self, centroids: &[Centroid]) -> DensityGrid {
        let mut grid = DensityGrid {
            rows: self.rows,
            cols: self.cols,
            cells: vec![0; self.rows * self.cols],
        };

        for centroid in centroids {
            let (row, col) = self.cell_of(centroid);
            grid.cells[row * self.cols + col] += 1;
        }

        grid
    }
}

/// Per-cell person counts for one frame, stored row-major
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DensityGrid {
    rows: usize,
    cols: usize,
    cells: Vec<u32>,
}

impl DensityGrid {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<u32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(row * self.cols + col).copied()
    }

    pub fn total(&self) -> u32 {
        self.cells.iter().sum()
    }

    /// `(row, col, count)` in row-major order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, u32)> + '_ {
        let cols = self.cols;
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, &count)| (i / cols, i % cols, count))
    }

    /// Nested rows, the shape dashboards expect
    pub fn to_rows(&self) -> Vec<Vec<u32>> {
        self.cells.chunks(self.cols).map(<[u32]>::to_vec).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    High,
    Critical,
}

/// A grid cell at or over the high-density threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Column index
    pub grid_x: usize,
    /// Row index
    pub grid_y: usize,
    pub density: u32,
    pub risk_level: RiskLevel,
}

impl Zone {
    /// Top-left pixel of the zone's cell
    pub fn origin(&self, cell_size: u32) -> (u32, u32) {
        (
            self.grid_x as u32 * cell_size,
            self.grid_y as u32 * cell_size,
        )
    }

    pub fn is_critical(&self) -> bool {
        self.risk_level == RiskLevel::Critical
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneDetector {
    high_density_threshold: u32,
    critical_density_threshold: u32,
}

impl ZoneDetector {
    pub fn new(high_density_threshold: u32, critical_density_threshold: u32) -> Self {
        Self {
            high_density_threshold,
            critical_density_threshold,
        }
    }

    /// Flag every qualifying cell, row-major. Empty when nothing qualifies.
    pub fn detect_zones(&self, grid: &DensityGrid) -> Vec<Zone> {
        grid.iter()
            .filter(|&(_, _, density)| density >= self.high_density_threshold)
            .map(|(row, col, density)| Zone {
                grid_x: col,
                grid_y: row,
                density,
                risk_level: if density > self.critical_density_threshold {
                    RiskLevel::Critical
                } else {
                    RiskLevel::High
                },
            })
            .collect()
    }
}
