//! Spatial aggregation of point records onto a regular grid.
//!
//! Points are binned into square cells; cells are indexed by `(row, col)`
//! with row 0 at `origin_y` and column 0 at `origin_x`. Joining the cell
//! counts with a per-cell covariate table yields an `ObservationSet` with one
//! record per covariate cell.

use crate::data::{CovariateTable, ObservationSet};
use crate::likelihood::{InvalidInput, validate_finite};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Grid cell size must be positive and finite, found {0}.")]
    InvalidCellSize(f64),

    #[error("Grid origin must be finite, found ({0}, {1}).")]
    InvalidOrigin(f64, f64),

    #[error("Grid must have at least one row and one column, found {rows}x{cols}.")]
    EmptyGrid { rows: usize, cols: usize },

    #[error(
        "Covariate record {record} refers to cell ({row}, {col}), outside the {rows}x{cols} grid."
    )]
    CellOutsideGrid {
        record: usize,
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Cell ({row}, {col}) appears more than once in the covariate table.")]
    DuplicateCell { row: usize, col: usize },

    #[error("Invalid aggregated observations: {0}")]
    Invalid(#[from] InvalidInput),
}

/// A regular square grid anchored at its lower-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub origin_x: f64,
    pub origin_y: f64,
    pub cell_size: f64,
    pub n_rows: usize,
    pub n_cols: usize,
}

impl GridSpec {
    pub fn new(
        origin_x: f64,
        origin_y: f64,
        cell_size: f64,
        n_rows: usize,
        n_cols: usize,
    ) -> Result<Self, AggregateError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(AggregateError::InvalidCellSize(cell_size));
        }
        if !(origin_x.is_finite() && origin_y.is_finite()) {
            return Err(AggregateError::InvalidOrigin(origin_x, origin_y));
        }
        if n_rows == 0 || n_cols == 0 {
            return Err(AggregateError::EmptyGrid {
                rows: n_rows,
                cols: n_cols,
            });
        }
        Ok(Self {
            origin_x,
            origin_y,
            cell_size,
            n_rows,
            n_cols,
        })
    }

    /// The `(row, col)` cell containing a point, or `None` if it lies outside.
    ///
    /// Cells are half-open: a point on the upper or right edge of the grid is
    /// outside.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.cell_size).floor();
        let row = ((y - self.origin_y) / self.cell_size).floor();
        if !(col >= 0.0 && row >= 0.0) {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        (row < self.n_rows && col < self.n_cols).then_some((row, col))
    }
}

/// Point locations, one per record.
#[derive(Debug, Clone, PartialEq)]
pub struct PointTable {
    x: Array1<f64>,
    y: Array1<f64>,
}

impl PointTable {
    pub fn new(x: Array1<f64>, y: Array1<f64>) -> Result<Self, InvalidInput> {
        if x.len() != y.len() {
            return Err(InvalidInput::LengthMismatch {
                name: "y".to_string(),
                expected: x.len(),
                found: y.len(),
            });
        }
        validate_finite("x", x.view())?;
        validate_finite("y", y.view())?;
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Covariate values attached to grid cells.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCovariates {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: CovariateTable,
}

impl GridCovariates {
    pub fn new(
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: CovariateTable,
    ) -> Result<Self, InvalidInput> {
        if cols.len() != rows.len() {
            return Err(InvalidInput::LengthMismatch {
                name: "col".to_string(),
                expected: rows.len(),
                found: cols.len(),
            });
        }
        if values.n_rows() != rows.len() {
            return Err(InvalidInput::LengthMismatch {
                name: "covariates".to_string(),
                expected: rows.len(),
                found: values.n_rows(),
            });
        }
        Ok(Self { rows, cols, values })
    }
}

/// Point counts per grid cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellCounts {
    grid: GridSpec,
    counts: Array2<f64>,
    dropped: usize,
}

impl CellCounts {
    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn count(&self, row: usize, col: usize) -> f64 {
        self.counts[[row, col]]
    }

    /// Total number of points that landed inside the grid.
    pub fn total(&self) -> f64 {
        self.counts.sum()
    }

    /// Number of points that fell outside the grid.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Pairs every covariate cell with its count. Cells without points get a
    /// zero count; points in cells missing from the covariate table are lost.
    pub fn join(&self, covariates: &GridCovariates) -> Result<ObservationSet, AggregateError> {
        let mut seen = HashSet::with_capacity(covariates.rows.len());
        let mut counts = Array1::<f64>::zeros(covariates.rows.len());

        for (record, (&row, &col)) in covariates.rows.iter().zip(&covariates.cols).enumerate() {
            if row >= self.grid.n_rows || col >= self.grid.n_cols {
                return Err(AggregateError::CellOutsideGrid {
                    record: record + 1,
                    row,
                    col,
                    rows: self.grid.n_rows,
                    cols: self.grid.n_cols,
                });
            }
            if !seen.insert((row, col)) {
                return Err(AggregateError::DuplicateCell { row, col });
            }
            counts[record] = self.count(row, col);
        }

        let joined = counts.sum();
        if joined < self.total() {
            log::warn!(
                "{} points fall in cells with no covariate record and were not joined",
                self.total() - joined
            );
        }

        Ok(ObservationSet::new(counts, covariates.values.clone())?)
    }
}

/// Bins every point into its grid cell.
pub fn aggregate_points(points: &PointTable, grid: &GridSpec) -> CellCounts {
    let mut counts = Array2::<f64>::zeros((grid.n_rows, grid.n_cols));
    let mut dropped = 0usize;

    for (&x, &y) in points.x.iter().zip(points.y.iter()) {
        match grid.cell_of(x, y) {
            Some(cell) => counts[cell] += 1.0,
            None => dropped += 1,
        }
    }

    if dropped > 0 {
        log::warn!(
            "{dropped} of {} points fall outside the {}x{} grid and were dropped",
            points.len(),
            grid.n_rows,
            grid.n_cols
        );
    }
    log::info!(
        "Aggregated {} points into {} cells",
        points.len() - dropped,
        grid.n_rows * grid.n_cols
    );

    CellCounts {
        grid: *grid,
        counts,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn unit_grid() -> GridSpec {
        GridSpec::new(0.0, 0.0, 1.0, 2, 3).unwrap()
    }

    #[test]
    fn test_cell_of_is_half_open() {
        let grid = unit_grid();
        assert_eq!(grid.cell_of(0.0, 0.0), Some((0, 0)));
        assert_eq!(grid.cell_of(2.99, 1.5), Some((1, 2)));
        assert_eq!(grid.cell_of(3.0, 0.5), None);
        assert_eq!(grid.cell_of(-0.01, 0.5), None);
        assert_eq!(grid.cell_of(0.5, 2.0), None);
    }

    #[test]
    fn test_grid_rejects_bad_geometry() {
        assert!(matches!(
            GridSpec::new(0.0, 0.0, 0.0, 1, 1),
            Err(AggregateError::InvalidCellSize(_))
        ));
        assert!(matches!(
            GridSpec::new(0.0, 0.0, 1.0, 0, 4),
            Err(AggregateError::EmptyGrid { .. })
        ));
    }

    #[test]
    fn test_aggregate_counts_and_drops() {
        let points = PointTable::new(
            array![0.2, 0.7, 1.5, 2.5, 9.0, 0.1],
            array![0.3, 0.9, 0.2, 1.1, 0.5, 1.9],
        )
        .unwrap();
        let counts = aggregate_points(&points, &unit_grid());
        assert_eq!(counts.count(0, 0), 2.0);
        assert_eq!(counts.count(0, 1), 1.0);
        assert_eq!(counts.count(1, 2), 1.0);
        assert_eq!(counts.count(1, 0), 1.0);
        assert_eq!(counts.dropped(), 1);
        assert_eq!(counts.total(), 5.0);
    }

    #[test]
    fn test_join_fills_empty_cells_with_zero() {
        let points = PointTable::new(array![0.5, 0.6, 2.2], array![0.5, 0.4, 1.3]).unwrap();
        let counts = aggregate_points(&points, &unit_grid());

        let values = CovariateTable::new(3)
            .with_column("elevation", array![120.0, 80.0, 95.0])
            .unwrap();
        let covariates = GridCovariates::new(vec![0, 1, 0], vec![0, 2, 1], values).unwrap();
        let obs = counts.join(&covariates).unwrap();

        assert_eq!(obs.counts(), array![2.0, 1.0, 0.0].view());
        assert_eq!(obs.covariate("elevation").unwrap()[1], 80.0);
    }

    #[test]
    fn test_join_rejects_duplicate_cells() {
        let points = PointTable::new(array![0.5], array![0.5]).unwrap();
        let counts = aggregate_points(&points, &unit_grid());
        let values = CovariateTable::new(2)
            .with_column("elevation", array![1.0, 2.0])
            .unwrap();
        let covariates = GridCovariates::new(vec![0, 0], vec![1, 1], values).unwrap();
        assert!(matches!(
            counts.join(&covariates),
            Err(AggregateError::DuplicateCell { row: 0, col: 1 })
        ));
    }

    #[test]
    fn test_join_rejects_cells_outside_grid() {
        let points = PointTable::new(array![0.5], array![0.5]).unwrap();
        let counts = aggregate_points(&points, &unit_grid());
        let values = CovariateTable::new(1).with_column("elevation", array![1.0]).unwrap();
        let covariates = GridCovariates::new(vec![5], vec![0], values).unwrap();
        assert!(matches!(
            counts.join(&covariates),
            Err(AggregateError::CellOutsideGrid { row: 5, .. })
        ));
    }
}
