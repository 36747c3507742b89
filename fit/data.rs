//! # Data Loading and Validation Module
//!
//! This module is the entry point for user-provided data. It reads
//! tab-separated tables, validates them against a fixed schema, and turns
//! them into the `ndarray`-backed types the rest of the crate consumes.
//!
//! - Fixed column names: count tables use `count` (and optionally a visits
//!   column for occupancy surveys), point tables use `x`/`y`, and grid
//!   covariate tables use `row`/`col`. Covariate columns are named by the
//!   model specification.
//! - Immutable values: an `ObservationSet` is checked once at construction.
//!   Every later stage (aggregation, scaling) builds a new set rather than
//!   editing one in place.

use crate::aggregate::{GridCovariates, PointTable};
use crate::likelihood::{InvalidInput, validate_counts, validate_finite};
use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Name of the response column in count tables.
pub const COUNT_COLUMN: &str = "count";

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to write tab-separated output: {0}")]
    CsvError(#[from] csv::Error),

    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),

    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),

    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),

    #[error("Input file '{0}' contains no data rows.")]
    Empty(String),

    #[error(
        "Column '{column}' holds {value} at row {row}, but a non-negative whole number is required."
    )]
    InvalidIndex {
        column: String,
        row: usize,
        value: f64,
    },

    #[error("Invalid observations: {0}")]
    InvalidObservations(#[from] InvalidInput),
}

/// Named covariate columns sharing one row count.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CovariateTable {
    n_rows: usize,
    columns: BTreeMap<String, Array1<f64>>,
}

impl CovariateTable {
    /// An empty table with `n_rows` rows and no columns.
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: BTreeMap::new(),
        }
    }

    /// Returns a table with `name` added, or replaced if it already exists.
    pub fn with_column(mut self, name: &str, values: Array1<f64>) -> Result<Self, InvalidInput> {
        if values.len() != self.n_rows {
            return Err(InvalidInput::LengthMismatch {
                name: name.to_string(),
                expected: self.n_rows,
                found: values.len(),
            });
        }
        validate_finite(name, values.view())?;
        self.columns.insert(name.to_string(), values);
        Ok(self)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns.get(name).map(|c| c.view())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }
}

/// A validated set of count observations.
///
/// Invariants checked on construction:
/// - every count is a finite, non-negative whole number;
/// - the covariate table has one row per count;
/// - visits, when present, are positive whole numbers no smaller than the
///   matching count.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSet {
    counts: Array1<f64>,
    covariates: CovariateTable,
    visits: Option<Array1<f64>>,
}

impl ObservationSet {
    pub fn new(counts: Array1<f64>, covariates: CovariateTable) -> Result<Self, InvalidInput> {
        validate_counts(counts.view())?;
        if covariates.n_rows() != counts.len() {
            return Err(InvalidInput::LengthMismatch {
                name: "covariates".to_string(),
                expected: counts.len(),
                found: covariates.n_rows(),
            });
        }
        Ok(Self {
            counts,
            covariates,
            visits: None,
        })
    }

    /// Attaches per-site visit counts for occupancy models.
    pub fn with_visits(self, visits: Array1<f64>) -> Result<Self, InvalidInput> {
        if visits.len() != self.counts.len() {
            return Err(InvalidInput::LengthMismatch {
                name: "visits".to_string(),
                expected: self.counts.len(),
                found: visits.len(),
            });
        }
        for (index, (&v, &n)) in visits.iter().zip(self.counts.iter()).enumerate() {
            if !v.is_finite() || v < 1.0 || v.fract() != 0.0 {
                return Err(InvalidInput::InvalidVisits { index, value: v });
            }
            if n > v {
                return Err(InvalidInput::CountExceedsVisits {
                    index,
                    count: n,
                    visits: v,
                });
            }
        }
        Ok(Self {
            visits: Some(visits),
            ..self
        })
    }

    /// Returns a new set sharing these counts and visits but using
    /// `covariates` in place of the current table.
    pub fn with_covariates(&self, covariates: CovariateTable) -> Result<Self, InvalidInput> {
        let next = Self::new(self.counts.clone(), covariates)?;
        match &self.visits {
            Some(visits) => next.with_visits(visits.clone()),
            None => Ok(next),
        }
    }

    /// Returns the records in the order given by `order`.
    pub fn reordered(&self, order: &[usize]) -> Result<Self, InvalidInput> {
        if let Some(&bad) = order.iter().find(|&&i| i >= self.len()) {
            return Err(InvalidInput::LengthMismatch {
                name: "order index".to_string(),
                expected: self.len(),
                found: bad,
            });
        }
        let pick = |values: ArrayView1<f64>| -> Array1<f64> {
            order.iter().map(|&i| values[i]).collect()
        };

        let mut covariates = CovariateTable::new(order.len());
        for name in self.covariates.names() {
            if let Some(column) = self.covariates.column(name) {
                covariates = covariates.with_column(name, pick(column))?;
            }
        }
        let next = Self::new(pick(self.counts.view()), covariates)?;
        match &self.visits {
            Some(visits) => next.with_visits(pick(visits.view())),
            None => Ok(next),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> ArrayView1<'_, f64> {
        self.counts.view()
    }

    pub fn covariates(&self) -> &CovariateTable {
        &self.covariates
    }

    pub fn covariate(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.covariates.column(name)
    }

    pub fn visits(&self) -> Option<ArrayView1<'_, f64>> {
        self.visits.as_ref().map(|v| v.view())
    }
}

/// Loads a count table with a `count` column, the named covariates and an
/// optional visits column.
pub fn load_observations(
    path: &str,
    covariates: &[String],
    visits_column: Option<&str>,
) -> Result<ObservationSet, DataError> {
    let mut required: Vec<&str> = vec![COUNT_COLUMN];
    required.extend(covariates.iter().map(String::as_str));
    if let Some(visits) = visits_column {
        required.push(visits);
    }
    let df = internal::read_table(path, &required)?;

    let counts = Array1::from_vec(internal::extract_numeric_column(&df, COUNT_COLUMN)?);
    let table = internal::collect_covariates(&df, covariates, counts.len())?;
    let observations = ObservationSet::new(counts, table)?;

    let observations = match visits_column {
        Some(name) => {
            let visits = Array1::from_vec(internal::extract_numeric_column(&df, name)?);
            observations.with_visits(visits)?
        }
        None => observations,
    };

    log::info!(
        "Loaded {} observations with covariates {:?} from '{}'",
        observations.len(),
        covariates,
        path
    );
    Ok(observations)
}

/// Loads only the named covariate columns, for prediction on new data.
pub fn load_covariate_table(
    path: &str,
    covariates: &[String],
) -> Result<CovariateTable, DataError> {
    let required: Vec<&str> = covariates.iter().map(String::as_str).collect();
    let df = internal::read_table(path, &required)?;
    internal::collect_covariates(&df, covariates, df.height())
}

/// Loads point locations from a table with `x` and `y` columns.
pub fn load_points(path: &str) -> Result<PointTable, DataError> {
    let df = internal::read_table(path, &["x", "y"])?;
    let x = Array1::from_vec(internal::extract_numeric_column(&df, "x")?);
    let y = Array1::from_vec(internal::extract_numeric_column(&df, "y")?);
    Ok(PointTable::new(x, y)?)
}

/// Loads per-cell covariates from a table with `row`, `col` and the named
/// covariate columns.
pub fn load_grid_covariates(
    path: &str,
    covariates: &[String],
) -> Result<GridCovariates, DataError> {
    let mut required: Vec<&str> = vec!["row", "col"];
    required.extend(covariates.iter().map(String::as_str));
    let df = internal::read_table(path, &required)?;

    let rows = internal::extract_index_column(&df, "row")?;
    let cols = internal::extract_index_column(&df, "col")?;
    let table = internal::collect_covariates(&df, covariates, rows.len())?;
    Ok(GridCovariates::new(rows, cols, table)?)
}

/// Writes an observation set as a tab-separated table: `count`, every
/// covariate in name order, then `visits` if present.
pub fn write_observations(path: &Path, observations: &ObservationSet) -> Result<(), DataError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;

    let names: Vec<&str> = observations.covariates().names().collect();
    let mut header: Vec<&str> = vec![COUNT_COLUMN];
    header.extend(names.iter().copied());
    if observations.visits().is_some() {
        header.push("visits");
    }
    writer.write_record(&header)?;

    let columns: Vec<ArrayView1<f64>> = names
        .iter()
        .filter_map(|name| observations.covariate(name))
        .collect();
    for i in 0..observations.len() {
        let mut record = Vec::with_capacity(header.len());
        record.push(observations.counts()[i].to_string());
        record.extend(columns.iter().map(|c| c[i].to_string()));
        if let Some(visits) = observations.visits() {
            record.push(visits[i].to_string());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Internal module for shared table reading logic.
mod internal {
    use super::*;

    pub(super) fn read_table(path: &str, required: &[&str]) -> Result<DataFrame, DataError> {
        log::debug!("Reading table from '{path}'");

        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        if df.height() == 0 {
            return Err(DataError::Empty(path.to_string()));
        }

        let columns: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for name in required {
            if !columns.contains(*name) {
                return Err(DataError::ColumnNotFound(name.to_string()));
            }
        }
        Ok(df)
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_index_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<usize>, DataError> {
        extract_numeric_column(df, column_name)?
            .into_iter()
            .enumerate()
            .map(|(row, value)| {
                if value < 0.0 || value.fract() != 0.0 {
                    Err(DataError::InvalidIndex {
                        column: column_name.to_string(),
                        row: row + 1,
                        value,
                    })
                } else {
                    Ok(value as usize)
                }
            })
            .collect()
    }

    pub(super) fn collect_covariates(
        df: &DataFrame,
        names: &[String],
        n_rows: usize,
    ) -> Result<CovariateTable, DataError> {
        let mut table = CovariateTable::new(n_rows);
        for name in names {
            let values = Array1::from_vec(extract_numeric_column(df, name)?);
            table = table.with_column(name, values)?;
        }
        Ok(table)
    }
}
