//! Covariate centering and scaling.
//!
//! With a log link, unscaled covariates make the likelihood surface badly
//! conditioned, so every polynomial covariate is standardized before fitting.
//! The center and scale used are kept as `Standardization` records so the
//! same transform can be replayed on prediction data.

use crate::data::{CovariateTable, ObservationSet};
use crate::likelihood::InvalidInput;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScalingError {
    #[error("Covariate '{0}' is not present in the data.")]
    UnknownCovariate(String),

    #[error("Covariate '{0}' has zero variance and cannot be scaled.")]
    ZeroVariance(String),

    #[error("Covariate '{name}' has {found} values; at least 2 are needed to estimate a scale.")]
    TooFewValues { name: String, found: usize },

    #[error("Scaled data failed validation: {0}")]
    Invalid(#[from] InvalidInput),
}

/// The center and scale applied to one covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub covariate: String,
    pub center: f64,
    pub scale: f64,
}

impl Standardization {
    /// Estimates the sample mean and standard deviation (n − 1 denominator).
    pub fn fit(covariate: &str, values: ArrayView1<f64>) -> Result<Self, ScalingError> {
        if values.len() < 2 {
            return Err(ScalingError::TooFewValues {
                name: covariate.to_string(),
                found: values.len(),
            });
        }
        let center = values.sum() / values.len() as f64;
        let scale = values.std(1.0);
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ScalingError::ZeroVariance(covariate.to_string()));
        }
        Ok(Self {
            covariate: covariate.to_string(),
            center,
            scale,
        })
    }

    pub fn apply(&self, values: ArrayView1<f64>) -> Array1<f64> {
        values.mapv(|v| (v - self.center) / self.scale)
    }
}

/// Standardizes the named covariates of a table, returning the new table
/// and the transforms that were applied. Other columns are carried over.
pub fn standardize_table(
    table: &CovariateTable,
    names: &[String],
) -> Result<(CovariateTable, Vec<Standardization>), ScalingError> {
    let mut transforms = Vec::with_capacity(names.len());
    for name in names {
        let column = table
            .column(name)
            .ok_or_else(|| ScalingError::UnknownCovariate(name.clone()))?;
        transforms.push(Standardization::fit(name, column)?);
    }
    let scaled = apply_to_table(table, &transforms)?;
    Ok((scaled, transforms))
}

/// Replays stored transforms on a table.
pub fn apply_to_table(
    table: &CovariateTable,
    transforms: &[Standardization],
) -> Result<CovariateTable, ScalingError> {
    let mut scaled = table.clone();
    for transform in transforms {
        let column = table
            .column(&transform.covariate)
            .ok_or_else(|| ScalingError::UnknownCovariate(transform.covariate.clone()))?;
        scaled = scaled.with_column(&transform.covariate, transform.apply(column))?;
    }
    Ok(scaled)
}

/// Standardizes the named covariates of an observation set. The input is
/// left untouched.
pub fn standardize(
    observations: &ObservationSet,
    names: &[String],
) -> Result<(ObservationSet, Vec<Standardization>), ScalingError> {
    let (table, transforms) = standardize_table(observations.covariates(), names)?;
    for t in &transforms {
        log::info!(
            "Standardized '{}' with center {:.6} and scale {:.6}",
            t.covariate,
            t.center,
            t.scale
        );
    }
    Ok((observations.with_covariates(table)?, transforms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn observations() -> ObservationSet {
        let table = CovariateTable::new(5)
            .with_column("elevation", array![100.0, 200.0, 300.0, 400.0, 500.0])
            .unwrap()
            .with_column("time", array![0.0, 1.0, 2.0, 3.0, 4.0])
            .unwrap();
        ObservationSet::new(array![1.0, 0.0, 3.0, 2.0, 5.0], table).unwrap()
    }

    #[test]
    fn test_standardize_centers_and_scales() {
        let obs = observations();
        let (scaled, transforms) = standardize(&obs, &["elevation".to_string()]).unwrap();
        let x = scaled.covariate("elevation").unwrap();
        assert_relative_eq!(x.sum(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(x.std(1.0), 1.0, epsilon = 1e-12);
        assert_eq!(transforms[0].center, 300.0);

        // Unlisted covariates and the original set are untouched.
        assert_eq!(scaled.covariate("time"), obs.covariate("time"));
        assert_eq!(obs.covariate("elevation").unwrap()[0], 100.0);
    }

    #[test]
    fn test_transform_replays_on_new_table() {
        let obs = observations();
        let (_, transforms) = standardize(&obs, &["elevation".to_string()]).unwrap();
        let fresh = CovariateTable::new(2)
            .with_column("elevation", array![300.0, 300.0 + transforms[0].scale])
            .unwrap();
        let scaled = apply_to_table(&fresh, &transforms).unwrap();
        let col = scaled.column("elevation").unwrap();
        assert_relative_eq!(col[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(col[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_variance_is_rejected() {
        let table = CovariateTable::new(3)
            .with_column("flat", array![2.0, 2.0, 2.0])
            .unwrap();
        let obs = ObservationSet::new(array![1.0, 2.0, 3.0], table).unwrap();
        assert!(matches!(
            standardize(&obs, &["flat".to_string()]),
            Err(ScalingError::ZeroVariance(_))
        ));
    }

    #[test]
    fn test_unknown_covariate_is_rejected() {
        assert!(matches!(
            standardize(&observations(), &["depth".to_string()]),
            Err(ScalingError::UnknownCovariate(name)) if name == "depth"
        ));
    }
}
