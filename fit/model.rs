//! The fitted-model artifact: everything needed to reproduce predictions on
//! raw covariates, serialized as TOML.

use crate::data::{CovariateTable, ObservationSet};
use crate::design::{CountModel, design_matrix};
use crate::fitter::{FitConfig, FitError, FitReport, run_fit};
use crate::scaling::{ScalingError, Standardization, apply_to_table, standardize};
use crate::spec::{LinkFunction, ModelSpec, SpecError};
use ndarray::{Array1, s};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write predictions: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Model specification error: {0}")]
    Spec(#[from] SpecError),
    #[error("Covariate scaling failed: {0}")]
    Scaling(#[from] ScalingError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(
        "The stored report has coefficients {found:?}, but the specification defines {expected:?}. The model file is inconsistent."
    )]
    MismatchedCoefficients {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub spec: ModelSpec,
    /// Transforms applied to the covariates before fitting, replayed on
    /// prediction data.
    pub standardizations: Vec<Standardization>,
    pub config: FitConfig,
    pub report: FitReport,
}

/// Linear predictor and response-scale mean of one predictor, per record.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorOutput {
    pub name: String,
    pub link: LinkFunction,
    pub eta: Array1<f64>,
    pub mean: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    pub predictors: Vec<PredictorOutput>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.predictors.first().map(|p| p.eta.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn predictor(&self, name: &str) -> Option<&PredictorOutput> {
        self.predictors.iter().find(|p| p.name == name)
    }

    /// Writes one row per record with `{predictor}_eta` and
    /// `{predictor}_mean` columns, tab-separated.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        let header: Vec<String> = self
            .predictors
            .iter()
            .flat_map(|p| [format!("{}_eta", p.name), format!("{}_mean", p.name)])
            .collect();
        writer.write_record(&header)?;
        for i in 0..self.len() {
            let row: Vec<String> = self
                .predictors
                .iter()
                .flat_map(|p| [p.eta[i].to_string(), p.mean[i].to_string()])
                .collect();
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl FittedModel {
    /// Runs the whole fitting pipeline on raw observations: standardize the
    /// named covariates, compile the spec, and fit with `config`.
    pub fn fit(
        spec: ModelSpec,
        observations: &ObservationSet,
        standardize_covariates: &[String],
        config: FitConfig,
    ) -> Result<Self, ModelError> {
        spec.validate_against(observations)?;
        let (scaled, standardizations) = standardize(observations, standardize_covariates)?;
        let model = CountModel::compile(&spec, &scaled)?;
        let report = run_fit(&config, &model)?;
        Ok(Self {
            spec,
            standardizations,
            config,
            report,
        })
    }

    /// Predicts every linear predictor for raw (unscaled) covariates.
    pub fn predict(&self, covariates: &CovariateTable) -> Result<Predictions, ModelError> {
        let expected = self.spec.coefficient_names()?;
        let found: Vec<String> = self.report.coefficients.iter().map(|c| c.name.clone()).collect();
        if expected != found {
            return Err(ModelError::MismatchedCoefficients { expected, found });
        }

        let scaled = apply_to_table(covariates, &self.standardizations)?;
        let beta = self.report.estimates();
        let mut start = 0;
        let mut predictors = Vec::new();
        for predictor in self.spec.ordered_predictors()? {
            let x = design_matrix(predictor, &scaled)?;
            let width = x.ncols();
            let eta = x.dot(&beta.slice(s![start..start + width]));
            let mean = eta.mapv(|e| predictor.link.inverse(e));
            predictors.push(PredictorOutput {
                name: predictor.name.clone(),
                link: predictor.link,
                eta,
                mean,
            });
            start += width;
        }
        Ok(Predictions { predictors })
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: FittedModel = toml::from_str(&toml_string)?;
        model.spec.validate()?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fitter::FitMethod;
    use approx::assert_relative_eq;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn raw_observations() -> ObservationSet {
        let table = CovariateTable::new(10)
            .with_column(
                "elevation",
                array![120.0, 180.0, 240.0, 300.0, 360.0, 420.0, 480.0, 540.0, 600.0, 660.0],
            )
            .unwrap();
        let counts = array![1.0, 3.0, 4.0, 7.0, 9.0, 8.0, 6.0, 5.0, 2.0, 1.0];
        ObservationSet::new(counts, table).unwrap()
    }

    fn fitted() -> FittedModel {
        FittedModel::fit(
            ModelSpec::quadratic_poisson("elevation"),
            &raw_observations(),
            &["elevation".to_string()],
            FitConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_prediction_replays_scaling() {
        let model = fitted();
        let transform = &model.standardizations[0];
        let raw = CovariateTable::new(1)
            .with_column("elevation", array![transform.center])
            .unwrap();
        let predictions = model.predict(&raw).unwrap();
        let abundance = predictions.predictor("abundance").unwrap();

        // At the center the scaled covariate is zero, so η is the intercept.
        let intercept = model.report.coefficient("abundance:(Intercept)").unwrap().estimate;
        assert_relative_eq!(abundance.eta[0], intercept, epsilon = 1e-12);
        assert_relative_eq!(abundance.mean[0], intercept.exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_predictions_at_training_points_match_fit() {
        let model = fitted();
        let obs = raw_observations();
        let predictions = model.predict(obs.covariates()).unwrap();
        let mean = &predictions.predictors[0].mean;
        // Poisson score equations force the fitted total to the observed one.
        assert_relative_eq!(mean.sum(), obs.counts().sum(), epsilon = 1e-5);
    }

    #[test]
    fn test_toml_round_trip() {
        let model = fitted();
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        let loaded = FittedModel::load(file.path()).unwrap();
        assert_eq!(loaded.spec, model.spec);
        assert_eq!(loaded.standardizations, model.standardizations);
        assert_eq!(loaded.config.method, FitMethod::Irls);
        for (a, b) in loaded.report.coefficients.iter().zip(&model.report.coefficients) {
            assert_eq!(a.name, b.name);
            assert_relative_eq!(a.estimate, b.estimate, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_predictions_file_layout() {
        let model = fitted();
        let predictions = model.predict(raw_observations().covariates()).unwrap();
        let file = NamedTempFile::new().unwrap();
        predictions.save(file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("abundance_eta\tabundance_mean"));
        assert_eq!(lines.count(), 10);
    }

    #[test]
    fn test_missing_covariate_in_prediction_data() {
        let model = fitted();
        let raw = CovariateTable::new(1).with_column("depth", array![1.0]).unwrap();
        assert!(matches!(model.predict(&raw), Err(ModelError::Scaling(_))));
    }
}
