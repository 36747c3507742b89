//! # Fitting Strategies
//!
//! Every fitting strategy implements `ModelFitter` over a compiled
//! `CountModel`. Strategies differ in how they search the parameter space:
//!
//! - `IrlsFitter`: iteratively reweighted least squares on the Poisson GLM.
//! - `BfgsFitter`: quasi-Newton minimization of the negative log-likelihood.
//! - `MetropolisSampler`: random-walk Metropolis over the posterior.
//!
//! They share one report type and one error type. A run that stops without
//! converging returns `FitError::ConvergenceFailure`, carrying its last
//! estimates so that a caller can decide whether to restart. Only
//! `fit_with_restarts` retries; fitters never retry on their own.

use crate::design::CountModel;
use crate::diagnostics::{DispersionReport, dispersion};
use crate::irls::IrlsFitter;
use crate::likelihood::{InvalidInput, validate_finite};
use crate::mcmc::{McmcConfig, McmcSummary, MetropolisSampler};
use crate::optimize::BfgsFitter;
use crate::spec::Family;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::Inverse;
use ndarray_linalg::error::LinalgError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Two-sided 95% standard normal quantile.
const Z_95: f64 = 1.959_963_984_540_054;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    Irls,
    Bfgs,
    Mcmc,
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitMethod::Irls => write!(f, "IRLS"),
            FitMethod::Bfgs => write!(f, "BFGS"),
            FitMethod::Mcmc => write!(f, "MCMC"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid input to the model: {0}")]
    InvalidInput(#[from] InvalidInput),

    #[error(
        "{method} fit did not converge after {iterations} iterations (objective {objective:.6}): {reason}"
    )]
    ConvergenceFailure {
        method: FitMethod,
        iterations: usize,
        objective: f64,
        /// The last parameter vector reached, usable as a restart point.
        estimates: Vec<f64>,
        reason: String,
    },

    #[error("The {method} fitter does not support the {family} family.")]
    UnsupportedFamily { method: FitMethod, family: Family },

    #[error("A linear system solve failed; the information matrix may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),

    #[error(
        "Initial parameter vector has length {found}, but the model has {expected} coefficients."
    )]
    InitialDimension { expected: usize, found: usize },
}

/// One estimated coefficient. Interval bounds are Wald intervals for the
/// point-estimate fitters and posterior quantiles for the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// The immutable outcome of one successful fitting run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub method: FitMethod,
    /// Negative log-likelihood at the estimates.
    pub objective: f64,
    pub iterations: usize,
    pub converged: bool,
    pub aic: f64,
    pub coefficients: Vec<Coefficient>,
    pub dispersion: Option<DispersionReport>,
    pub mcmc: Option<McmcSummary>,
}

impl FitReport {
    pub fn estimates(&self) -> Array1<f64> {
        self.coefficients.iter().map(|c| c.estimate).collect()
    }

    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// A strategy that estimates the coefficients of a compiled model.
///
/// Implementations are stateless between calls and `Sync`, so one fitter may
/// serve several models or threads.
pub trait ModelFitter: Sync {
    fn method(&self) -> FitMethod;

    fn fit(&self, model: &CountModel, init: ArrayView1<f64>) -> Result<FitReport, FitError>;

    /// Runs attempt `attempt` (zero-based) of a restart sequence. Stochastic
    /// fitters derive their random streams from the attempt number; the
    /// default differs between attempts only through `init`.
    fn fit_attempt(
        &self,
        model: &CountModel,
        init: ArrayView1<f64>,
        attempt: u64,
    ) -> Result<FitReport, FitError> {
        let _ = attempt;
        self.fit(model, init)
    }
}

pub(crate) fn check_initial(model: &CountModel, init: ArrayView1<f64>) -> Result<(), FitError> {
    if init.len() != model.dim() {
        return Err(FitError::InitialDimension {
            expected: model.dim(),
            found: init.len(),
        });
    }
    validate_finite("initial beta", init)?;
    Ok(())
}

/// Inverts an observed information matrix into a covariance matrix. Returns
/// `None`, with a warning, when the matrix is singular or not positive
/// definite at the estimate.
pub(crate) fn covariance_from_information(information: &Array2<f64>) -> Option<Array2<f64>> {
    match information.inv() {
        Ok(covariance) if covariance.diag().iter().all(|v| v.is_finite() && *v > 0.0) => {
            Some(covariance)
        }
        Ok(_) => {
            log::warn!(
                "Information matrix is not positive definite; standard errors are unavailable"
            );
            None
        }
        Err(e) => {
            log::warn!(
                "Could not invert the information matrix ({e}); standard errors are unavailable"
            );
            None
        }
    }
}

/// Attaches the Poisson dispersion report, or `None` for other families or
/// when it cannot be computed.
pub(crate) fn dispersion_for(
    model: &CountModel,
    estimates: ArrayView1<f64>,
) -> Option<DispersionReport> {
    if model.family() != Family::Poisson {
        return None;
    }
    let means = match model.expected_counts(estimates) {
        Ok(means) => means,
        Err(e) => {
            log::warn!("Dispersion diagnostics skipped: expected counts unavailable ({e})");
            return None;
        }
    };
    match dispersion(model.counts(), means.view(), model.dim()) {
        Ok(report) => Some(report),
        Err(e) => {
            log::warn!("Dispersion diagnostics skipped: {e}");
            None
        }
    }
}

/// Builds the report for a point-estimate fitter from the optimum and an
/// optional covariance matrix.
pub(crate) fn point_estimate_report(
    method: FitMethod,
    model: &CountModel,
    estimates: ArrayView1<f64>,
    objective: f64,
    iterations: usize,
    covariance: Option<Array2<f64>>,
) -> FitReport {
    let coefficients = model
        .coefficient_names()
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let estimate = estimates[j];
            let std_error = covariance.as_ref().map(|c| c[[j, j]].sqrt());
            Coefficient {
                name: name.clone(),
                estimate,
                std_error,
                lower: std_error.map(|se| estimate - Z_95 * se),
                upper: std_error.map(|se| estimate + Z_95 * se),
            }
        })
        .collect();

    FitReport {
        method,
        objective,
        iterations,
        converged: true,
        aic: 2.0 * objective + 2.0 * model.dim() as f64,
        coefficients,
        dispersion: dispersion_for(model, estimates),
        mcmc: None,
    }
}

pub fn standard_normal_init<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Array1<f64> {
    (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
}

/// Runs `fitter` from a fresh standard-normal starting point, restarting up
/// to `restarts` more times when the run fails to converge. Any other error
/// is returned at once.
pub fn fit_with_restarts(
    fitter: &dyn ModelFitter,
    model: &CountModel,
    restarts: usize,
    seed: u64,
) -> Result<FitReport, FitError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut attempt = 0;
    loop {
        let init = standard_normal_init(model.dim(), &mut rng);
        log::debug!(
            "{} attempt {} starting from {:?}",
            fitter.method(),
            attempt + 1,
            init.to_vec()
        );
        match fitter.fit_attempt(model, init.view(), attempt as u64) {
            Err(FitError::ConvergenceFailure {
                method,
                iterations,
                objective,
                estimates,
                reason,
            }) if attempt < restarts => {
                log::warn!(
                    "{method} attempt {} of {} did not converge after {iterations} iterations \
                     ({reason}); restarting",
                    attempt + 1,
                    restarts + 1,
                );
                log::debug!("Abandoned estimates {estimates:?} with objective {objective:.6}");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Fitting options recorded alongside a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub method: FitMethod,
    /// Overrides the fitter's own iteration limit. Ignored by the sampler.
    pub max_iterations: Option<usize>,
    /// Overrides the fitter's own convergence tolerance. Ignored by the
    /// sampler.
    pub tolerance: Option<f64>,
    pub restarts: usize,
    pub seed: u64,
    /// Pearson ratio above which a Poisson fit is reported as over-dispersed.
    pub dispersion_threshold: f64,
    pub mcmc: McmcConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            method: FitMethod::Irls,
            max_iterations: None,
            tolerance: None,
            restarts: 3,
            seed: 42,
            dispersion_threshold: 1.5,
            mcmc: McmcConfig::default(),
        }
    }
}

impl FitConfig {
    pub fn fitter(&self) -> Box<dyn ModelFitter> {
        match self.method {
            FitMethod::Irls => {
                let defaults = IrlsFitter::default();
                Box::new(IrlsFitter {
                    max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
                    tolerance: self.tolerance.unwrap_or(defaults.tolerance),
                })
            }
            FitMethod::Bfgs => {
                let defaults = BfgsFitter::default();
                Box::new(BfgsFitter {
                    max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
                    tolerance: self.tolerance.unwrap_or(defaults.tolerance),
                })
            }
            FitMethod::Mcmc => Box::new(MetropolisSampler::new(self.mcmc.clone())),
        }
    }
}

/// Fits a model according to `config`, including restarts and the
/// over-dispersion check.
pub fn run_fit(config: &FitConfig, model: &CountModel) -> Result<FitReport, FitError> {
    let fitter = config.fitter();
    log::info!(
        "Fitting {} coefficients with {} (up to {} restarts)",
        model.dim(),
        fitter.method(),
        config.restarts
    );
    let report = fit_with_restarts(fitter.as_ref(), model, config.restarts, config.seed)?;

    if let Some(d) = &report.dispersion {
        if d.is_overdispersed(config.dispersion_threshold) {
            log::warn!(
                "Counts look over-dispersed: Pearson chi2/df = {:.3} (threshold {:.2}, p = {:.3e}); \
                 Poisson standard errors are likely too small",
                d.pearson_ratio,
                config.dispersion_threshold,
                d.p_value
            );
        } else {
            log::info!("Pearson chi2/df = {:.3}", d.pearson_ratio);
        }
    }
    log::info!(
        "{} fit finished after {} iterations with negative log-likelihood {:.6}",
        report.method,
        report.iterations,
        report.objective
    );
    Ok(report)
}
