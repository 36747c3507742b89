//! # Random-Walk Metropolis Sampler
//!
//! Draws from the posterior `p(β | y) ∝ L(y | β) · p(β)` of a compiled model.
//!
//! The sampler works in a whitened space. It first finds the posterior mode
//! `μ` with BFGS and the covariance `Σ = (−∇² log p)⁻¹` there, then proposes
//! moves on `z` with `β = μ + L z` where `Σ = L Lᵀ`. Gaussian random-walk
//! proposals in `z` are then roughly isotropic, so one scalar step size per
//! chain suffices. Step sizes are tuned in batches during warm-up towards the
//! target acceptance rate and frozen afterwards.
//!
//! Chains run in parallel on rayon. Each owns an RNG seeded with
//! `seed + chain`, so a run is reproducible for a fixed configuration.
//! Restart attempt `k` shifts the base seed by `k · n_chains`, so a retry
//! never reuses a chain stream from an earlier attempt.

use crate::design::CountModel;
use crate::diagnostics::{effective_sample_size, split_rhat};
use crate::fitter::{
    Coefficient, FitError, FitMethod, FitReport, ModelFitter, check_initial,
    covariance_from_information, dispersion_for, standard_normal_init,
};
use crate::optimize::posterior_mode;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Cholesky, UPLO};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;

/// Warm-up iterations between step-size updates.
const ADAPT_BATCH: usize = 50;
const PROGRESS_CHUNK: u64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McmcConfig {
    /// Draws kept per chain after warm-up.
    pub n_samples: usize,
    pub n_warmup: usize,
    pub n_chains: usize,
    pub seed: u64,
    /// Acceptance rate the warm-up tunes towards.
    pub target_acceptance: f64,
    /// Largest split R-hat accepted as converged.
    pub rhat_threshold: f64,
    pub mode_max_iterations: usize,
    pub mode_tolerance: f64,
    #[serde(skip)]
    pub show_progress: bool,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            n_samples: 2000,
            n_warmup: 1000,
            n_chains: 4,
            seed: 42,
            target_acceptance: 0.3,
            rhat_threshold: 1.1,
            mode_max_iterations: 200,
            mode_tolerance: 1e-6,
            show_progress: false,
        }
    }
}

impl McmcConfig {
    /// The configuration for restart `attempt`. Attempt 0 is `self`.
    pub fn for_attempt(&self, attempt: u64) -> Self {
        Self {
            seed: self
                .seed
                .wrapping_add(attempt.wrapping_mul(self.n_chains as u64)),
            ..self.clone()
        }
    }
}

/// Convergence and mixing statistics of a sampler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcSummary {
    pub n_chains: usize,
    pub n_samples: usize,
    pub n_warmup: usize,
    pub acceptance_rates: Vec<f64>,
    /// Split R-hat per coefficient.
    pub rhat: Vec<f64>,
    /// Effective sample size per coefficient.
    pub ess: Vec<f64>,
    pub max_rhat: f64,
    pub min_ess: f64,
}

/// Post-warm-up draws, one `(n_samples, dim)` matrix per chain.
#[derive(Debug, Clone)]
pub struct PosteriorSamples {
    pub names: Vec<String>,
    pub chains: Vec<Array2<f64>>,
    pub acceptance_rates: Vec<f64>,
}

impl PosteriorSamples {
    /// All chains stacked row-wise.
    pub fn pooled(&self) -> Array2<f64> {
        let dim = self.names.len();
        let rows: usize = self.chains.iter().map(|c| c.nrows()).sum();
        let mut all = Array2::zeros((rows, dim));
        let mut offset = 0;
        for chain in &self.chains {
            all.slice_mut(s![offset..offset + chain.nrows(), ..])
                .assign(chain);
            offset += chain.nrows();
        }
        all
    }

    /// Draws of coefficient `j`, one array per chain.
    pub fn coefficient_chains(&self, j: usize) -> Vec<Array1<f64>> {
        self.chains.iter().map(|c| c.column(j).to_owned()).collect()
    }

    pub fn mean(&self) -> Array1<f64> {
        let pooled = self.pooled();
        pooled
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.names.len()))
    }
}

/// Linear-interpolated empirical quantile, `q` in `[0, 1]`.
pub fn quantile(values: ArrayView1<f64>, q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

fn create_progress_bar(len: u64, show: bool) -> ProgressBar {
    let draw_target = if show && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message("sampling");
    pb
}

/// Cholesky factor of the posterior covariance at the mode, or a diagonal
/// scale when the precision matrix is not positive definite there.
fn proposal_scale(precision: &Array2<f64>) -> Array2<f64> {
    if let Some(covariance) = covariance_from_information(precision) {
        match covariance.cholesky(UPLO::Lower) {
            Ok(factor) => return factor,
            Err(e) => log::warn!("Covariance at the mode has no Cholesky factor ({e})"),
        }
    }
    log::warn!("Falling back to diagonal proposal scaling");
    let scales: Array1<f64> = precision
        .diag()
        .mapv(|p| if p.is_finite() && p > 0.0 { p.sqrt().recip() } else { 1.0 });
    Array2::from_diag(&scales)
}

struct Chain<'a> {
    model: &'a CountModel,
    mode: ArrayView1<'a, f64>,
    scale: ArrayView2<'a, f64>,
    rng: StdRng,
    z: Array1<f64>,
    log_density: f64,
    step: f64,
}

impl<'a> Chain<'a> {
    fn new(
        model: &'a CountModel,
        mode: ArrayView1<'a, f64>,
        scale: ArrayView2<'a, f64>,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let dim = mode.len();
        // Over-dispersed start, one posterior sd from the mode on average.
        let start = standard_normal_init(dim, &mut rng);
        let mut chain = Self {
            model,
            mode,
            scale,
            rng,
            z: start,
            log_density: f64::NEG_INFINITY,
            step: 2.38 / (dim as f64).sqrt(),
        };
        chain.log_density = chain.evaluate(&chain.z);
        if !chain.log_density.is_finite() {
            chain.z = Array1::zeros(dim);
            chain.log_density = chain.evaluate(&chain.z);
        }
        chain
    }

    fn beta(&self, z: &Array1<f64>) -> Array1<f64> {
        &self.mode + &self.scale.dot(z)
    }

    fn evaluate(&self, z: &Array1<f64>) -> f64 {
        self.model
            .log_posterior(self.beta(z).view())
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// One Metropolis step; returns whether the proposal was accepted.
    fn advance(&mut self) -> bool {
        let noise = standard_normal_init(self.z.len(), &mut self.rng);
        let proposal = &self.z + &(noise * self.step);
        let proposed = self.evaluate(&proposal);
        let log_u: f64 = self.rng.r#gen::<f64>().ln();
        if proposed.is_finite() && log_u < proposed - self.log_density {
            self.z = proposal;
            self.log_density = proposed;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetropolisSampler {
    pub config: McmcConfig,
}

impl MetropolisSampler {
    pub fn new(config: McmcConfig) -> Self {
        Self { config }
    }

    /// Runs every chain and returns the kept draws.
    pub fn sample(
        &self,
        model: &CountModel,
        init: ArrayView1<f64>,
    ) -> Result<PosteriorSamples, FitError> {
        check_initial(model, init)?;
        let config = &self.config;

        let mode = posterior_mode(
            model,
            init,
            config.mode_max_iterations,
            config.mode_tolerance,
            FitMethod::Mcmc,
        )?;
        log::info!(
            "Posterior mode found after {} iterations: {:?}",
            mode.iterations,
            mode.point.to_vec()
        );

        let mut curvature = model.hessian(mode.point.view())?;
        curvature
            .diag_mut()
            .scaled_add(1.0, &model.log_prior_hessian_diag(mode.point.view()));
        let precision = -curvature;
        let scale = proposal_scale(&precision);

        let per_chain = (config.n_warmup + config.n_samples) as u64;
        let pb = create_progress_bar(per_chain * config.n_chains as u64, config.show_progress);

        let results: Vec<(Array2<f64>, f64, f64)> = (0..config.n_chains)
            .into_par_iter()
            .map(|index| {
                let mut chain = Chain::new(
                    model,
                    mode.point.view(),
                    scale.view(),
                    config.seed.wrapping_add(index as u64),
                );

                let mut batch_accepted = 0usize;
                for i in 0..config.n_warmup {
                    if chain.advance() {
                        batch_accepted += 1;
                    }
                    if (i + 1) % ADAPT_BATCH == 0 {
                        let rate = batch_accepted as f64 / ADAPT_BATCH as f64;
                        chain.step *= (2.0 * (rate - config.target_acceptance)).exp();
                        batch_accepted = 0;
                    }
                    if (i as u64 + 1) % PROGRESS_CHUNK == 0 {
                        pb.inc(PROGRESS_CHUNK);
                    }
                }

                let mut draws = Array2::zeros((config.n_samples, model.dim()));
                let mut accepted = 0usize;
                for i in 0..config.n_samples {
                    if chain.advance() {
                        accepted += 1;
                    }
                    draws.row_mut(i).assign(&chain.beta(&chain.z));
                    if (i as u64 + 1) % PROGRESS_CHUNK == 0 {
                        pb.inc(PROGRESS_CHUNK);
                    }
                }
                let rate = accepted as f64 / config.n_samples.max(1) as f64;
                (draws, rate, chain.step)
            })
            .collect();
        pb.finish_and_clear();

        for (index, (_, rate, step)) in results.iter().enumerate() {
            log::info!("Chain {index}: acceptance {rate:.3}, step size {step:.3}");
        }
        let (chains, acceptance_rates): (Vec<_>, Vec<_>) = results
            .into_iter()
            .map(|(draws, rate, _)| (draws, rate))
            .unzip();

        Ok(PosteriorSamples {
            names: model.coefficient_names().to_vec(),
            chains,
            acceptance_rates,
        })
    }
}

impl ModelFitter for MetropolisSampler {
    fn method(&self) -> FitMethod {
        FitMethod::Mcmc
    }

    fn fit(&self, model: &CountModel, init: ArrayView1<f64>) -> Result<FitReport, FitError> {
        let samples = self.sample(model, init)?;
        let pooled = samples.pooled();
        let mean = samples.mean();
        let sd = pooled.std_axis(Axis(0), 1.0);

        let mut rhat = Vec::with_capacity(model.dim());
        let mut ess = Vec::with_capacity(model.dim());
        for j in 0..model.dim() {
            let chains = samples.coefficient_chains(j);
            rhat.push(split_rhat(&chains).unwrap_or(f64::NAN));
            ess.push(effective_sample_size(&chains).unwrap_or(f64::NAN));
        }
        let max_rhat = rhat.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_ess = ess.iter().copied().fold(f64::INFINITY, f64::min);

        let objective = -model.log_likelihood(mean.view())?;
        let iterations = self.config.n_warmup + self.config.n_samples;

        if !(max_rhat < self.config.rhat_threshold) {
            return Err(FitError::ConvergenceFailure {
                method: FitMethod::Mcmc,
                iterations,
                objective,
                estimates: mean.to_vec(),
                reason: format!(
                    "maximum split R-hat {max_rhat:.3} is not below {}",
                    self.config.rhat_threshold
                ),
            });
        }
        log::info!("Sampler converged: max R-hat {max_rhat:.3}, min ESS {min_ess:.0}");

        let coefficients = model
            .coefficient_names()
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let column = pooled.column(j);
                Coefficient {
                    name: name.clone(),
                    estimate: mean[j],
                    std_error: Some(sd[j]),
                    lower: Some(quantile(column, 0.025)),
                    upper: Some(quantile(column, 0.975)),
                }
            })
            .collect();

        Ok(FitReport {
            method: FitMethod::Mcmc,
            objective,
            iterations,
            converged: true,
            aic: 2.0 * objective + 2.0 * model.dim() as f64,
            coefficients,
            dispersion: dispersion_for(model, mean.view()),
            mcmc: Some(McmcSummary {
                n_chains: self.config.n_chains,
                n_samples: self.config.n_samples,
                n_warmup: self.config.n_warmup,
                acceptance_rates: samples.acceptance_rates,
                rhat,
                ess,
                max_rhat,
                min_ess,
            }),
        })
    }

    fn fit_attempt(
        &self,
        model: &CountModel,
        init: ArrayView1<f64>,
        attempt: u64,
    ) -> Result<FitReport, FitError> {
        let config = self.config.for_attempt(attempt);
        log::debug!("Sampler attempt {} uses base seed {}", attempt + 1, config.seed);
        MetropolisSampler::new(config).fit(model, init)
    }
}
