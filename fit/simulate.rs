//! Synthetic data sets generated from known parameters, for parameter
//! recovery checks and demonstrations.
//!
//! Covariates are drawn from a standard normal, so they are already on the
//! scale the fitters expect.

use crate::data::{CovariateTable, ObservationSet};
use crate::likelihood::InvalidInput;
use ndarray::Array1;
use rand::Rng;
use rand_distr::{Bernoulli, Binomial, Distribution, Gamma, Poisson, StandardNormal};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("At least one record must be simulated.")]
    NoRecords,

    #[error("Poisson mean at record {index} is {value}; it must be non-negative and finite.")]
    InvalidRate { index: usize, value: f64 },

    #[error("Probability {0} is outside [0, 1].")]
    InvalidProbability(f64),

    #[error("Parameter '{name}' must be positive and finite, found {value}.")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Simulated data failed validation: {0}")]
    Invalid(#[from] InvalidInput),
}

fn standard_normals<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Array1<f64> {
    (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
}

fn poisson_draws<R: Rng + ?Sized>(
    means: &Array1<f64>,
    rng: &mut R,
) -> Result<Array1<f64>, SimulationError> {
    means
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            if value == 0.0 {
                return Ok(0.0);
            }
            if !(value.is_finite() && value > 0.0) {
                return Err(SimulationError::InvalidRate { index, value });
            }
            Poisson::new(value)
                .map(|dist| dist.sample(rng))
                .map_err(|_| SimulationError::InvalidRate { index, value })
        })
        .collect()
}

fn logistic(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// `n_i ~ Poisson(exp(β0 + β1·x_i + β2·x_i²))` with covariate `x`.
pub fn simulate_quadratic_poisson<R: Rng + ?Sized>(
    n: usize,
    beta: [f64; 3],
    rng: &mut R,
) -> Result<ObservationSet, SimulationError> {
    if n == 0 {
        return Err(SimulationError::NoRecords);
    }
    let x = standard_normals(n, rng);
    let means = x.mapv(|xi| (beta[0] + beta[1] * xi + beta[2] * xi * xi).exp());
    let counts = poisson_draws(&means, rng)?;
    let table = CovariateTable::new(n).with_column("x", x)?;
    Ok(ObservationSet::new(counts, table)?)
}

/// A count time series with one covariate and a seasonal cycle:
/// `ln λ_t = β0 + β1·x_t + β2·sin(2πt/P) + β3·cos(2πt/P)`, with covariates
/// `x` and `time` (`t = 0, 1, …`).
pub fn simulate_periodic_poisson<R: Rng + ?Sized>(
    n: usize,
    period: f64,
    beta: [f64; 4],
    rng: &mut R,
) -> Result<ObservationSet, SimulationError> {
    if n == 0 {
        return Err(SimulationError::NoRecords);
    }
    if !(period.is_finite() && period > 0.0) {
        return Err(SimulationError::InvalidParameter {
            name: "period",
            value: period,
        });
    }
    let time: Array1<f64> = (0..n).map(|t| t as f64).collect();
    let x = standard_normals(n, rng);
    let means: Array1<f64> = time
        .iter()
        .zip(x.iter())
        .map(|(&t, &xi)| {
            let angle = 2.0 * PI * t / period;
            (beta[0] + beta[1] * xi + beta[2] * angle.sin() + beta[3] * angle.cos()).exp()
        })
        .collect();
    let counts = poisson_draws(&means, rng)?;
    let table = CovariateTable::new(n)
        .with_column("x", x)?
        .with_column("time", time)?;
    Ok(ObservationSet::new(counts, table)?)
}

/// Detection histories for `n_sites` sites with `visits` surveys each:
/// `z_i ~ Bernoulli(ψ_i)`, `logit ψ_i = α0 + α1·forest_i`, and
/// `y_i ~ Binomial(visits, z_i·p)` with `logit p = p_logit`.
pub fn simulate_occupancy<R: Rng + ?Sized>(
    n_sites: usize,
    visits: u64,
    psi_beta: [f64; 2],
    p_logit: f64,
    rng: &mut R,
) -> Result<ObservationSet, SimulationError> {
    if n_sites == 0 {
        return Err(SimulationError::NoRecords);
    }
    if visits == 0 {
        return Err(SimulationError::InvalidParameter {
            name: "visits",
            value: 0.0,
        });
    }
    let p = logistic(p_logit);
    let detection = Binomial::new(visits, p).map_err(|_| SimulationError::InvalidProbability(p))?;

    let forest = standard_normals(n_sites, rng);
    let mut detections = Array1::<f64>::zeros(n_sites);
    for (i, &f) in forest.iter().enumerate() {
        let psi = logistic(psi_beta[0] + psi_beta[1] * f);
        let occupied = Bernoulli::new(psi)
            .map_err(|_| SimulationError::InvalidProbability(psi))?
            .sample(rng);
        if occupied {
            detections[i] = detection.sample(rng) as f64;
        }
    }

    let table = CovariateTable::new(n_sites).with_column("forest", forest)?;
    let visits = Array1::from_elem(n_sites, visits as f64);
    Ok(ObservationSet::new(detections, table)?.with_visits(visits)?)
}

/// Gamma-Poisson (negative binomial) counts around the quadratic mean. The
/// variance is `μ + μ²/shape`, so small shapes give strong over-dispersion.
pub fn simulate_overdispersed<R: Rng + ?Sized>(
    n: usize,
    beta: [f64; 3],
    shape: f64,
    rng: &mut R,
) -> Result<ObservationSet, SimulationError> {
    if n == 0 {
        return Err(SimulationError::NoRecords);
    }
    let frailty = Gamma::new(shape, 1.0 / shape).map_err(|_| SimulationError::InvalidParameter {
        name: "shape",
        value: shape,
    })?;
    let x = standard_normals(n, rng);
    let means: Array1<f64> = x
        .iter()
        .map(|&xi| (beta[0] + beta[1] * xi + beta[2] * xi * xi).exp() * frailty.sample(rng))
        .collect();
    let counts = poisson_draws(&means, rng)?;
    let table = CovariateTable::new(n).with_column("x", x)?;
    Ok(ObservationSet::new(counts, table)?)
}
