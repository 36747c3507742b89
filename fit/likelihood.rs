//! # Poisson Log-Likelihood Evaluation
//!
//! This module holds the one piece of reusable numerical logic every fitting
//! strategy shares: the Poisson log-probability of a count under a log-linear
//! mean, summed over an observation set and negated into a deviance that a
//! minimizer can consume.
//!
//! - Log space: `log P(n | λ) = n·η − exp(η) − ln n!` with `η = ln λ`. The
//!   probability mass itself is never formed, so large counts and tiny
//!   probabilities cannot underflow.
//! - Compensated accumulation: sums go through `NeumaierSum`.
//! - Strict inputs: negative or fractional counts and non-finite covariates or
//!   parameters are rejected with `InvalidInput` before any arithmetic runs.
//! - Finite results: a mean too large to represent is reported as
//!   `InvalidInput::Overflow` instead of an infinite deviance.
//!
//! The functions here are pure. They hold no state between calls and may be
//! called concurrently from independent optimizer runs or sampler chains.

use ndarray::ArrayView1;
use statrs::function::factorial::ln_factorial;
use thiserror::Error;

/// Rejection reasons for data or parameters handed to the evaluator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidInput {
    #[error("Count at index {index} is negative ({value}). Counts must be non-negative integers.")]
    NegativeCount { index: usize, value: f64 },

    #[error(
        "Count at index {index} is not a whole number ({value}). Counts must be non-negative integers."
    )]
    NonIntegerCount { index: usize, value: f64 },

    #[error("Non-finite value {value} found in '{name}' at index {index}.")]
    NonFinite {
        name: String,
        index: usize,
        value: f64,
    },

    #[error("'{name}' has length {found}, but {expected} was expected.")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Visit count at index {index} must be a positive whole number, found {value}.")]
    InvalidVisits { index: usize, value: f64 },

    #[error(
        "The deviance overflows at index {index}: the linear predictor {eta} gives a mean too large to represent."
    )]
    Overflow { index: usize, eta: f64 },

    #[error("Count {count} at index {index} exceeds the {visits} recorded visits.")]
    CountExceedsVisits {
        index: usize,
        count: f64,
        visits: f64,
    },
}

/// Neumaier's compensated summation.
///
/// Keeps a running correction term so that long sums of log-probabilities of
/// mixed magnitude lose far less precision than naive accumulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeumaierSum {
    sum: f64,
    compensation: f64,
}

impl NeumaierSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() || !self.sum.is_finite() {
            // Infinities and NaN propagate through the plain sum; the
            // correction term would only turn them into NaN.
            self.sum += value;
            return;
        }
        let total = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - total) + value;
        } else {
            self.compensation += (value - total) + self.sum;
        }
        self.sum = total;
    }

    pub fn total(&self) -> f64 {
        if self.sum.is_finite() {
            self.sum + self.compensation
        } else {
            self.sum
        }
    }
}

impl Extend<f64> for NeumaierSum {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for value in iter {
            self.add(value);
        }
    }
}

impl FromIterator<f64> for NeumaierSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = NeumaierSum::new();
        acc.extend(iter);
        acc
    }
}

/// Poisson log-probability of count `n` given the log-mean `log_lambda`.
///
/// `n` must already be validated as a non-negative whole number.
pub fn poisson_log_pmf(n: f64, log_lambda: f64) -> f64 {
    let lambda = log_lambda.exp();
    if n == 0.0 {
        // Avoids 0·(−∞) when the mean underflows to zero.
        return -lambda;
    }
    n * log_lambda - lambda - ln_factorial(n as u64)
}

/// Checks that every count is a finite, non-negative whole number.
pub fn validate_counts(counts: ArrayView1<f64>) -> Result<(), InvalidInput> {
    for (index, &value) in counts.iter().enumerate() {
        if !value.is_finite() {
            return Err(InvalidInput::NonFinite {
                name: "count".to_string(),
                index,
                value,
            });
        }
        if value < 0.0 {
            return Err(InvalidInput::NegativeCount { index, value });
        }
        if value.fract() != 0.0 {
            return Err(InvalidInput::NonIntegerCount { index, value });
        }
    }
    Ok(())
}

/// Checks that every entry of `values` is finite, naming `name` in the error.
pub fn validate_finite(name: &str, values: ArrayView1<f64>) -> Result<(), InvalidInput> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(InvalidInput::NonFinite {
            name: name.to_string(),
            index,
            value: values[index],
        }),
        None => Ok(()),
    }
}

fn validate_length(name: &str, expected: usize, found: usize) -> Result<(), InvalidInput> {
    if expected != found {
        return Err(InvalidInput::LengthMismatch {
            name: name.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Negated Poisson log-likelihood for counts under an arbitrary linear
/// predictor `eta = ln λ`.
pub fn poisson_deviance(
    counts: ArrayView1<f64>,
    eta: ArrayView1<f64>,
) -> Result<f64, InvalidInput> {
    validate_length("linear predictor", counts.len(), eta.len())?;
    validate_counts(counts)?;
    validate_finite("linear predictor", eta)?;

    summed_deviance(counts.iter().copied().zip(eta.iter().copied()))
}

/// Deviance of the quadratic log-linear model
/// `λ_i = exp(β0 + β1·x_i + β2·x_i²)`.
///
/// `x` must already be centered and scaled; no scaling is applied here.
pub fn quadratic_deviance(
    counts: ArrayView1<f64>,
    x: ArrayView1<f64>,
    beta: [f64; 3],
) -> Result<f64, InvalidInput> {
    validate_length("covariate", counts.len(), x.len())?;
    validate_counts(counts)?;
    validate_finite("covariate", x)?;
    validate_finite("beta", ArrayView1::from(&beta[..]))?;

    let [b0, b1, b2] = beta;
    summed_deviance(
        counts
            .iter()
            .zip(x.iter())
            .map(|(&n, &xi)| (n, b0 + b1 * xi + b2 * xi * xi)),
    )
}

/// Negated sum of `poisson_log_pmf` over `(count, eta)` pairs. Fails with
/// `InvalidInput::Overflow` at the first record where a mean or the running
/// total stops being representable.
fn summed_deviance(records: impl Iterator<Item = (f64, f64)>) -> Result<f64, InvalidInput> {
    let mut acc = NeumaierSum::new();
    for (index, (n, eta)) in records.enumerate() {
        acc.add(poisson_log_pmf(n, eta));
        if !acc.total().is_finite() {
            return Err(InvalidInput::Overflow { index, eta });
        }
    }
    Ok(-acc.total())
}
