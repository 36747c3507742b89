//! Fit diagnostics: Poisson over-dispersion checks and convergence statistics
//! for sampler output.

use crate::likelihood::NeumaierSum;
use ndarray::{Array1, ArrayView1, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosticsError {
    #[error("{observations} observations and {parameters} parameters leave no degrees of freedom.")]
    NoResidualDegreesOfFreedom {
        observations: usize,
        parameters: usize,
    },

    #[error("Counts and fitted means differ in length ({counts} vs {means}).")]
    LengthMismatch { counts: usize, means: usize },

    #[error("Fitted mean at index {index} is {value}; means must be positive and finite.")]
    InvalidMean { index: usize, value: f64 },

    #[error(
        "Convergence statistics need at least {needed} draws per chain and matching chain lengths."
    )]
    TooFewDraws { needed: usize },
}

/// Goodness-of-fit summary for a Poisson fit. A Pearson ratio well above 1
/// means the data vary more than a Poisson model allows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispersionReport {
    pub pearson_chi2: f64,
    pub residual_deviance: f64,
    pub degrees_of_freedom: usize,
    pub pearson_ratio: f64,
    pub deviance_ratio: f64,
    /// Upper-tail probability of the Pearson statistic under the Poisson
    /// model.
    pub p_value: f64,
}

impl DispersionReport {
    pub fn is_overdispersed(&self, threshold: f64) -> bool {
        self.pearson_ratio > threshold
    }
}

pub fn dispersion(
    counts: ArrayView1<f64>,
    means: ArrayView1<f64>,
    n_params: usize,
) -> Result<DispersionReport, DiagnosticsError> {
    if counts.len() != means.len() {
        return Err(DiagnosticsError::LengthMismatch {
            counts: counts.len(),
            means: means.len(),
        });
    }
    if counts.len() <= n_params {
        return Err(DiagnosticsError::NoResidualDegreesOfFreedom {
            observations: counts.len(),
            parameters: n_params,
        });
    }
    if let Some(index) = means.iter().position(|m| !(m.is_finite() && *m > 0.0)) {
        return Err(DiagnosticsError::InvalidMean {
            index,
            value: means[index],
        });
    }

    let mut pearson = NeumaierSum::new();
    let mut deviance = NeumaierSum::new();
    Zip::from(&counts).and(&means).for_each(|&y, &mu| {
        pearson.add((y - mu) * (y - mu) / mu);
        let log_ratio_term = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
        deviance.add(2.0 * (log_ratio_term - (y - mu)));
    });

    let df = counts.len() - n_params;
    let pearson_chi2 = pearson.total();
    let residual_deviance = deviance.total();
    let p_value = ChiSquared::new(df as f64)
        .map(|dist| dist.sf(pearson_chi2))
        .unwrap_or(f64::NAN);

    Ok(DispersionReport {
        pearson_chi2,
        residual_deviance,
        degrees_of_freedom: df,
        pearson_ratio: pearson_chi2 / df as f64,
        deviance_ratio: residual_deviance / df as f64,
        p_value,
    })
}

fn mean(values: ArrayView1<f64>) -> f64 {
    values.sum() / values.len() as f64
}

fn sample_variance(values: ArrayView1<f64>) -> f64 {
    values.var(1.0)
}

/// Splits every chain into its first and second half, dropping the middle
/// draw of odd-length chains.
fn split_chains(chains: &[Array1<f64>]) -> Result<Vec<ArrayView1<'_, f64>>, DiagnosticsError> {
    let n = chains.first().map(|c| c.len()).unwrap_or(0);
    if n < 4 || chains.iter().any(|c| c.len() != n) {
        return Err(DiagnosticsError::TooFewDraws { needed: 4 });
    }
    let half = n / 2;
    Ok(chains
        .iter()
        .flat_map(|c| {
            let (first, rest) = c.view().split_at(Axis(0), half);
            let skip = rest.len() - half;
            let second = rest.slice_move(s![skip..]);
            [first, second]
        })
        .collect())
}

/// Within-chain variance `W` and the pooled variance estimate `var⁺`.
fn variance_components(chains: &[ArrayView1<f64>]) -> (f64, f64) {
    let n = chains[0].len() as f64;
    let within = chains.iter().map(|c| sample_variance(*c)).sum::<f64>() / chains.len() as f64;
    let means: Array1<f64> = chains.iter().map(|c| mean(*c)).collect();
    let between_over_n = if chains.len() > 1 { means.var(1.0) } else { 0.0 };
    (within, (n - 1.0) / n * within + between_over_n)
}

/// Split R-hat for one parameter. Values near 1 mean the chains agree.
pub fn split_rhat(chains: &[Array1<f64>]) -> Result<f64, DiagnosticsError> {
    let split = split_chains(chains)?;
    let (within, pooled) = variance_components(&split);
    if within <= 0.0 {
        // Constant chains: they agree only if they sit at the same value.
        let first = split[0][0];
        let identical = split.iter().all(|c| c.iter().all(|&v| v == first));
        return Ok(if identical { 1.0 } else { f64::INFINITY });
    }
    Ok((pooled / within).sqrt())
}

/// Multi-chain effective sample size for one parameter, with the
/// autocorrelation sum truncated by Geyer's initial positive sequence.
pub fn effective_sample_size(chains: &[Array1<f64>]) -> Result<f64, DiagnosticsError> {
    let split = split_chains(chains)?;
    let m = split.len();
    let n = split[0].len();
    let total = (m * n) as f64;
    let (_, pooled) = variance_components(&split);
    if !(pooled > 0.0) {
        return Ok(total);
    }

    let centered: Vec<Array1<f64>> = split
        .iter()
        .map(|c| {
            let center = mean(*c);
            c.mapv(|v| v - center)
        })
        .collect();
    let autocovariance = |lag: usize| -> f64 {
        centered
            .iter()
            .map(|c| {
                c.slice(s![..n - lag]).dot(&c.slice(s![lag..]))
                    / n as f64
            })
            .sum::<f64>()
            / m as f64
    };
    let within = split.iter().map(|c| sample_variance(*c)).sum::<f64>() / m as f64;
    let rho = |lag: usize| {
        1.0 - (within - autocovariance(lag) * n as f64 / (n as f64 - 1.0)) / pooled
    };

    let mut tau = -1.0;
    let mut previous_pair = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let rho_even = if lag == 0 { 1.0 } else { rho(lag) };
        let pair = rho_even + rho(lag + 1);
        if pair < 0.0 {
            break;
        }
        // Monotone sequence keeps the estimate from growing on noise.
        let pair = pair.min(previous_pair);
        tau += 2.0 * pair;
        previous_pair = pair;
        lag += 2;
    }
    Ok(total / tau.max(1.0 / total.log10()))
}
