//! Iteratively reweighted least squares for the Poisson log-linear GLM.
//!
//! Each iteration solves the weighted normal equations
//! `XᵀWX β = XᵀWz` with weights `W = diag(μ)` and working response
//! `z = η + (y − μ)/μ`. When a step raises the deviance it is halved back
//! towards the previous estimate.

use crate::design::CountModel;
use crate::fitter::{
    FitError, FitMethod, FitReport, ModelFitter, check_initial, covariance_from_information,
    point_estimate_report,
};
use ndarray::{Array1, ArrayView1, Axis};
use ndarray_linalg::Solve;

const MAX_STEP_HALVINGS: usize = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct IrlsFitter {
    pub max_iterations: usize,
    /// Relative deviance change below which the fit has converged.
    pub tolerance: f64,
}

impl Default for IrlsFitter {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
        }
    }
}

/// Negative log-likelihood, or `+∞` when it cannot be evaluated.
fn objective(model: &CountModel, beta: &Array1<f64>) -> f64 {
    model
        .log_likelihood(beta.view())
        .map(|ll| -ll)
        .unwrap_or(f64::INFINITY)
}

impl ModelFitter for IrlsFitter {
    fn method(&self) -> FitMethod {
        FitMethod::Irls
    }

    /// The starting point is derived from the data (`μ = y + 0.1`), so
    /// `init` is only checked for shape.
    fn fit(&self, model: &CountModel, init: ArrayView1<f64>) -> Result<FitReport, FitError> {
        check_initial(model, init)?;
        let (x, y) = model.glm_parts().ok_or(FitError::UnsupportedFamily {
            method: FitMethod::Irls,
            family: model.family(),
        })?;

        let mut mu = y.mapv(|v| v + 0.1);
        let mut eta = mu.mapv(f64::ln);
        let mut beta = Array1::<f64>::zeros(model.dim());
        let mut current = f64::INFINITY;

        for iteration in 1..=self.max_iterations {
            let z = &eta + &((&y - &mu) / &mu);
            let weighted = &x * &mu.view().insert_axis(Axis(1));
            let xtwx = weighted.t().dot(&x);
            let xtwz = weighted.t().dot(&z);
            let mut candidate = xtwx.solve_into(xtwz)?;
            let mut next = objective(model, &candidate);

            let mut halvings = 0;
            while (!next.is_finite() || (iteration > 1 && next > current))
                && halvings < MAX_STEP_HALVINGS
            {
                candidate = (&candidate + &beta) / 2.0;
                next = objective(model, &candidate);
                halvings += 1;
            }
            if !next.is_finite() {
                return Err(FitError::ConvergenceFailure {
                    method: FitMethod::Irls,
                    iterations: iteration,
                    objective: next,
                    estimates: beta.to_vec(),
                    reason: "step halving could not find a finite deviance".to_string(),
                });
            }
            if halvings > 0 {
                log::debug!("IRLS iteration {iteration}: step halved {halvings} times");
            }

            let change = (current - next).abs() / (next.abs() + 0.1);
            log::debug!(
                "IRLS iteration {iteration}: objective {next:.10}, relative change {change:.3e}"
            );
            beta = candidate;
            current = next;
            eta = x.dot(&beta);
            mu = eta.mapv(f64::exp);

            if change < self.tolerance {
                let information = -model.hessian(beta.view())?;
                let covariance = covariance_from_information(&information);
                return Ok(point_estimate_report(
                    FitMethod::Irls,
                    model,
                    beta.view(),
                    current,
                    iteration,
                    covariance,
                ));
            }
        }

        Err(FitError::ConvergenceFailure {
            method: FitMethod::Irls,
            iterations: self.max_iterations,
            objective: current,
            estimates: beta.to_vec(),
            reason: format!(
                "relative deviance change stayed above {:e}",
                self.tolerance
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CovariateTable, ObservationSet};
    use crate::spec::ModelSpec;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn data() -> ObservationSet {
        let table = CovariateTable::new(8)
            .with_column("x", array![-1.6, -1.1, -0.5, -0.2, 0.1, 0.6, 1.0, 1.7])
            .unwrap();
        ObservationSet::new(array![0.0, 2.0, 4.0, 7.0, 6.0, 5.0, 2.0, 1.0], table).unwrap()
    }

    #[test]
    fn test_irls_reaches_a_stationary_point() {
        let model = CountModel::compile(&ModelSpec::quadratic_poisson("x"), &data()).unwrap();
        let report = IrlsFitter::default().fit(&model, Array1::zeros(3).view()).unwrap();
        let grad = model.gradient(report.estimates().view()).unwrap();
        for g in grad.iter() {
            assert!(g.abs() < 1e-4, "score = {g}");
        }
        assert!(report.coefficients.iter().all(|c| c.std_error.is_some()));
        assert!(report.coefficient("abundance:x^2").unwrap().estimate < 0.0);
    }

    #[test]
    fn test_intercept_only_matches_log_mean() {
        let mut spec = ModelSpec::quadratic_poisson("x");
        spec.predictors[0].terms.truncate(1);
        let obs = data();
        let model = CountModel::compile(&spec, &obs).unwrap();
        let report = IrlsFitter::default().fit(&model, array![0.0].view()).unwrap();
        let mean = obs.counts().sum() / obs.len() as f64;
        assert_relative_eq!(report.estimates()[0], mean.ln(), epsilon = 1e-8);
    }

    #[test]
    fn test_one_iteration_is_a_convergence_failure() {
        let model = CountModel::compile(&ModelSpec::quadratic_poisson("x"), &data()).unwrap();
        let fitter = IrlsFitter {
            max_iterations: 1,
            tolerance: 1e-8,
        };
        match fitter.fit(&model, Array1::zeros(3).view()) {
            Err(FitError::ConvergenceFailure {
                iterations,
                estimates,
                ..
            }) => {
                assert_eq!(iterations, 1);
                assert_eq!(estimates.len(), 3);
                assert!(estimates.iter().all(|b| b.is_finite()));
            }
            other => panic!("expected ConvergenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_occupancy_is_unsupported() {
        let table = CovariateTable::new(2).with_column("forest", array![0.0, 1.0]).unwrap();
        let obs = ObservationSet::new(array![1.0, 0.0], table)
            .unwrap()
            .with_visits(array![2.0, 2.0])
            .unwrap();
        let model = CountModel::compile(&ModelSpec::occupancy("forest"), &obs).unwrap();
        assert!(matches!(
            IrlsFitter::default().fit(&model, Array1::zeros(3).view()),
            Err(FitError::UnsupportedFamily { .. })
        ));
    }
}
