//! Numeric minimization with `wolfe_bfgs`.
//!
//! `minimize` adapts a fallible objective to the optimizer's closure
//! interface: evaluation failures and non-finite values become a large finite
//! cost with a zero gradient, so the line search backs off instead of
//! aborting. The best point seen is tracked so that a failed run can still
//! report where it got to.

use crate::design::CountModel;
use crate::fitter::{
    FitError, FitMethod, FitReport, ModelFitter, check_initial, covariance_from_information,
    point_estimate_report,
};
use crate::likelihood::InvalidInput;
use ndarray::{Array1, ArrayView1};
use std::cell::{Cell, RefCell};
use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

/// Returned to the optimizer in place of an invalid objective value.
const LARGE_COST: f64 = 1e10;

/// Gradient norm at which a stalled line search is accepted as converged.
const STALL_GRADIENT_NORM: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
}

pub(crate) fn minimize<F>(
    objective: F,
    init: ArrayView1<f64>,
    max_iterations: usize,
    tolerance: f64,
    method: FitMethod,
) -> Result<Minimum, FitError>
where
    F: Fn(ArrayView1<f64>) -> Result<(f64, Array1<f64>), InvalidInput>,
{
    let best = RefCell::new((f64::INFINITY, init.to_owned()));
    let evaluations = Cell::new(0usize);

    let cost_and_grad = |point: &Array1<f64>| -> (f64, Array1<f64>) {
        evaluations.set(evaluations.get() + 1);
        match objective(point.view()) {
            Ok((value, grad)) if value.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                let mut best = best.borrow_mut();
                if value < best.0 {
                    *best = (value, point.clone());
                }
                (value, grad)
            }
            Ok((value, _)) => {
                log::debug!(
                    "Non-finite objective {value} encountered; returning a large finite cost"
                );
                (LARGE_COST, Array1::zeros(point.len()))
            }
            Err(e) => {
                log::debug!("Objective evaluation failed ({e}); returning a large finite cost");
                (LARGE_COST, Array1::zeros(point.len()))
            }
        }
    };

    let outcome = Bfgs::new(init.to_owned(), cost_and_grad)
        .with_tolerance(tolerance)
        .with_max_iterations(max_iterations)
        .run();

    let (best_value, best_point) = best.into_inner();
    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) if final_value.is_finite() && final_value < LARGE_COST => Ok(Minimum {
            point: final_point,
            value: final_value,
            iterations,
        }),
        Ok(BfgsSolution { iterations, .. }) => Err(FitError::ConvergenceFailure {
            method,
            iterations,
            objective: best_value,
            estimates: best_point.to_vec(),
            reason: "optimizer ended at a point where the objective is undefined".to_string(),
        }),
        Err(e) => recover_best_point(
            &objective,
            e,
            best_point,
            best_value,
            evaluations.get(),
            method,
        ),
    }
}

/// Settles a failed BFGS run. The best point seen is accepted when the
/// gradient there has vanished; otherwise it is carried in the
/// `ConvergenceFailure` as a restart point.
fn recover_best_point<F>(
    objective: &F,
    error: BfgsError,
    best_point: Array1<f64>,
    best_value: f64,
    evaluations: usize,
    method: FitMethod,
) -> Result<Minimum, FitError>
where
    F: Fn(ArrayView1<f64>) -> Result<(f64, Array1<f64>), InvalidInput>,
{
    let stalled_at_optimum = best_value.is_finite()
        && objective(best_point.view())
            .map(|(_, grad)| grad.dot(&grad).sqrt() <= STALL_GRADIENT_NORM)
            .unwrap_or(false);
    if stalled_at_optimum {
        log::warn!(
            "{method} line search stalled at a stationary point; accepting it ({error:?})"
        );
        return Ok(Minimum {
            point: best_point,
            value: best_value,
            iterations: evaluations,
        });
    }
    Err(FitError::ConvergenceFailure {
        method,
        iterations: evaluations,
        objective: best_value,
        estimates: best_point.to_vec(),
        reason: format!("BFGS failed: {error:?}"),
    })
}

/// Maximizes the log-posterior (log-likelihood plus log-prior).
pub(crate) fn posterior_mode(
    model: &CountModel,
    init: ArrayView1<f64>,
    max_iterations: usize,
    tolerance: f64,
    method: FitMethod,
) -> Result<Minimum, FitError> {
    minimize(
        |beta| {
            let value = -model.log_posterior(beta)?;
            let grad = -(model.gradient(beta)? + model.log_prior_gradient(beta));
            Ok((value, grad))
        },
        init,
        max_iterations,
        tolerance,
        method,
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct BfgsFitter {
    pub max_iterations: usize,
    /// Gradient-norm tolerance passed to the optimizer.
    pub tolerance: f64,
}

impl Default for BfgsFitter {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-6,
        }
    }
}

impl ModelFitter for BfgsFitter {
    fn method(&self) -> FitMethod {
        FitMethod::Bfgs
    }

    fn fit(&self, model: &CountModel, init: ArrayView1<f64>) -> Result<FitReport, FitError> {
        check_initial(model, init)?;
        log::info!("Starting BFGS optimization with {} parameters", model.dim());

        let Minimum {
            point,
            value,
            iterations,
        } = minimize(
            |beta| Ok((-model.log_likelihood(beta)?, -model.gradient(beta)?)),
            init,
            self.max_iterations,
            self.tolerance,
            FitMethod::Bfgs,
        )?;
        log::info!("BFGS finished in {iterations} iterations with objective {value:.6}");

        let information = -model.hessian(point.view())?;
        let covariance = covariance_from_information(&information);
        Ok(point_estimate_report(
            FitMethod::Bfgs,
            model,
            point.view(),
            value,
            iterations,
            covariance,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CovariateTable, ObservationSet};
    use crate::irls::IrlsFitter;
    use crate::spec::{ModelSpec, Prior};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn data() -> ObservationSet {
        let table = CovariateTable::new(8)
            .with_column("x", array![-1.6, -1.1, -0.5, -0.2, 0.1, 0.6, 1.0, 1.7])
            .unwrap();
        ObservationSet::new(array![0.0, 2.0, 4.0, 7.0, 6.0, 5.0, 2.0, 1.0], table).unwrap()
    }

    #[test]
    fn test_minimize_quadratic_bowl() {
        let found = minimize(
            |b| {
                let d = &b - &array![1.0, -2.0];
                Ok((d.dot(&d), 2.0 * d))
            },
            array![0.0, 0.0].view(),
            100,
            1e-8,
            FitMethod::Bfgs,
        )
        .unwrap();
        assert_relative_eq!(found.point[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(found.point[1], -2.0, epsilon = 1e-5);
    }

    fn bowl(b: ArrayView1<f64>) -> Result<(f64, Array1<f64>), InvalidInput> {
        let d = &b - &array![1.0, -2.0];
        Ok((d.dot(&d), 2.0 * d))
    }

    #[test]
    fn test_stalled_search_at_optimum_is_accepted() {
        let found = recover_best_point(
            &bowl,
            BfgsError::GradientIsNaN,
            array![1.0, -2.0],
            0.0,
            17,
            FitMethod::Bfgs,
        )
        .unwrap();
        assert_eq!(found.point, array![1.0, -2.0]);
        assert_eq!(found.iterations, 17);
    }

    #[test]
    fn test_failed_search_carries_best_point() {
        let err = recover_best_point(
            &bowl,
            BfgsError::GradientIsNaN,
            array![0.0, 0.0],
            5.0,
            9,
            FitMethod::Bfgs,
        )
        .unwrap_err();
        match err {
            FitError::ConvergenceFailure {
                method,
                iterations,
                objective,
                estimates,
                ..
            } => {
                assert_eq!(method, FitMethod::Bfgs);
                assert_eq!(iterations, 9);
                assert_eq!(objective, 5.0);
                assert_eq!(estimates, vec![0.0, 0.0]);
            }
            other => panic!("Expected ConvergenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_objective_is_a_convergence_failure() {
        let result = minimize(
            |_| Err(InvalidInput::Overflow { index: 0, eta: 1e3 }),
            array![0.5, 0.5].view(),
            50,
            1e-6,
            FitMethod::Bfgs,
        );
        match result {
            Err(FitError::ConvergenceFailure {
                objective,
                estimates,
                ..
            }) => {
                assert_eq!(estimates, vec![0.5, 0.5]);
                assert!(objective.is_infinite());
            }
            other => panic!("Expected ConvergenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_iteration_limit_is_a_convergence_failure() {
        let model = CountModel::compile(&ModelSpec::quadratic_poisson("x"), &data()).unwrap();
        let init = array![2.0, -2.0, 2.0];
        let start = -model.log_likelihood(init.view()).unwrap();
        let fitter = BfgsFitter {
            max_iterations: 1,
            tolerance: 1e-10,
        };
        match fitter.fit(&model, init.view()) {
            Err(FitError::ConvergenceFailure {
                method,
                objective,
                estimates,
                ..
            }) => {
                assert_eq!(method, FitMethod::Bfgs);
                assert_eq!(estimates.len(), 3);
                assert!(estimates.iter().all(|v| v.is_finite()));
                assert!(objective <= start);
            }
            other => panic!("Expected ConvergenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_bfgs_agrees_with_irls() {
        let model = CountModel::compile(&ModelSpec::quadratic_poisson("x"), &data()).unwrap();
        let irls = IrlsFitter::default().fit(&model, array![0.0, 0.0, 0.0].view()).unwrap();
        let bfgs = BfgsFitter::default().fit(&model, array![0.3, -0.2, 0.1].view()).unwrap();
        for (a, b) in irls.estimates().iter().zip(bfgs.estimates().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
        assert_relative_eq!(irls.objective, bfgs.objective, epsilon = 1e-6);
    }

    #[test]
    fn test_bfgs_fits_occupancy() {
        let table = CovariateTable::new(6)
            .with_column("forest", array![-1.2, -0.6, 0.0, 0.4, 0.9, 1.5])
            .unwrap();
        let obs = ObservationSet::new(array![0.0, 0.0, 1.0, 0.0, 2.0, 3.0], table)
            .unwrap()
            .with_visits(array![3.0, 3.0, 3.0, 3.0, 3.0, 3.0])
            .unwrap();
        let model = CountModel::compile(&ModelSpec::occupancy("forest"), &obs).unwrap();
        let report = BfgsFitter::default().fit(&model, array![0.0, 0.0, 0.0].view()).unwrap();
        assert!(report.coefficient("occupancy:forest").unwrap().estimate > 0.0);
        assert!(report.dispersion.is_none());
    }

    #[test]
    fn test_posterior_mode_is_pulled_towards_prior() {
        let strong = Prior::Normal { mean: 0.0, sd: 0.01 };
        let spec = ModelSpec::quadratic_poisson("x").with_prior("abundance:x^2", strong);
        let model = CountModel::compile(&spec, &data()).unwrap();
        let mode = posterior_mode(&model, array![0.0, 0.0, 0.0].view(), 200, 1e-6, FitMethod::Mcmc)
            .unwrap();
        assert!(mode.point[2].abs() < 0.05);
    }
}
