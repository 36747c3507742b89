//! Compiles a `ModelSpec` against an `ObservationSet` into design matrices and
//! a `CountModel` that evaluates the log-likelihood and its derivatives.
//!
//! Coefficients are laid out predictor by predictor in the canonical order of
//! `ModelSpec::ordered_predictors`, each block in term order.

use crate::data::{CovariateTable, ObservationSet};
use crate::likelihood::{InvalidInput, NeumaierSum, poisson_deviance, validate_finite};
use crate::spec::{Family, LinearPredictor, LinkFunction, ModelSpec, Prior, SpecError, Term};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use statrs::function::factorial::ln_binomial;
use std::f64::consts::PI;

/// Builds the design matrix of one linear predictor, one column per term
/// label.
pub fn design_matrix(
    predictor: &LinearPredictor,
    table: &CovariateTable,
) -> Result<Array2<f64>, SpecError> {
    let n = table.n_rows();
    let mut x = Array2::<f64>::zeros((n, predictor.width()));
    let lookup = |covariate: &str| {
        table
            .column(covariate)
            .ok_or_else(|| SpecError::UnknownCovariate {
                predictor: predictor.name.clone(),
                covariate: covariate.to_string(),
            })
    };

    let mut col = 0;
    for term in &predictor.terms {
        match term {
            Term::Intercept => x.column_mut(col).fill(1.0),
            Term::Linear { covariate } => x.column_mut(col).assign(&lookup(covariate)?),
            Term::Quadratic { covariate } => {
                x.column_mut(col).assign(&lookup(covariate)?.mapv(|v| v * v))
            }
            Term::Harmonic { covariate, period } => {
                let t = lookup(covariate)?;
                let angle = t.mapv(|v| 2.0 * PI * v / period);
                x.column_mut(col).assign(&angle.mapv(f64::sin));
                x.column_mut(col + 1).assign(&angle.mapv(f64::cos));
            }
        }
        col += term.width();
    }
    Ok(x)
}

/// `ln(1 + e^x)` without overflow.
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    let hi = a.max(b);
    if hi == f64::NEG_INFINITY {
        return hi;
    }
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

/// `Aᵀ diag(w) B`.
fn weighted_cross(a: ArrayView2<f64>, w: ArrayView1<f64>, b: ArrayView2<f64>) -> Array2<f64> {
    let wb = &b * &w.insert_axis(Axis(1));
    a.t().dot(&wb)
}

#[derive(Debug, Clone)]
struct PredictorBlock {
    name: String,
    link: LinkFunction,
    design: Array2<f64>,
    start: usize,
}

impl PredictorBlock {
    fn width(&self) -> usize {
        self.design.ncols()
    }

    fn eta(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        self.design
            .dot(&beta.slice(s![self.start..self.start + self.width()]))
    }
}

/// Per-site quantities of the occupancy likelihood.
struct SiteTerms {
    log_lik: f64,
    /// Derivatives of the site log-likelihood with respect to the occupancy
    /// and detection linear predictors.
    d_occ: f64,
    d_det: f64,
    dd_occ: f64,
    dd_det: f64,
    dd_cross: f64,
}

/// Marginal likelihood of one site with latent occupancy summed out:
/// `y > 0`: `ψ·C(J, y)·p^y·(1−p)^(J−y)`;
/// `y = 0`: `ψ·(1−p)^J + (1−ψ)`.
fn occupancy_site(y: f64, visits: f64, eta_occ: f64, eta_det: f64) -> SiteTerms {
    let psi = 1.0 / (1.0 + (-eta_occ).exp());
    let p = 1.0 / (1.0 + (-eta_det).exp());
    let log_psi = -softplus(-eta_occ);
    let log_not_psi = -softplus(eta_occ);
    let log_p = -softplus(-eta_det);
    let log_not_p = -softplus(eta_det);

    // r is the posterior probability that the site is occupied.
    let (log_lik, r) = if y > 0.0 {
        let ll = log_psi
            + ln_binomial(visits as u64, y as u64)
            + y * log_p
            + (visits - y) * log_not_p;
        (ll, 1.0)
    } else {
        let log_present = log_psi + visits * log_not_p;
        let ll = log_add_exp(log_present, log_not_psi);
        (ll, (log_present - ll).exp())
    };

    let r_var = r * (1.0 - r);
    SiteTerms {
        log_lik,
        d_occ: r - psi,
        d_det: r * (y - visits * p),
        dd_occ: r_var - psi * (1.0 - psi),
        dd_det: r_var * visits * visits * p * p - r * visits * p * (1.0 - p),
        dd_cross: -r_var * visits * p,
    }
}

/// A model bound to its data, ready for evaluation by any fitter.
#[derive(Debug, Clone)]
pub struct CountModel {
    family: Family,
    names: Vec<String>,
    blocks: Vec<PredictorBlock>,
    counts: Array1<f64>,
    visits: Option<Array1<f64>>,
    priors: Vec<Prior>,
}

impl CountModel {
    pub fn compile(spec: &ModelSpec, observations: &ObservationSet) -> Result<Self, SpecError> {
        spec.validate_against(observations)?;

        let mut blocks = Vec::new();
        let mut start = 0;
        for predictor in spec.ordered_predictors()? {
            let design = design_matrix(predictor, observations.covariates())?;
            let width = design.ncols();
            blocks.push(PredictorBlock {
                name: predictor.name.clone(),
                link: predictor.link,
                design,
                start,
            });
            start += width;
        }

        let model = Self {
            family: spec.family,
            names: spec.coefficient_names()?,
            blocks,
            counts: observations.counts().to_owned(),
            visits: observations.visits().map(|v| v.to_owned()),
            priors: spec.coefficient_priors()?,
        };
        log::info!(
            "Compiled {} model '{}' with {} coefficients over {} records",
            model.family,
            spec.name,
            model.dim(),
            model.n_observations()
        );
        Ok(model)
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    pub fn n_observations(&self) -> usize {
        self.counts.len()
    }

    pub fn coefficient_names(&self) -> &[String] {
        &self.names
    }

    pub fn counts(&self) -> ArrayView1<'_, f64> {
        self.counts.view()
    }

    /// The design matrix and response of a Poisson model, for solvers that
    /// work on the GLM directly. `None` for other families.
    pub fn glm_parts(&self) -> Option<(ArrayView2<'_, f64>, ArrayView1<'_, f64>)> {
        match (self.family, self.blocks.as_slice()) {
            (Family::Poisson, [block]) => Some((block.design.view(), self.counts.view())),
            _ => None,
        }
    }

    fn check_beta(&self, beta: ArrayView1<f64>) -> Result<(), InvalidInput> {
        if beta.len() != self.dim() {
            return Err(InvalidInput::LengthMismatch {
                name: "beta".to_string(),
                expected: self.dim(),
                found: beta.len(),
            });
        }
        validate_finite("beta", beta)
    }

    fn occupancy_sites(&self, beta: ArrayView1<f64>) -> Result<Vec<SiteTerms>, InvalidInput> {
        let visits = self.visits.as_ref().ok_or_else(|| InvalidInput::LengthMismatch {
            name: "visits".to_string(),
            expected: self.counts.len(),
            found: 0,
        })?;
        let eta_occ = self.blocks[0].eta(beta);
        let eta_det = self.blocks[1].eta(beta);
        Ok((0..self.counts.len())
            .map(|i| occupancy_site(self.counts[i], visits[i], eta_occ[i], eta_det[i]))
            .collect())
    }

    /// Linear predictor of every block, in canonical order.
    pub fn linear_predictors(
        &self,
        beta: ArrayView1<f64>,
    ) -> Result<Vec<Array1<f64>>, InvalidInput> {
        self.check_beta(beta)?;
        Ok(self.blocks.iter().map(|b| b.eta(beta)).collect())
    }

    /// Means on the response scale of every block: λ for Poisson, ψ and p for
    /// occupancy.
    pub fn fitted_means(
        &self,
        beta: ArrayView1<f64>,
    ) -> Result<Vec<(String, Array1<f64>)>, InvalidInput> {
        let etas = self.linear_predictors(beta)?;
        Ok(self
            .blocks
            .iter()
            .zip(etas)
            .map(|(block, eta)| (block.name.clone(), eta.mapv(|e| block.link.inverse(e))))
            .collect())
    }

    /// Expected count per record: `λ` for Poisson, `ψ·J·p` for occupancy.
    pub fn expected_counts(&self, beta: ArrayView1<f64>) -> Result<Array1<f64>, InvalidInput> {
        let means = self.fitted_means(beta)?;
        match (self.family, &self.visits) {
            (Family::Occupancy, Some(visits)) => Ok(&means[0].1 * &means[1].1 * visits),
            _ => Ok(means[0].1.clone()),
        }
    }

    pub fn log_likelihood(&self, beta: ArrayView1<f64>) -> Result<f64, InvalidInput> {
        self.check_beta(beta)?;
        match self.family {
            Family::Poisson => {
                let eta = self.blocks[0].eta(beta);
                Ok(-poisson_deviance(self.counts.view(), eta.view())?)
            }
            Family::Occupancy => {
                let acc: NeumaierSum = self
                    .occupancy_sites(beta)?
                    .iter()
                    .map(|site| site.log_lik)
                    .collect();
                Ok(acc.total())
            }
        }
    }

    pub fn gradient(&self, beta: ArrayView1<f64>) -> Result<Array1<f64>, InvalidInput> {
        self.check_beta(beta)?;
        match self.family {
            Family::Poisson => {
                let block = &self.blocks[0];
                let mu = block.eta(beta).mapv(f64::exp);
                let residual = &self.counts - &mu;
                Ok(block.design.t().dot(&residual))
            }
            Family::Occupancy => {
                let sites = self.occupancy_sites(beta)?;
                let d_occ: Array1<f64> = sites.iter().map(|s| s.d_occ).collect();
                let d_det: Array1<f64> = sites.iter().map(|s| s.d_det).collect();
                let (occ, det) = (&self.blocks[0], &self.blocks[1]);

                let mut grad = Array1::zeros(self.dim());
                grad.slice_mut(s![occ.start..occ.start + occ.width()])
                    .assign(&occ.design.t().dot(&d_occ));
                grad.slice_mut(s![det.start..det.start + det.width()])
                    .assign(&det.design.t().dot(&d_det));
                Ok(grad)
            }
        }
    }

    pub fn hessian(&self, beta: ArrayView1<f64>) -> Result<Array2<f64>, InvalidInput> {
        self.check_beta(beta)?;
        match self.family {
            Family::Poisson => {
                let block = &self.blocks[0];
                let mu = block.eta(beta).mapv(f64::exp);
                let x = block.design.view();
                Ok(-weighted_cross(x, mu.view(), x))
            }
            Family::Occupancy => {
                let sites = self.occupancy_sites(beta)?;
                let w_occ: Array1<f64> = sites.iter().map(|s| s.dd_occ).collect();
                let w_det: Array1<f64> = sites.iter().map(|s| s.dd_det).collect();
                let w_cross: Array1<f64> = sites.iter().map(|s| s.dd_cross).collect();
                let (occ, det) = (&self.blocks[0], &self.blocks[1]);
                let (xo, xd) = (occ.design.view(), det.design.view());
                let (o, d) = (
                    occ.start..occ.start + occ.width(),
                    det.start..det.start + det.width(),
                );

                let mut h = Array2::zeros((self.dim(), self.dim()));
                let cross = weighted_cross(xo, w_cross.view(), xd);
                h.slice_mut(s![o.clone(), o.clone()])
                    .assign(&weighted_cross(xo, w_occ.view(), xo));
                h.slice_mut(s![d.clone(), d.clone()])
                    .assign(&weighted_cross(xd, w_det.view(), xd));
                h.slice_mut(s![o.clone(), d.clone()]).assign(&cross);
                h.slice_mut(s![d, o]).assign(&cross.t());
                Ok(h)
            }
        }
    }

    pub fn log_prior(&self, beta: ArrayView1<f64>) -> f64 {
        self.priors
            .iter()
            .zip(beta.iter())
            .map(|(prior, &b)| prior.log_density(b))
            .sum()
    }

    pub fn log_prior_gradient(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        self.priors
            .iter()
            .zip(beta.iter())
            .map(|(prior, &b)| prior.log_density_derivative(b))
            .collect()
    }

    /// The prior Hessian is diagonal because priors are independent.
    pub fn log_prior_hessian_diag(&self, beta: ArrayView1<f64>) -> Array1<f64> {
        self.priors
            .iter()
            .zip(beta.iter())
            .map(|(prior, &b)| prior.log_density_second_derivative(b))
            .collect()
    }

    pub fn log_posterior(&self, beta: ArrayView1<f64>) -> Result<f64, InvalidInput> {
        Ok(self.log_likelihood(beta)? + self.log_prior(beta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::quadratic_deviance;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn quadratic_data() -> ObservationSet {
        let table = CovariateTable::new(5)
            .with_column("x", array![-1.2, -0.4, 0.0, 0.7, 1.5])
            .unwrap();
        ObservationSet::new(array![1.0, 4.0, 6.0, 3.0, 0.0], table).unwrap()
    }

    fn occupancy_data() -> ObservationSet {
        let table = CovariateTable::new(4)
            .with_column("forest", array![-1.0, 0.3, 0.8, 1.4])
            .unwrap();
        ObservationSet::new(array![0.0, 2.0, 0.0, 3.0], table)
            .unwrap()
            .with_visits(array![3.0, 3.0, 4.0, 4.0])
            .unwrap()
    }

    fn finite_difference_gradient(model: &CountModel, beta: &Array1<f64>) -> Array1<f64> {
        let h = 1e-6;
        (0..beta.len())
            .map(|j| {
                let mut up = beta.clone();
                let mut down = beta.clone();
                up[j] += h;
                down[j] -= h;
                let upper = model.log_likelihood(up.view()).unwrap();
                let lower = model.log_likelihood(down.view()).unwrap();
                (upper - lower) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_design_columns() {
        let spec = ModelSpec::periodic_poisson("x", "time", 4.0);
        let table = CovariateTable::new(2)
            .with_column("x", array![0.5, -1.0])
            .unwrap()
            .with_column("time", array![0.0, 1.0])
            .unwrap();
        let x = design_matrix(&spec.predictors[0], &table).unwrap();
        assert_eq!(x.dim(), (2, 4));
        assert_eq!(x.column(0), array![1.0, 1.0]);
        assert_eq!(x.column(1), array![0.5, -1.0]);
        assert_relative_eq!(x[[0, 2]], 0.0);
        assert_relative_eq!(x[[1, 2]], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[[1, 3]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_poisson_log_likelihood_is_negated_deviance() {
        let obs = quadratic_data();
        let model = CountModel::compile(&ModelSpec::quadratic_poisson("x"), &obs).unwrap();
        let beta = array![0.9, 0.2, -0.4];
        let x = obs.covariate("x").unwrap();
        let expected = quadratic_deviance(obs.counts(), x, [0.9, 0.2, -0.4]).unwrap();
        assert_relative_eq!(model.log_likelihood(beta.view()).unwrap(), -expected, epsilon = 1e-12);
    }

    #[test]
    fn test_poisson_gradient_and_hessian() {
        let model =
            CountModel::compile(&ModelSpec::quadratic_poisson("x"), &quadratic_data()).unwrap();
        let beta = array![0.9, 0.2, -0.4];
        let grad = model.gradient(beta.view()).unwrap();
        let fd = finite_difference_gradient(&model, &beta);
        for j in 0..3 {
            assert_relative_eq!(grad[j], fd[j], epsilon = 1e-5);
        }
        let h = model.hessian(beta.view()).unwrap();
        assert_relative_eq!(h[[0, 1]], h[[1, 0]]);
        assert!(h[[0, 0]] < 0.0);
    }

    #[test]
    fn test_occupancy_matches_hand_computation() {
        // One site with two detections, one empty site, no covariate effect.
        let table = CovariateTable::new(2).with_column("forest", array![0.0, 0.0]).unwrap();
        let obs = ObservationSet::new(array![2.0, 0.0], table)
            .unwrap()
            .with_visits(array![3.0, 3.0])
            .unwrap();
        let model = CountModel::compile(&ModelSpec::occupancy("forest"), &obs).unwrap();

        let (psi, p) = (0.6_f64, 0.3_f64);
        let logit = |q: f64| (q / (1.0 - q)).ln();
        let beta = array![logit(psi), 0.0, logit(p)];

        let detected = (psi * 3.0 * p * p * (1.0 - p)).ln();
        let missed = (psi * (1.0 - p).powi(3) + (1.0 - psi)).ln();
        assert_relative_eq!(
            model.log_likelihood(beta.view()).unwrap(),
            detected + missed,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_occupancy_derivatives_match_finite_differences() {
        let model =
            CountModel::compile(&ModelSpec::occupancy("forest"), &occupancy_data()).unwrap();
        let beta = array![0.4, -0.7, 0.2];
        let grad = model.gradient(beta.view()).unwrap();
        let fd = finite_difference_gradient(&model, &beta);
        for j in 0..3 {
            assert_relative_eq!(grad[j], fd[j], epsilon = 1e-5);
        }

        let hess = model.hessian(beta.view()).unwrap();
        let h = 1e-5;
        for j in 0..3 {
            let mut up = beta.clone();
            let mut down = beta.clone();
            up[j] += h;
            down[j] -= h;
            let upper = model.gradient(up.view()).unwrap();
            let lower = model.gradient(down.view()).unwrap();
            let column = (upper - lower) / (2.0 * h);
            for i in 0..3 {
                assert_relative_eq!(hess[[i, j]], column[i], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_bad_beta_is_rejected() {
        let model =
            CountModel::compile(&ModelSpec::quadratic_poisson("x"), &quadratic_data()).unwrap();
        assert!(matches!(
            model.log_likelihood(array![0.0, 1.0].view()),
            Err(InvalidInput::LengthMismatch { .. })
        ));
        assert!(matches!(
            model.gradient(array![0.0, f64::NAN, 1.0].view()),
            Err(InvalidInput::NonFinite { .. })
        ));
    }

    #[test]
    fn test_glm_parts_only_for_poisson() {
        let poisson =
            CountModel::compile(&ModelSpec::quadratic_poisson("x"), &quadratic_data()).unwrap();
        assert_eq!(poisson.glm_parts().map(|(x, _)| x.dim()), Some((5, 3)));
        let occupancy =
            CountModel::compile(&ModelSpec::occupancy("forest"), &occupancy_data()).unwrap();
        assert!(occupancy.glm_parts().is_none());
    }

    #[test]
    fn test_prior_terms() {
        let spec = ModelSpec::quadratic_poisson("x").with_prior("abundance:x", Prior::Flat);
        let model = CountModel::compile(&spec, &quadratic_data()).unwrap();
        let beta = array![1.0, 5.0, -1.0];
        let grad = model.log_prior_gradient(beta.view());
        assert_relative_eq!(grad[0], -0.01);
        assert_eq!(grad[1], 0.0);
        assert_relative_eq!(model.log_prior_hessian_diag(beta.view())[2], -0.01);
    }
}
