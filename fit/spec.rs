//! # Declarative Model Specification
//!
//! A `ModelSpec` describes a count model as data: the response family, one or
//! more linear predictors (each a list of terms under a link function), and
//! the priors used by the sampler. Specs are written to and read from TOML
//! and are checked statically by `validate` before any fitting run starts.
//!
//! Two families are supported:
//!
//! - `poisson`: a single predictor with a log link,
//!   `n_i ~ Poisson(exp(η_i))`. A harmonic term over a time covariate gives
//!   the periodic time-series variant.
//! - `occupancy`: two predictors with logit links named `occupancy` (ψ) and
//!   `detection` (p). Site `i` is occupied with probability `ψ_i` and each of
//!   its `J_i` visits detects the species with probability `p_i` if occupied.

use crate::data::ObservationSet;
use crate::likelihood::InvalidInput;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const OCCUPANCY_PREDICTOR: &str = "occupancy";
pub const DETECTION_PREDICTOR: &str = "detection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Poisson,
    Occupancy,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Poisson => write!(f, "poisson"),
            Family::Occupancy => write!(f, "occupancy"),
        }
    }
}

/// Connects a linear predictor to the mean of its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// `μ = exp(η)`, for Poisson rates.
    Log,
    /// `μ = 1 / (1 + exp(−η))`, for probabilities.
    Logit,
}

impl LinkFunction {
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Log => eta.exp(),
            LinkFunction::Logit => 1.0 / (1.0 + (-eta).exp()),
        }
    }
}

impl fmt::Display for LinkFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFunction::Log => write!(f, "log"),
            LinkFunction::Logit => write!(f, "logit"),
        }
    }
}

/// One additive component of a linear predictor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Term {
    Intercept,
    Linear { covariate: String },
    Quadratic { covariate: String },
    /// `sin(2πt/period)` and `cos(2πt/period)` of the covariate.
    Harmonic { covariate: String, period: f64 },
}

impl Term {
    pub fn covariate(&self) -> Option<&str> {
        match self {
            Term::Intercept => None,
            Term::Linear { covariate }
            | Term::Quadratic { covariate }
            | Term::Harmonic { covariate, .. } => Some(covariate),
        }
    }

    /// Column labels this term contributes to the design matrix.
    pub fn labels(&self) -> Vec<String> {
        match self {
            Term::Intercept => vec!["(Intercept)".to_string()],
            Term::Linear { covariate } => vec![covariate.clone()],
            Term::Quadratic { covariate } => vec![format!("{covariate}^2")],
            Term::Harmonic { covariate, period } => vec![
                format!("sin({covariate}, {period})"),
                format!("cos({covariate}, {period})"),
            ],
        }
    }

    pub fn width(&self) -> usize {
        match self {
            Term::Harmonic { .. } => 2,
            _ => 1,
        }
    }
}

/// A prior distribution on one coefficient. Only the sampler uses priors;
/// the IRLS and BFGS fitters maximize the likelihood alone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "lowercase")]
pub enum Prior {
    Flat,
    Normal { mean: f64, sd: f64 },
    Cauchy { location: f64, scale: f64 },
}

impl Default for Prior {
    fn default() -> Self {
        Prior::Normal {
            mean: 0.0,
            sd: 10.0,
        }
    }
}

impl Prior {
    pub fn log_density(&self, value: f64) -> f64 {
        match *self {
            Prior::Flat => 0.0,
            Prior::Normal { mean, sd } => {
                let z = (value - mean) / sd;
                -0.5 * z * z - sd.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
            }
            Prior::Cauchy { location, scale } => {
                let u = (value - location) / scale;
                -(std::f64::consts::PI * scale * (1.0 + u * u)).ln()
            }
        }
    }

    pub fn log_density_derivative(&self, value: f64) -> f64 {
        match *self {
            Prior::Flat => 0.0,
            Prior::Normal { mean, sd } => -(value - mean) / (sd * sd),
            Prior::Cauchy { location, scale } => {
                let u = (value - location) / scale;
                -2.0 * u / (scale * (1.0 + u * u))
            }
        }
    }

    pub fn log_density_second_derivative(&self, value: f64) -> f64 {
        match *self {
            Prior::Flat => 0.0,
            Prior::Normal { sd, .. } => -1.0 / (sd * sd),
            Prior::Cauchy { location, scale } => {
                let u = (value - location) / scale;
                let denom = 1.0 + u * u;
                -2.0 * (1.0 - u * u) / (scale * scale * denom * denom)
            }
        }
    }

    fn validate(&self, target: &str) -> Result<(), SpecError> {
        let invalid = |reason: &str| SpecError::InvalidPrior {
            target: target.to_string(),
            reason: reason.to_string(),
        };
        match *self {
            Prior::Flat => Ok(()),
            Prior::Normal { mean, sd } => {
                if !mean.is_finite() {
                    return Err(invalid("normal mean must be finite"));
                }
                if !(sd.is_finite() && sd > 0.0) {
                    return Err(invalid("normal sd must be positive and finite"));
                }
                Ok(())
            }
            Prior::Cauchy { location, scale } => {
                if !location.is_finite() {
                    return Err(invalid("cauchy location must be finite"));
                }
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(invalid("cauchy scale must be positive and finite"));
                }
                Ok(())
            }
        }
    }
}

/// A named linear predictor: `g(μ) = Σ terms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub name: String,
    pub link: LinkFunction,
    pub terms: Vec<Term>,
}

impl LinearPredictor {
    pub fn coefficient_names(&self) -> Vec<String> {
        self.terms
            .iter()
            .flat_map(Term::labels)
            .map(|label| format!("{}:{}", self.name, label))
            .collect()
    }

    pub fn width(&self) -> usize {
        self.terms.iter().map(Term::width).sum()
    }
}

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Model '{0}' has no linear predictors.")]
    NoPredictors(String),

    #[error("The {family} family needs {expected} linear predictor(s), found {found}.")]
    WrongPredictorCount {
        family: Family,
        expected: usize,
        found: usize,
    },

    #[error("The {family} family needs a linear predictor named '{name}'.")]
    MissingPredictor { family: Family, name: &'static str },

    #[error("Linear predictor '{0}' is declared more than once.")]
    DuplicatePredictor(String),

    #[error("Linear predictor '{predictor}' must use the {expected} link, found {found}.")]
    WrongLink {
        predictor: String,
        expected: LinkFunction,
        found: LinkFunction,
    },

    #[error("Linear predictor '{0}' has no terms.")]
    EmptyPredictor(String),

    #[error("Term '{term}' appears more than once in linear predictor '{predictor}'.")]
    DuplicateTerm { predictor: String, term: String },

    #[error(
        "Harmonic term on '{covariate}' in '{predictor}' needs a positive, finite period, found {period}."
    )]
    InvalidPeriod {
        predictor: String,
        covariate: String,
        period: f64,
    },

    #[error("Invalid prior for '{target}': {reason}.")]
    InvalidPrior { target: String, reason: String },

    #[error("A prior is given for '{0}', which is not a coefficient of this model.")]
    UnknownPriorTarget(String),

    #[error(
        "Linear predictor '{predictor}' uses covariate '{covariate}', which is not in the data."
    )]
    UnknownCovariate {
        predictor: String,
        covariate: String,
    },

    #[error("Occupancy models need per-site visit counts, but the data has none.")]
    MissingVisits,

    #[error("Invalid data for this model: {0}")]
    Invalid(#[from] InvalidInput),

    #[error("Failed to read or write model specification: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML model specification: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model specification to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// The complete, declarative definition of a count model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub family: Family,
    /// Prior for every coefficient without an entry in `priors`.
    #[serde(default)]
    pub default_prior: Prior,
    /// Coefficient-specific priors keyed by `"{predictor}:{term}"`.
    #[serde(default)]
    pub priors: BTreeMap<String, Prior>,
    pub predictors: Vec<LinearPredictor>,
}

impl ModelSpec {
    /// `ln λ = β0 + β1·x + β2·x²`.
    pub fn quadratic_poisson(covariate: &str) -> Self {
        Self {
            name: "quadratic-poisson".to_string(),
            family: Family::Poisson,
            default_prior: Prior::default(),
            priors: BTreeMap::new(),
            predictors: vec![LinearPredictor {
                name: "abundance".to_string(),
                link: LinkFunction::Log,
                terms: vec![
                    Term::Intercept,
                    Term::Linear {
                        covariate: covariate.to_string(),
                    },
                    Term::Quadratic {
                        covariate: covariate.to_string(),
                    },
                ],
            }],
        }
    }

    /// `ln λ_t = β0 + β1·x_t + β2·sin(2πt/P) + β3·cos(2πt/P)`.
    pub fn periodic_poisson(covariate: &str, time: &str, period: f64) -> Self {
        Self {
            name: "periodic-poisson".to_string(),
            family: Family::Poisson,
            default_prior: Prior::default(),
            priors: BTreeMap::new(),
            predictors: vec![LinearPredictor {
                name: "abundance".to_string(),
                link: LinkFunction::Log,
                terms: vec![
                    Term::Intercept,
                    Term::Linear {
                        covariate: covariate.to_string(),
                    },
                    Term::Harmonic {
                        covariate: time.to_string(),
                        period,
                    },
                ],
            }],
        }
    }

    /// `logit ψ = α0 + α1·x`, `logit p = γ0`.
    pub fn occupancy(covariate: &str) -> Self {
        Self {
            name: "occupancy".to_string(),
            family: Family::Occupancy,
            default_prior: Prior::default(),
            priors: BTreeMap::new(),
            predictors: vec![
                LinearPredictor {
                    name: OCCUPANCY_PREDICTOR.to_string(),
                    link: LinkFunction::Logit,
                    terms: vec![
                        Term::Intercept,
                        Term::Linear {
                            covariate: covariate.to_string(),
                        },
                    ],
                },
                LinearPredictor {
                    name: DETECTION_PREDICTOR.to_string(),
                    link: LinkFunction::Logit,
                    terms: vec![Term::Intercept],
                },
            ],
        }
    }

    pub fn with_prior(mut self, coefficient: &str, prior: Prior) -> Self {
        self.priors.insert(coefficient.to_string(), prior);
        self
    }

    /// Predictors in canonical order: the single Poisson predictor, or
    /// occupancy followed by detection.
    pub fn ordered_predictors(&self) -> Result<Vec<&LinearPredictor>, SpecError> {
        match self.family {
            Family::Poisson => Ok(self.predictors.iter().collect()),
            Family::Occupancy => {
                let find = |name: &'static str| {
                    self.predictors
                        .iter()
                        .find(|p| p.name == name)
                        .ok_or(SpecError::MissingPredictor {
                            family: self.family,
                            name,
                        })
                };
                Ok(vec![find(OCCUPANCY_PREDICTOR)?, find(DETECTION_PREDICTOR)?])
            }
        }
    }

    /// Coefficient names in canonical order.
    pub fn coefficient_names(&self) -> Result<Vec<String>, SpecError> {
        Ok(self
            .ordered_predictors()?
            .into_iter()
            .flat_map(LinearPredictor::coefficient_names)
            .collect())
    }

    /// Every covariate any term refers to, without duplicates.
    pub fn covariates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.predictors
            .iter()
            .flat_map(|p| p.terms.iter())
            .filter_map(Term::covariate)
            .filter(|c| seen.insert(c.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Covariates entering through linear or quadratic terms. These are the
    /// ones that should be standardized; harmonic covariates are left on
    /// their original time scale so the period keeps its meaning.
    pub fn polynomial_covariates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.predictors
            .iter()
            .flat_map(|p| p.terms.iter())
            .filter_map(|t| match t {
                Term::Linear { covariate } | Term::Quadratic { covariate } => Some(covariate),
                _ => None,
            })
            .filter(|c| seen.insert(c.to_string()))
            .cloned()
            .collect()
    }

    /// Prior for each coefficient in canonical order.
    pub fn coefficient_priors(&self) -> Result<Vec<Prior>, SpecError> {
        Ok(self
            .coefficient_names()?
            .iter()
            .map(|name| self.priors.get(name).copied().unwrap_or(self.default_prior))
            .collect())
    }

    /// Static checks that need no data.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.predictors.is_empty() {
            return Err(SpecError::NoPredictors(self.name.clone()));
        }

        let mut names = HashSet::new();
        for predictor in &self.predictors {
            if !names.insert(predictor.name.as_str()) {
                return Err(SpecError::DuplicatePredictor(predictor.name.clone()));
            }
        }

        let (expected_count, expected_link) = match self.family {
            Family::Poisson => (1, LinkFunction::Log),
            Family::Occupancy => (2, LinkFunction::Logit),
        };
        if self.predictors.len() != expected_count {
            return Err(SpecError::WrongPredictorCount {
                family: self.family,
                expected: expected_count,
                found: self.predictors.len(),
            });
        }
        // Resolves the occupancy/detection names.
        self.ordered_predictors()?;

        for predictor in &self.predictors {
            if predictor.link != expected_link {
                return Err(SpecError::WrongLink {
                    predictor: predictor.name.clone(),
                    expected: expected_link,
                    found: predictor.link,
                });
            }
            if predictor.terms.is_empty() {
                return Err(SpecError::EmptyPredictor(predictor.name.clone()));
            }
            let mut labels = HashSet::new();
            for term in &predictor.terms {
                if let Term::Harmonic { covariate, period } = term {
                    if !(period.is_finite() && *period > 0.0) {
                        return Err(SpecError::InvalidPeriod {
                            predictor: predictor.name.clone(),
                            covariate: covariate.clone(),
                            period: *period,
                        });
                    }
                }
                for label in term.labels() {
                    if !labels.insert(label.clone()) {
                        return Err(SpecError::DuplicateTerm {
                            predictor: predictor.name.clone(),
                            term: label,
                        });
                    }
                }
            }
        }

        self.default_prior.validate("default prior")?;
        let coefficients: HashSet<String> = self.coefficient_names()?.into_iter().collect();
        for (target, prior) in &self.priors {
            if !coefficients.contains(target) {
                return Err(SpecError::UnknownPriorTarget(target.clone()));
            }
            prior.validate(target)?;
        }
        Ok(())
    }

    /// Static checks plus the checks that need the data: every covariate
    /// exists, and occupancy data carries visit counts.
    pub fn validate_against(&self, observations: &ObservationSet) -> Result<(), SpecError> {
        self.validate()?;
        for predictor in &self.predictors {
            for covariate in predictor.terms.iter().filter_map(Term::covariate) {
                if !observations.covariates().contains(covariate) {
                    return Err(SpecError::UnknownCovariate {
                        predictor: predictor.name.clone(),
                        covariate: covariate.to_string(),
                    });
                }
            }
        }
        if self.family == Family::Occupancy && observations.visits().is_none() {
            return Err(SpecError::MissingVisits);
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SpecError> {
        let spec: ModelSpec = toml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_toml_string(&self) -> Result<String, SpecError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, SpecError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SpecError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CovariateTable;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_builtin_specs_validate() {
        ModelSpec::quadratic_poisson("x").validate().unwrap();
        ModelSpec::periodic_poisson("x", "time", 12.0).validate().unwrap();
        ModelSpec::occupancy("forest").validate().unwrap();
    }

    #[test]
    fn test_coefficient_names_follow_canonical_order() {
        let mut spec = ModelSpec::occupancy("forest");
        spec.predictors.reverse();
        assert_eq!(
            spec.coefficient_names().unwrap(),
            vec![
                "occupancy:(Intercept)",
                "occupancy:forest",
                "detection:(Intercept)"
            ]
        );

        let periodic = ModelSpec::periodic_poisson("x", "time", 12.0);
        assert_eq!(periodic.coefficient_names().unwrap().len(), 4);
        assert_eq!(periodic.polynomial_covariates(), vec!["x"]);
        assert_eq!(periodic.covariates(), vec!["x", "time"]);
    }

    #[test]
    fn test_wrong_link_is_rejected() {
        let mut spec = ModelSpec::quadratic_poisson("x");
        spec.predictors[0].link = LinkFunction::Logit;
        assert!(matches!(spec.validate(), Err(SpecError::WrongLink { .. })));
    }

    #[test]
    fn test_duplicate_term_is_rejected() {
        let mut spec = ModelSpec::quadratic_poisson("x");
        spec.predictors[0].terms.push(Term::Linear {
            covariate: "x".to_string(),
        });
        assert!(matches!(
            spec.validate(),
            Err(SpecError::DuplicateTerm { term, .. }) if term == "x"
        ));
    }

    #[test]
    fn test_bad_period_is_rejected() {
        let spec = ModelSpec::periodic_poisson("x", "time", 0.0);
        assert!(matches!(spec.validate(), Err(SpecError::InvalidPeriod { .. })));
    }

    #[test]
    fn test_unknown_prior_target_is_rejected() {
        let spec = ModelSpec::quadratic_poisson("x").with_prior(
            "abundance:depth",
            Prior::Normal { mean: 0.0, sd: 1.0 },
        );
        assert!(matches!(
            spec.validate(),
            Err(SpecError::UnknownPriorTarget(name)) if name == "abundance:depth"
        ));
    }

    #[test]
    fn test_invalid_prior_scale_is_rejected() {
        let spec = ModelSpec::quadratic_poisson("x").with_prior(
            "abundance:x",
            Prior::Cauchy {
                location: 0.0,
                scale: -1.0,
            },
        );
        assert!(matches!(spec.validate(), Err(SpecError::InvalidPrior { .. })));
    }

    #[test]
    fn test_occupancy_requires_named_predictors() {
        let mut spec = ModelSpec::occupancy("forest");
        spec.predictors[1].name = "sighting".to_string();
        assert!(matches!(
            spec.validate(),
            Err(SpecError::MissingPredictor { name: "detection", .. })
        ));
    }

    #[test]
    fn test_validate_against_data() {
        let table = CovariateTable::new(2).with_column("x", array![0.0, 1.0]).unwrap();
        let obs = ObservationSet::new(array![1.0, 0.0], table).unwrap();

        ModelSpec::quadratic_poisson("x").validate_against(&obs).unwrap();
        assert!(matches!(
            ModelSpec::quadratic_poisson("depth").validate_against(&obs),
            Err(SpecError::UnknownCovariate { .. })
        ));
        assert!(matches!(
            ModelSpec::occupancy("x").validate_against(&obs),
            Err(SpecError::MissingVisits)
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let spec = ModelSpec::periodic_poisson("x", "time", 12.0)
            .with_prior("abundance:x", Prior::Cauchy { location: 0.0, scale: 2.5 });
        let text = spec.to_toml_string().unwrap();
        let parsed = ModelSpec::from_toml_str(&text).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn test_hand_written_toml() {
        let text = r#"
name = "site-occupancy"
family = "occupancy"

[default_prior]
distribution = "flat"

[[predictors]]
name = "detection"
link = "logit"
terms = [{ type = "intercept" }]

[[predictors]]
name = "occupancy"
link = "logit"
terms = [{ type = "intercept" }, { type = "linear", covariate = "forest" }]
"#;
        let spec = ModelSpec::from_toml_str(text).unwrap();
        assert_eq!(spec.family, Family::Occupancy);
        assert_eq!(spec.default_prior, Prior::Flat);
        assert_eq!(spec.coefficient_priors().unwrap(), vec![Prior::Flat; 3]);
    }

    #[test]
    fn test_prior_derivatives_match_finite_differences() {
        let priors = [
            Prior::Normal { mean: 0.5, sd: 2.0 },
            Prior::Cauchy {
                location: -1.0,
                scale: 0.7,
            },
        ];
        let h = 1e-5;
        for prior in priors {
            for v in [-2.0, 0.1, 1.7] {
                let fd1 = (prior.log_density(v + h) - prior.log_density(v - h)) / (2.0 * h);
                assert_relative_eq!(prior.log_density_derivative(v), fd1, epsilon = 1e-6);
                let fd2 = (prior.log_density_derivative(v + h)
                    - prior.log_density_derivative(v - h))
                    / (2.0 * h);
                assert_relative_eq!(prior.log_density_second_derivative(v), fd2, epsilon = 1e-5);
            }
        }
    }
}
