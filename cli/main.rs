#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use countfit::aggregate::{GridSpec, aggregate_points};
use countfit::data::{
    load_covariate_table, load_grid_covariates, load_observations, load_points,
    write_observations,
};
use countfit::fitter::{FitConfig, FitError, FitMethod};
use countfit::likelihood::quadratic_deviance;
use countfit::mcmc::McmcConfig;
use countfit::model::{FittedModel, ModelError};
use countfit::simulate::{
    simulate_occupancy, simulate_overdispersed, simulate_periodic_poisson,
    simulate_quadratic_poisson,
};
use countfit::spec::{Family, ModelSpec};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;
use std::process;

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    Irls,
    Bfgs,
    Mcmc,
}

impl From<MethodCli> for FitMethod {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::Irls => FitMethod::Irls,
            MethodCli::Bfgs => FitMethod::Bfgs,
            MethodCli::Mcmc => FitMethod::Mcmc,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ScenarioCli {
    Quadratic,
    Periodic,
    Occupancy,
    Overdispersed,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to a TSV file with a count column and the covariate
    #[arg(long)]
    pub data: String,

    /// Parameters β0,β1,β2 of ln λ = β0 + β1·x + β2·x²
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
    pub beta: Vec<f64>,

    /// Name of the (already scaled) covariate column
    #[arg(long, default_value = "x")]
    pub covariate: String,
}

#[derive(Args)]
pub struct AggregateArgs {
    /// Path to a TSV file of point records with x and y columns
    #[arg(long)]
    pub points: String,

    /// Path to a TSV file of per-cell covariates with row and col columns
    #[arg(long)]
    pub covariates: String,

    /// Covariate columns to carry into the aggregated table
    #[arg(long = "covariate", value_delimiter = ',', required = true)]
    pub covariate_names: Vec<String>,

    /// Side length of the square grid cells
    #[arg(long)]
    pub cell_size: f64,

    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub origin_x: f64,

    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub origin_y: f64,

    #[arg(long)]
    pub rows: usize,

    #[arg(long)]
    pub cols: usize,

    /// Output path for the aggregated count table
    #[arg(long, default_value = "counts.tsv")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct FitArgs {
    /// Path to a TSV file with a count column and covariate columns
    #[arg(long)]
    pub data: String,

    /// Path to the model specification (.toml)
    #[arg(long)]
    pub model: PathBuf,

    #[arg(long, value_enum, default_value_t = MethodCli::Irls)]
    pub method: MethodCli,

    /// Covariates to center and scale before fitting. Defaults to every
    /// covariate used in a linear or quadratic term.
    #[arg(long, value_delimiter = ',')]
    pub standardize: Option<Vec<String>>,

    /// Fit on the covariates exactly as given
    #[arg(long, conflicts_with = "standardize")]
    pub no_standardize: bool,

    /// Column holding per-site visit counts (occupancy models)
    #[arg(long, default_value = "visits")]
    pub visits_column: String,

    /// Additional attempts after a non-converged fit
    #[arg(long, default_value = "3")]
    pub restarts: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Override the fitter's iteration limit
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Override the fitter's convergence tolerance
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Draws kept per MCMC chain
    #[arg(long, default_value = "2000")]
    pub samples: usize,

    /// Warm-up iterations per MCMC chain
    #[arg(long, default_value = "1000")]
    pub warmup: usize,

    #[arg(long, default_value = "4")]
    pub chains: usize,

    /// Pearson χ²/df above which the fit is flagged as over-dispersed
    #[arg(long, default_value = "1.5")]
    pub dispersion_threshold: f64,

    /// Output path for the fitted model
    #[arg(long, default_value = "fitted.toml")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to a TSV file with the raw covariate columns
    #[arg(long)]
    pub data: String,

    /// Path to a fitted model (.toml)
    #[arg(long)]
    pub model: PathBuf,

    #[arg(long, default_value = "predictions.tsv")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    #[arg(long, value_enum, default_value_t = ScenarioCli::Quadratic)]
    pub scenario: ScenarioCli,

    /// Number of records (sites for the occupancy scenario)
    #[arg(long, default_value = "1000")]
    pub n: usize,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// True parameters, comma-separated. Defaults depend on the scenario.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub beta: Option<Vec<f64>>,

    /// Cycle length of the periodic scenario
    #[arg(long, default_value = "12")]
    pub period: f64,

    /// Survey visits per site in the occupancy scenario
    #[arg(long, default_value = "4")]
    pub visits: u64,

    /// Gamma frailty shape of the over-dispersed scenario
    #[arg(long, default_value = "2")]
    pub shape: f64,

    /// Output path for the simulated count table
    #[arg(long, default_value = "simulated.tsv")]
    pub out: PathBuf,

    /// Also write the matching model specification here
    #[arg(long)]
    pub spec_out: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "countfit",
    about = "Poisson log-linear and occupancy count models",
    long_about = "Fits count models by IRLS, BFGS or random-walk Metropolis, \
                 with aggregation, scaling and over-dispersion diagnostics."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Poisson deviance of a quadratic log-linear model
    #[command(about = "Evaluate the quadratic Poisson deviance")]
    Evaluate(EvaluateArgs),

    /// Bin point records into grid cells and join cell covariates
    #[command(about = "Aggregate points into a count table (outputs: counts.tsv)")]
    Aggregate(AggregateArgs),

    /// Fit a model specification to a count table
    #[command(about = "Fit a count model (outputs: fitted.toml)")]
    Fit(FitArgs),

    /// Apply a fitted model to new covariates
    #[command(about = "Predict from a fitted model (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    /// Generate synthetic data from known parameters
    #[command(about = "Simulate a count table (outputs: simulated.tsv)")]
    Simulate(SimulateArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Evaluate(args)) => evaluate(args),
        Some(Commands::Aggregate(args)) => aggregate(args),
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Simulate(args)) => simulate(args),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        if is_convergence_failure(e.as_ref()) {
            eprintln!("Warning: the model did not converge. {e}");
            process::exit(2);
        }
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn is_convergence_failure(error: &(dyn Error + 'static)) -> bool {
    match error.downcast_ref::<ModelError>() {
        Some(ModelError::Fit(FitError::ConvergenceFailure { .. })) => true,
        _ => matches!(
            error.downcast_ref::<FitError>(),
            Some(FitError::ConvergenceFailure { .. })
        ),
    }
}

fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn Error>> {
    let beta: [f64; 3] = args.beta.as_slice().try_into().map_err(|_| {
        format!(
            "--beta takes exactly three values (β0,β1,β2), got {}",
            args.beta.len()
        )
    })?;
    let observations = load_observations(&args.data, std::slice::from_ref(&args.covariate), None)?;
    let x = observations
        .covariate(&args.covariate)
        .ok_or_else(|| format!("covariate '{}' missing after load", args.covariate))?;
    let deviance = quadratic_deviance(observations.counts(), x, beta)?;
    println!("{deviance:.10}");
    Ok(())
}

fn aggregate(args: AggregateArgs) -> Result<(), Box<dyn Error>> {
    let grid = GridSpec::new(
        args.origin_x,
        args.origin_y,
        args.cell_size,
        args.rows,
        args.cols,
    )?;
    let points = load_points(&args.points)?;
    let covariates = load_grid_covariates(&args.covariates, &args.covariate_names)?;
    let counts = aggregate_points(&points, &grid);
    let observations = counts.join(&covariates)?;
    write_observations(&args.out, &observations)?;
    let grid = counts.grid();
    println!(
        "Binned {} points into a {}x{} grid of {}-unit cells ({} outside the grid)",
        counts.total(),
        grid.n_rows,
        grid.n_cols,
        grid.cell_size,
        counts.dropped()
    );
    println!(
        "Wrote {} cell records to {}",
        observations.len(),
        args.out.display()
    );
    Ok(())
}

fn fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let spec = ModelSpec::load(&args.model)?;
    let visits_column = (spec.family == Family::Occupancy).then_some(args.visits_column.as_str());
    let observations = load_observations(&args.data, &spec.covariates(), visits_column)?;

    let standardize = if args.no_standardize {
        Vec::new()
    } else {
        args.standardize
            .clone()
            .unwrap_or_else(|| spec.polynomial_covariates())
    };

    let config = FitConfig {
        method: args.method.into(),
        max_iterations: args.max_iterations,
        tolerance: args.tolerance,
        restarts: args.restarts,
        seed: args.seed,
        dispersion_threshold: args.dispersion_threshold,
        mcmc: McmcConfig {
            n_samples: args.samples,
            n_warmup: args.warmup,
            n_chains: args.chains,
            seed: args.seed,
            show_progress: true,
            ..McmcConfig::default()
        },
    };

    let fitted = FittedModel::fit(spec, &observations, &standardize, config)?;
    print_report(&fitted);
    fitted.save(&args.out)?;
    println!("Fitted model saved to {}", args.out.display());
    Ok(())
}

fn print_report(fitted: &FittedModel) {
    let report = &fitted.report;
    println!(
        "{} fit of '{}': negative log-likelihood {:.6}, AIC {:.3}, {} iterations",
        report.method, fitted.spec.name, report.objective, report.aic, report.iterations
    );
    println!(
        "{:<32} {:>12} {:>12} {:>12} {:>12}",
        "coefficient", "estimate", "std.error", "lower", "upper"
    );
    let show = |v: Option<f64>| v.map(|x| format!("{x:.6}")).unwrap_or_else(|| "-".to_string());
    for c in &report.coefficients {
        println!(
            "{:<32} {:>12.6} {:>12} {:>12} {:>12}",
            c.name,
            c.estimate,
            show(c.std_error),
            show(c.lower),
            show(c.upper)
        );
    }
    if let Some(d) = &report.dispersion {
        println!(
            "Pearson chi2 {:.3} on {} df (ratio {:.3}, p = {:.3e}); residual deviance {:.3}",
            d.pearson_chi2, d.degrees_of_freedom, d.pearson_ratio, d.p_value, d.residual_deviance
        );
        if d.is_overdispersed(fitted.config.dispersion_threshold) {
            println!("Warning: counts are over-dispersed relative to the Poisson model.");
        }
    }
    if let Some(m) = &report.mcmc {
        println!(
            "{} chains x {} draws: max R-hat {:.3}, min ESS {:.0}",
            m.n_chains, m.n_samples, m.max_rhat, m.min_ess
        );
    }
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn Error>> {
    let fitted = FittedModel::load(&args.model)?;
    let covariates = load_covariate_table(&args.data, &fitted.spec.covariates())?;
    let predictions = fitted.predict(&covariates)?;
    predictions.save(&args.out)?;
    println!(
        "Wrote predictions for {} records to {}",
        predictions.len(),
        args.out.display()
    );
    Ok(())
}

fn fixed_beta<const N: usize>(
    given: &Option<Vec<f64>>,
    default: [f64; N],
) -> Result<[f64; N], Box<dyn Error>> {
    match given {
        None => Ok(default),
        Some(values) => values.as_slice().try_into().map_err(|_| {
            format!(
                "--beta takes exactly {N} values for this scenario, got {}",
                values.len()
            )
            .into()
        }),
    }
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let (observations, spec) = match args.scenario {
        ScenarioCli::Quadratic => {
            let beta = fixed_beta(&args.beta, [1.0, 0.5, -0.3])?;
            (
                simulate_quadratic_poisson(args.n, beta, &mut rng)?,
                ModelSpec::quadratic_poisson("x"),
            )
        }
        ScenarioCli::Periodic => {
            let beta = fixed_beta(&args.beta, [1.0, 0.4, 0.6, -0.3])?;
            (
                simulate_periodic_poisson(args.n, args.period, beta, &mut rng)?,
                ModelSpec::periodic_poisson("x", "time", args.period),
            )
        }
        ScenarioCli::Occupancy => {
            let [a0, a1, p_logit] = fixed_beta(&args.beta, [0.3, 1.0, -0.2])?;
            (
                simulate_occupancy(args.n, args.visits, [a0, a1], p_logit, &mut rng)?,
                ModelSpec::occupancy("forest"),
            )
        }
        ScenarioCli::Overdispersed => {
            let beta = fixed_beta(&args.beta, [1.0, 0.5, -0.3])?;
            (
                simulate_overdispersed(args.n, beta, args.shape, &mut rng)?,
                ModelSpec::quadratic_poisson("x"),
            )
        }
    };

    write_observations(&args.out, &observations)?;
    println!(
        "Wrote {} simulated records to {}",
        observations.len(),
        args.out.display()
    );
    if let Some(path) = &args.spec_out {
        spec.save(path)?;
        println!("Wrote matching model specification to {}", path.display());
    }
    Ok(())
}
