//! SEQMC: A scenario runner for the sequential estimation toolbox.
//!
//! This program demonstrates the estimators on a one-dimensional
//! random-walk scenario: the state drifts with Gaussian process noise and is
//! observed through a noisy scalar measurement each step. Three modes are
//! available:
//!
//! - `filter`: run the sequential Monte Carlo filter over a measurement
//!   series (from a CSV file or synthesized on the fly).
//! - `predict`: run the filter, then hand its final particle cloud to the
//!   lookahead predictor for a configured horizon.
//! - `ukf`: run the unscented Kalman filter over the same scenario.
//!
//! Estimates are written to CSV for external analysis.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use seqmc::SequentialEstimator;
use seqmc::filter::{
    ParticleFilter, ParticleFilterConfig, ParticlePredictor, PredictorConfig,
};
use seqmc::model::{
    EquationMeasurement, EquationModel, Inputs, MeasurementModel, MeasurementValue,
    StateSpaceModel,
};
use seqmc::records::{MeasurementRecord, read_measurements_csv, write_estimates_csv};
use seqmc::ukf::{InnovationPolicy, UkfConfig, UnscentedKalmanFilter};

/// Command line arguments
#[derive(Parser)]
#[command(
    version,
    about = "A scenario runner for sequential Monte Carlo and unscented Kalman estimators."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sequential Monte Carlo filter over a measurement series
    Filter(FilterArgs),
    /// Run the filter, then the lookahead predictor on its final particle cloud
    Predict(PredictArgs),
    /// Run the unscented Kalman filter over a measurement series
    Ukf(UkfArgs),
}

/// Scenario parameters shared by all modes
#[derive(Args, Clone)]
struct ScenarioArgs {
    /// Number of filtering steps when synthesizing measurements
    #[arg(long, default_value_t = 100)]
    steps: usize,

    /// Seed for the scenario and the estimator streams
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Process-noise standard deviation of the random-walk state
    #[arg(long, default_value_t = 0.1)]
    process_noise_std: f64,

    /// Measurement-noise standard deviation
    #[arg(long, default_value_t = 0.5)]
    measurement_noise_std: f64,

    /// Measurement CSV with time,value columns; synthesized when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output CSV path; a timestamped name is generated when omitted
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct FilterArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Number of internal particles
    #[arg(long, default_value_t = 1000)]
    particles: usize,

    /// Number of output particles (defaults to the internal count)
    #[arg(long)]
    output_particles: Option<usize>,

    /// Resample adaptively on effective sample size instead of every step
    #[arg(long)]
    adaptive: bool,

    /// Use the low-variance (systematic) resampler
    #[arg(long)]
    low_variance: bool,
}

#[derive(Args)]
struct PredictArgs {
    #[command(flatten)]
    filter: FilterArgs,

    /// Lookahead horizon in steps
    #[arg(long, default_value_t = 5)]
    horizon: usize,
}

#[derive(Args)]
struct UkfArgs {
    #[command(flatten)]
    scenario: ScenarioArgs,

    /// Sigma-point spread parameter
    #[arg(long, default_value_t = 0.0)]
    kappa: f64,

    /// Regularize the innovation covariance with this epsilon before inversion
    #[arg(long)]
    regularize: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level);
    match cli.command {
        Command::Filter(args) => run_filter(args),
        Command::Predict(args) => run_predict(args),
        Command::Ukf(args) => run_ukf(args),
    }
}

fn init_logger(log_level: &str) {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{log_level}', defaulting to 'info'");
        log::LevelFilter::Info
    });
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .init();
}

/// Random-walk state-space model: identity update with Gaussian process
/// noise, prior N(0, 1).
fn random_walk_model(process_noise_std: f64) -> Result<EquationModel> {
    let model = EquationModel::builder()
        .state_names(["x"])
        .update("x", |state, _, _| Some(state[0]))
        .prior(|rng| {
            let normal = Normal::new(0.0, 1.0).ok()?;
            Some(DVector::from_element(1, normal.sample(rng)))
        })
        .process_noise(move |_, _, _, rng| {
            let normal = Normal::new(0.0, process_noise_std).ok()?;
            Some(DVector::from_element(1, normal.sample(rng)))
        })
        .build()?;
    Ok(model)
}

/// Load the measurement series from disk, or synthesize one by simulating the
/// random walk and observing it through Gaussian noise.
fn load_or_synthesize(scenario: &ScenarioArgs) -> Result<Vec<MeasurementRecord>> {
    if let Some(path) = &scenario.input {
        let records = read_measurements_csv(path)
            .with_context(|| format!("reading measurements from {}", path.display()))?;
        info!("loaded {} measurements from {}", records.len(), path.display());
        return Ok(records);
    }
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let process = Normal::new(0.0, scenario.process_noise_std)?;
    let noise = Normal::new(0.0, scenario.measurement_noise_std)?;
    let mut truth = 0.0;
    let mut records = Vec::with_capacity(scenario.steps);
    for step in 0..scenario.steps {
        truth += process.sample(&mut rng);
        records.push(MeasurementRecord {
            time: step as f64,
            value: truth + noise.sample(&mut rng),
        });
    }
    info!("synthesized {} measurements", records.len());
    Ok(records)
}

fn output_path(scenario: &ScenarioArgs, mode: &str) -> PathBuf {
    scenario.output.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "seqmc_{mode}_{}.csv",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ))
    })
}

fn position_channel(measurement_noise_std: f64) -> EquationMeasurement {
    EquationMeasurement::scalar(
        "z",
        |state, _, _| Some(state[0]),
        move |_, _, _| Some(measurement_noise_std),
    )
}

fn filter_config(args: &FilterArgs) -> ParticleFilterConfig {
    ParticleFilterConfig {
        particle_count: args.particles,
        output_particle_count: args.output_particles.unwrap_or(args.particles),
        bootstrap: !args.adaptive,
        low_variance_sampler: args.low_variance,
        seed: args.scenario.seed,
        ..ParticleFilterConfig::default()
    }
}

fn run_filter(args: FilterArgs) -> Result<()> {
    let measurements = load_or_synthesize(&args.scenario)?;
    let model = random_walk_model(args.scenario.process_noise_std)?;
    let mut filter = ParticleFilter::new("seqmc_runner", model, filter_config(&args))?;
    let mut channel = position_channel(args.scenario.measurement_noise_std);

    let mut rows = Vec::with_capacity(measurements.len());
    for record in &measurements {
        channel.set_value(MeasurementValue::Scalar(record.value));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let output = filter.step(record.time, &Inputs::new(), &channels)?;
        rows.push((record.time, output.estimate.values().clone()));
    }
    info!(
        "filter finished: {} steps, effective sample size {:.1}",
        rows.len(),
        filter.effective_sample_size()
    );

    let path = output_path(&args.scenario, "filter");
    write_estimates_csv(&path, filter.model().state_names(), &rows)?;
    info!("estimates written to {}", path.display());
    Ok(())
}

fn run_predict(args: PredictArgs) -> Result<()> {
    let measurements = load_or_synthesize(&args.filter.scenario)?;
    let model = random_walk_model(args.filter.scenario.process_noise_std)?;
    let mut filter = ParticleFilter::new("seqmc_runner", model, filter_config(&args.filter))?;
    let mut channel = position_channel(args.filter.scenario.measurement_noise_std);

    let mut last_time = 0.0;
    let mut cloud = Vec::new();
    for record in &measurements {
        channel.set_value(MeasurementValue::Scalar(record.value));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let output = filter.step(record.time, &Inputs::new(), &channels)?;
        last_time = record.time;
        cloud = output.particles;
    }
    info!(
        "filter pass complete; predicting {} steps ahead from t = {last_time}",
        args.horizon
    );

    let predictor_model = random_walk_model(args.filter.scenario.process_noise_std)?;
    let predictor_config = PredictorConfig {
        prediction_steps: args.horizon,
        bootstrap: !args.filter.adaptive,
        low_variance_sampler: args.filter.low_variance,
        seed: args.filter.scenario.seed,
        ..PredictorConfig::default()
    };
    let mut predictor =
        ParticlePredictor::new("seqmc_predictor", predictor_model, predictor_config)?;
    let prediction = predictor.step(last_time, &Inputs::new(), &cloud)?;

    let path = output_path(&args.filter.scenario, "predict");
    let rows = vec![(last_time, prediction.estimate.values().clone())];
    write_estimates_csv(&path, predictor.model().state_names(), &rows)?;
    info!(
        "predicted state after {}-step horizon: {:.4}; written to {}",
        args.horizon,
        prediction.estimate.get("x").unwrap_or(f64::NAN),
        path.display()
    );
    Ok(())
}

fn run_ukf(args: UkfArgs) -> Result<()> {
    let measurements = load_or_synthesize(&args.scenario)?;
    let model = random_walk_model(args.scenario.process_noise_std)?;
    let process_variance = args.scenario.process_noise_std.powi(2);
    let measurement_variance = args.scenario.measurement_noise_std.powi(2);
    let config = UkfConfig {
        kappa: args.kappa,
        prior_mean: DVector::zeros(1),
        prior_covariance: DMatrix::identity(1, 1),
        process_noise_covariance: DMatrix::from_element(1, 1, process_variance),
        innovation_policy: match args.regularize {
            Some(epsilon) => InnovationPolicy::Regularize(epsilon),
            None => InnovationPolicy::FailFast,
        },
    };
    let mut ukf = UnscentedKalmanFilter::new(model, config)?;
    // The unscented correction consumes the noise value as a variance.
    let mut channel = EquationMeasurement::scalar(
        "z",
        |state, _, _| Some(state[0]),
        move |_, _, _| Some(measurement_variance),
    );

    let mut rows = Vec::with_capacity(measurements.len());
    for record in &measurements {
        channel.set_value(MeasurementValue::Scalar(record.value));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let output = ukf.step(record.time, &Inputs::new(), &channels)?;
        rows.push((record.time, output.estimate.values().clone()));
    }
    info!(
        "ukf finished: {} steps, posterior variance {:.6}",
        rows.len(),
        ukf.covariance()[(0, 0)]
    );

    let path = output_path(&args.scenario, "ukf");
    write_estimates_csv(&path, ukf.model().state_names(), &rows)?;
    info!("estimates written to {}", path.display());
    Ok(())
}
