//! Sequential Monte Carlo and unscented Kalman estimation toolbox
//!
//! This crate provides recursive Bayesian state estimators over user-defined
//! state-space models. The estimators are implemented as structs that are
//! configured once per run and then driven one step at a time by a host
//! application: each step consumes the current time, the named control
//! inputs, and the step's measurement channels, and produces a weighted
//! particle (or sigma-point) set plus a weighted-mean state estimate keyed by
//! the declared state variable names. The crate owns no expression language,
//! no scheduling, and no wire format; the host supplies the model as compiled
//! closures (or any [`model::StateSpaceModel`] implementation) and decides
//! when steps fire.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filters.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides seeded random number generation for resampling and for the user model's prior and noise sampling.
//! - [`serde`](https://crates.io/crates/serde) and [`csv`](https://crates.io/crates/csv): Provides record serialization for scenario input and estimate output.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [error]: Typed error taxonomy (configuration, evaluation, numeric degeneracy).
//! - [filter]: Sequential Monte Carlo filter and the multi-step lookahead predictor.
//! - [linalg]: The defensive Cholesky decomposition used for sigma-point spreads.
//! - [model]: The user-model boundary (state-space and measurement traits plus closure-backed implementations).
//! - [particle]: Particle entity and the measurement-likelihood weighting engine.
//! - [random]: Deterministic per-instance random streams.
//! - [records]: Output record types and CSV helpers.
//! - [resample]: Resampling schemes, effective sample size, and the trigger policy.
//! - [ukf]: The unscented Kalman filter.
//!
//! ## The filtering recursion
//!
//! All estimators implement the same Bayesian recursion over a state-space
//! model with update equations $x_{t+1} = f(x, u, t) + w$ and measurement
//! equations $y = g(x, u, t) + v$:
//!
//! 1. **Predict**: propagate the state distribution through $f$, widening it
//!    with process noise. The particle filter carries the distribution as
//!    weighted samples and adds a sampled noise term; the unscented filter
//!    carries a mean and covariance and inflates the covariance instead.
//! 2. **Correct**: condition on the step's measurements. The particle filter
//!    reweights each particle by the measurement likelihood; the unscented
//!    filter applies a Kalman-gain correction in measurement space.
//! 3. **Re-approximate**: resample particles when the effective sample size
//!    degenerates (or every step for a bootstrap filter); re-derive sigma
//!    points after every mean/covariance change.
//!
//! Randomness is isolated per filter instance through a seeded
//! [`random::RandomSource`], so runs are reproducible given a fixed seed and
//! instance name. Execution is single-threaded and step-driven: a step runs
//! to completion or fails with a [`FilterError`]; there is no internal
//! concurrency and no retry semantics.

pub mod error;
pub mod filter;
pub mod linalg;
pub mod model;
pub mod particle;
pub mod random;
pub mod records;
pub mod resample;
pub mod ukf;

pub use error::{ConfigError, EvaluationError, FilterError, NumericDegeneracy};

use model::{Inputs, MeasurementModel};
use records::StateEstimate;

/// Generic step-driven Bayesian estimator interface shared by the particle
/// filter and the unscented Kalman filter.
///
/// The predictor variant is not covered by this trait since it consumes an
/// externally supplied particle set instead of measurements.
pub trait SequentialEstimator {
    /// Per-step output: the state estimate plus the estimator's
    /// representation of the posterior.
    type Output;

    /// Advance the estimator by one step at time `t`.
    fn step(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<Self::Output, FilterError>;

    /// Current state estimate keyed by state variable names.
    fn estimate(&self) -> StateEstimate;

    /// Return to the uninitialized state so the next step begins a new run.
    fn reset(&mut self);
}
