//! Sequential Monte Carlo estimators.
//!
//! [`ParticleFilter`] owns its particle memory across steps and runs the
//! classic one-step-ahead recursion: sample-from-prior on the first
//! iteration, then propagate, reweigh against the step's measurements,
//! normalize, estimate, emit, and conditionally resample.
//!
//! [`ParticlePredictor`] owns no particle memory between firings: it ingests
//! an externally supplied weighted particle set each step, runs a configured
//! lookahead horizon of propagate/normalize/resample iterations, and emits
//! the whole internal set at once.
//!
//! The two variants inject process noise differently and the difference is
//! load-bearing for estimator statistics, so it is kept as the explicit
//! [`ProcessNoiseStrategy`]: the filter draws a fresh noise sample per
//! particle, the predictor draws one sample per lookahead step and applies it
//! to every particle.

use log::warn;
use nalgebra::DVector;

use crate::SequentialEstimator;
use crate::error::{ConfigError, FilterError};
use crate::model::{Inputs, MeasurementModel, StateSpaceModel};
use crate::particle::{
    GaussianNormalizer, Particle, measurement_weight, normalize_or_uniform, uniform_weights,
};
use crate::random::RandomSource;
use crate::records::{StateEstimate, WeightedState};
use crate::resample::{
    ResamplePolicy, ResamplingScheme, effective_sample_size, resample, subsample_indices,
};

/// How process noise is drawn during propagation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessNoiseStrategy {
    /// A fresh noise sample for every particle (filter behavior).
    PerParticle,
    /// One noise sample per propagation step, shared by all particles
    /// (predictor behavior). The sample is evaluated against the first
    /// particle's state snapshot.
    PerStep,
}

/// Particle filter configuration, immutable for the duration of one run.
#[derive(Clone, Debug)]
pub struct ParticleFilterConfig {
    /// Number of internal particles approximating the posterior.
    pub particle_count: usize,
    /// Number of particles emitted per step. When it differs from
    /// `particle_count` the output is a weight-renormalized subsample.
    pub output_particle_count: usize,
    /// Resample every step (bootstrap filter) instead of adaptively.
    pub bootstrap: bool,
    /// Use the low-variance (systematic) sampler instead of multinomial.
    pub low_variance_sampler: bool,
    /// RNG seed; zero derives a fresh seed from the wall clock.
    pub seed: u64,
    /// Reseed the random stream when a new run begins.
    pub reset_on_each_run: bool,
    /// Scalar-measurement Gaussian normalizer selection.
    pub normalizer: GaussianNormalizer,
    /// Adaptive resampling threshold as a fraction of the particle count.
    pub resample_threshold: f64,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            particle_count: 1000,
            output_particle_count: 100,
            bootstrap: true,
            low_variance_sampler: false,
            seed: 0,
            reset_on_each_run: false,
            normalizer: GaussianNormalizer::Legacy,
            resample_threshold: 0.5,
        }
    }
}

/// Result of one particle filter step.
#[derive(Clone, Debug)]
pub struct StepOutput {
    /// Weighted-mean state estimate keyed by state names.
    pub estimate: StateEstimate,
    /// Output particle set, emitted before any resampling.
    pub particles: Vec<WeightedState>,
    /// Whether this step ended with a resampling pass.
    pub resampled: bool,
}

/// Result of one predictor firing.
#[derive(Clone, Debug)]
pub struct PredictionOutput {
    /// Weighted-mean state estimate after the lookahead horizon.
    pub estimate: StateEstimate,
    /// The full internal particle set, emitted as one array.
    pub particles: Vec<WeightedState>,
}

/// Propagate every particle through the model's update equations, adding a
/// process-noise sample according to the given strategy.
fn propagate_particles<M: StateSpaceModel>(
    model: &M,
    particles: &mut [Particle],
    inputs: &Inputs,
    t: f64,
    strategy: ProcessNoiseStrategy,
    rng: &mut RandomSource,
) -> Result<(), FilterError> {
    let dim = model.state_dimension();
    let shared_noise = match strategy {
        ProcessNoiseStrategy::PerStep => {
            let reference = particles
                .first()
                .map(|p| p.value().clone())
                .unwrap_or_else(|| DVector::zeros(dim));
            let noise = model.sample_process_noise(&reference, inputs, t, rng)?;
            check_dimension("process noise sample", dim, noise.len())?;
            Some(noise)
        }
        ProcessNoiseStrategy::PerParticle => None,
    };
    for particle in particles.iter_mut() {
        let noise = match &shared_noise {
            Some(noise) => noise.clone(),
            None => {
                let noise = model.sample_process_noise(particle.value(), inputs, t, rng)?;
                check_dimension("process noise sample", dim, noise.len())?;
                noise
            }
        };
        let next = model.update(particle.value(), inputs, t)?;
        check_dimension("state update", dim, next.len())?;
        particle.set_value(next + noise)?;
    }
    Ok(())
}

fn check_dimension(context: &'static str, expected: usize, actual: usize) -> Result<(), FilterError> {
    if expected == actual {
        Ok(())
    } else {
        Err(FilterError::Dimension {
            context,
            expected,
            actual,
        })
    }
}

/// Sequential Monte Carlo filter with its own particle memory.
///
/// A failed step is fatal for the run: the particle count and dimensions stay
/// consistent, but weights may be stale. Call [`SequentialEstimator::reset`]
/// to begin a clean run.
pub struct ParticleFilter<M: StateSpaceModel> {
    name: String,
    model: M,
    config: ParticleFilterConfig,
    particles: Vec<Particle>,
    rng: RandomSource,
    first_iteration: bool,
}

impl<M: StateSpaceModel + std::fmt::Debug> std::fmt::Debug for ParticleFilter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleFilter")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("config", &self.config)
            .field("particles", &self.particles)
            .field("rng", &self.rng)
            .field("first_iteration", &self.first_iteration)
            .finish()
    }
}

impl<M: StateSpaceModel> ParticleFilter<M> {
    /// Create a filter instance. The instance name feeds the seed derivation
    /// so same-seed instances draw distinct streams.
    pub fn new(
        name: impl Into<String>,
        model: M,
        config: ParticleFilterConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let dim = model.state_dimension();
        if dim == 0 {
            return Err(ConfigError::EmptyStateSpace);
        }
        if config.particle_count == 0 {
            return Err(ConfigError::InvalidParticleCount { requested: 0 });
        }
        if config.output_particle_count == 0 {
            return Err(ConfigError::InvalidParticleCount { requested: 0 });
        }
        let rng = RandomSource::new(config.seed, &name);
        let particles = vec![Particle::new(dim); config.particle_count];
        Ok(ParticleFilter {
            name,
            model,
            config,
            particles,
            rng,
            first_iteration: true,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.particles)
    }

    /// Change the seed and reinitialize the random stream.
    pub fn set_seed(&mut self, seed: u64) {
        self.config.seed = seed;
        self.rng = RandomSource::new(seed, &self.name);
    }

    fn scheme(&self) -> ResamplingScheme {
        if self.config.low_variance_sampler {
            ResamplingScheme::LowVariance
        } else {
            ResamplingScheme::Multinomial
        }
    }

    fn policy(&self) -> ResamplePolicy {
        ResamplePolicy {
            bootstrap: self.config.bootstrap,
            threshold: self.config.resample_threshold,
        }
    }

    fn initialize_particles(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<(), FilterError> {
        let dim = self.model.state_dimension();
        for slot in 0..self.particles.len() {
            let sample = self.model.sample_prior(&mut self.rng)?;
            if sample.len() != dim {
                return Err(ConfigError::DimensionMismatch {
                    context: "prior sample",
                    expected: dim,
                    actual: sample.len(),
                }
                .into());
            }
            let weight =
                measurement_weight(&sample, measurements, inputs, t, self.config.normalizer)?;
            self.particles[slot] = Particle::from_state(sample, weight);
        }
        Ok(())
    }

    fn reweigh(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<(), FilterError> {
        for particle in &mut self.particles {
            let weight = measurement_weight(
                particle.value(),
                measurements,
                inputs,
                t,
                self.config.normalizer,
            )?;
            particle.set_weight(weight);
        }
        Ok(())
    }

    fn output_particles(&mut self) -> Result<Vec<WeightedState>, FilterError> {
        if self.config.output_particle_count != self.particles.len() {
            let indices = subsample_indices(
                &self.particles,
                self.config.output_particle_count,
                self.scheme(),
                &mut self.rng,
            )?;
            let mut output: Vec<WeightedState> = indices
                .iter()
                .map(|&i| {
                    WeightedState::new(self.particles[i].value().clone(), self.particles[i].weight())
                })
                .collect();
            let sum: f64 = output.iter().map(|w| w.weight).sum();
            if sum > 0.0 && sum.is_finite() {
                for state in &mut output {
                    state.weight /= sum;
                }
            } else {
                warn!("output subsample weight sum is degenerate; emitting uniform weights");
                let uniform = 1.0 / output.len() as f64;
                for state in &mut output {
                    state.weight = uniform;
                }
            }
            Ok(output)
        } else {
            Ok(self
                .particles
                .iter()
                .map(|p| WeightedState::new(p.value().clone(), p.weight()))
                .collect())
        }
    }
}

impl<M: StateSpaceModel> SequentialEstimator for ParticleFilter<M> {
    type Output = StepOutput;

    fn step(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<StepOutput, FilterError> {
        if self.first_iteration {
            self.initialize_particles(t, inputs, measurements)?;
            self.first_iteration = false;
        } else {
            propagate_particles(
                &self.model,
                &mut self.particles,
                inputs,
                t,
                ProcessNoiseStrategy::PerParticle,
                &mut self.rng,
            )?;
            self.reweigh(t, inputs, measurements)?;
        }
        normalize_or_uniform(&mut self.particles);
        let estimate = self.estimate();
        let particles = self.output_particles()?;
        let ess = effective_sample_size(&self.particles);
        let resampled = if self.policy().should_resample(ess, self.particles.len()) {
            let scheme = self.scheme();
            resample(&mut self.particles, scheme, &mut self.rng)?;
            true
        } else {
            false
        };
        Ok(StepOutput {
            estimate,
            particles,
            resampled,
        })
    }

    fn estimate(&self) -> StateEstimate {
        let dim = self.model.state_dimension();
        let mut values = DVector::<f64>::zeros(dim);
        for particle in &self.particles {
            values += particle.weight() * particle.value();
        }
        StateEstimate::new(self.model.state_names().to_vec(), values)
    }

    fn reset(&mut self) {
        self.first_iteration = true;
        if self.config.reset_on_each_run {
            self.rng = RandomSource::new(self.config.seed, &self.name);
        }
    }
}

/// Predictor configuration.
#[derive(Clone, Debug)]
pub struct PredictorConfig {
    /// Lookahead horizon: propagation iterations per firing.
    pub prediction_steps: usize,
    /// Resample on every lookahead iteration instead of adaptively.
    pub bootstrap: bool,
    /// Use the low-variance (systematic) sampler instead of multinomial.
    pub low_variance_sampler: bool,
    /// RNG seed; zero derives a fresh seed from the wall clock.
    pub seed: u64,
    /// Reseed the random stream when a new run begins.
    pub reset_on_each_run: bool,
    /// Adaptive resampling threshold as a fraction of the particle count.
    pub resample_threshold: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        PredictorConfig {
            prediction_steps: 1,
            bootstrap: true,
            low_variance_sampler: false,
            seed: 0,
            reset_on_each_run: false,
            resample_threshold: 0.5,
        }
    }
}

/// Multi-step lookahead predictor over an externally supplied particle set.
///
/// Each firing replaces the internal particle set with the injected one, so
/// the predictor's particle count follows its input. All lookahead iterations
/// are evaluated at the firing time `t`.
pub struct ParticlePredictor<M: StateSpaceModel> {
    name: String,
    model: M,
    config: PredictorConfig,
    particles: Vec<Particle>,
    rng: RandomSource,
}

impl<M: StateSpaceModel> ParticlePredictor<M> {
    pub fn new(
        name: impl Into<String>,
        model: M,
        config: PredictorConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if model.state_dimension() == 0 {
            return Err(ConfigError::EmptyStateSpace);
        }
        let rng = RandomSource::new(config.seed, &name);
        Ok(ParticlePredictor {
            name,
            model,
            config,
            particles: Vec::new(),
            rng,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Run one firing: ingest the injected set, run the lookahead horizon,
    /// and emit the estimate plus the full internal set.
    pub fn step(
        &mut self,
        t: f64,
        inputs: &Inputs,
        injected: &[WeightedState],
    ) -> Result<PredictionOutput, FilterError> {
        if injected.is_empty() {
            return Err(ConfigError::InvalidParticleCount { requested: 0 }.into());
        }
        let dim = self.model.state_dimension();
        let mut particles = Vec::with_capacity(injected.len());
        for state in injected {
            check_dimension("injected particle", dim, state.values.len())?;
            particles.push(Particle::from_state(state.values.clone(), state.weight));
        }
        self.particles = particles;

        let n = self.particles.len();
        let policy = ResamplePolicy {
            bootstrap: self.config.bootstrap,
            threshold: self.config.resample_threshold,
        };
        let scheme = if self.config.low_variance_sampler {
            ResamplingScheme::LowVariance
        } else {
            ResamplingScheme::Multinomial
        };
        for _ in 0..self.config.prediction_steps {
            propagate_particles(
                &self.model,
                &mut self.particles,
                inputs,
                t,
                ProcessNoiseStrategy::PerStep,
                &mut self.rng,
            )?;
            // No measurements reach the predictor; propagated particles carry
            // uniform weight.
            uniform_weights(&mut self.particles);
            normalize_or_uniform(&mut self.particles);
            let ess = effective_sample_size(&self.particles);
            if policy.should_resample(ess, n) {
                resample(&mut self.particles, scheme, &mut self.rng)?;
            }
        }

        let mut values = DVector::<f64>::zeros(dim);
        for particle in &self.particles {
            values += particle.weight() * particle.value();
        }
        let estimate = StateEstimate::new(self.model.state_names().to_vec(), values);
        let particles = self
            .particles
            .iter()
            .map(|p| WeightedState::new(p.value().clone(), p.weight()))
            .collect();
        Ok(PredictionOutput {
            estimate,
            particles,
        })
    }

    /// Begin a new run, reseeding if so configured.
    pub fn reset(&mut self) {
        self.particles.clear();
        if self.config.reset_on_each_run {
            self.rng = RandomSource::new(self.config.seed, &self.name);
        }
    }
}
