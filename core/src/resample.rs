//! Resampling engine: trigger policy, resampling schemes, and effective
//! sample size.
//!
//! Two choices are orthogonal. The *trigger policy* decides whether a step
//! resamples at all: a bootstrap filter resamples every step, an adaptive
//! filter only when the effective sample size drops below a fraction of the
//! particle count. The *scheme* decides how survivors are drawn: independent
//! multinomial draws, or the low-variance (systematic) scheme that spaces
//! evenly strided draws off a single random offset.
//!
//! Both schemes walk a cumulative-weight array of length `N + 1` with a
//! binary interval search. An out-of-range search result indicates a
//! cumulative-array construction bug and is a hard error, never a logged
//! fallback.

use log::warn;

use crate::error::{FilterError, NumericDegeneracy};
use crate::particle::{Particle, uniform_weights};
use crate::random::UniformSource;

/// Weights within this distance of zero are ignored by the effective sample
/// size computation.
pub const WEIGHT_EPSILON: f64 = 1e-12;

/// Tolerance on the cumulative-sum shortfall catch. A total weight below
/// `1.0 - CUMULATIVE_SUM_TOLERANCE` is treated as normalization loss and
/// replaced with uniform weights before resampling.
pub const CUMULATIVE_SUM_TOLERANCE: f64 = 1e-9;

/// How survivors are selected during a resampling pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResamplingScheme {
    /// One independent uniform draw per output slot.
    #[default]
    Multinomial,
    /// Systematic resampling: a single offset in `[0, 1/N)` plus an even
    /// `1/N` stride, reducing resampling variance.
    LowVariance,
}

/// When a filter step resamples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResamplePolicy {
    /// Resample on every step regardless of degeneracy.
    pub bootstrap: bool,
    /// Adaptive threshold as a fraction of the particle count.
    pub threshold: f64,
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy {
            bootstrap: true,
            threshold: 0.5,
        }
    }
}

impl ResamplePolicy {
    pub fn should_resample(&self, effective_sample_size: f64, particle_count: usize) -> bool {
        self.bootstrap || effective_sample_size < self.threshold * particle_count as f64
    }
}

/// Effective sample size `1 / Σ w_i²`, skipping weights numerically close to
/// zero.
///
/// An all-zero weight vector yields `0.0`, which trips the adaptive trigger
/// and is then recovered by the resampler's uniform-weight catch.
pub fn effective_sample_size(particles: &[Particle]) -> f64 {
    let sum_of_squares: f64 = particles
        .iter()
        .map(|p| p.weight())
        .filter(|w| w.abs() > WEIGHT_EPSILON)
        .map(|w| w * w)
        .sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// Build the cumulative-weight array: `cum[0] = 0`, `cum[i+1] = cum[i] + w_i`.
pub fn cumulative_weights(particles: &[Particle]) -> Vec<f64> {
    let mut cumulative = Vec::with_capacity(particles.len() + 1);
    cumulative.push(0.0);
    let mut running = 0.0;
    for particle in particles {
        running += particle.weight();
        cumulative.push(running);
    }
    cumulative
}

/// Find `i` such that `cumulative[i] <= value < cumulative[i + 1]`.
///
/// Returns `None` when the value lies outside the array's range. The upper
/// endpoint maps to the last interval.
fn binary_interval_search(cumulative: &[f64], value: f64) -> Option<usize> {
    let n = cumulative.len() - 1;
    if n == 0 || value < cumulative[0] || value > cumulative[n] {
        return None;
    }
    let mut low = 0;
    let mut high = n;
    while high - low > 1 {
        let mid = (low + high) / 2;
        if value < cumulative[mid] {
            high = mid;
        } else {
            low = mid;
        }
    }
    Some(low)
}

/// Resample the particle set in place, leaving every weight at `1/N`.
///
/// Survivors are fresh copies of the selected particles; the particle count
/// never changes. If the cumulative sum falls short of one (normalization
/// loss), the weights are first reset to uniform.
pub fn resample<U: UniformSource + ?Sized>(
    particles: &mut [Particle],
    scheme: ResamplingScheme,
    rng: &mut U,
) -> Result<(), FilterError> {
    let n = particles.len();
    if n == 0 {
        return Ok(());
    }
    let mut cumulative = cumulative_weights(particles);
    if cumulative[n] < 1.0 - CUMULATIVE_SUM_TOLERANCE {
        warn!(
            "cumulative weight {} below 1; resetting to uniform before resampling",
            cumulative[n]
        );
        uniform_weights(particles);
        cumulative = cumulative_weights(particles);
    }
    let previous: Vec<Particle> = particles.to_vec();
    let uniform = 1.0 / n as f64;

    match scheme {
        ResamplingScheme::Multinomial => {
            for slot in particles.iter_mut() {
                let draw = rng.next_uniform() * cumulative[n];
                let index = binary_interval_search(&cumulative, draw)
                    .ok_or(NumericDegeneracy::SearchOutOfRange { value: draw })?;
                *slot = Particle::from_state(previous[index].value().clone(), uniform);
            }
        }
        ResamplingScheme::LowVariance => {
            let base = rng.next_uniform() * uniform;
            for (i, slot) in particles.iter_mut().enumerate() {
                let draw = base + i as f64 * uniform;
                let index = binary_interval_search(&cumulative, draw)
                    .ok_or(NumericDegeneracy::SearchOutOfRange { value: draw })?;
                *slot = Particle::from_state(previous[index].value().clone(), uniform);
            }
        }
    }
    Ok(())
}

/// Select `output_count` particle indices using the given scheme, without
/// copying particle values.
///
/// Used when the filter emits fewer particles than it maintains internally;
/// the caller renormalizes the subsample's weights by their partial sum.
pub fn subsample_indices<U: UniformSource + ?Sized>(
    particles: &[Particle],
    output_count: usize,
    scheme: ResamplingScheme,
    rng: &mut U,
) -> Result<Vec<usize>, FilterError> {
    let n = particles.len();
    if n == 0 || output_count == 0 {
        return Ok(Vec::new());
    }
    let cumulative = cumulative_weights(particles);
    let mut indices = Vec::with_capacity(output_count);
    match scheme {
        ResamplingScheme::Multinomial => {
            for _ in 0..output_count {
                let draw = rng.next_uniform() * cumulative[n];
                let index = binary_interval_search(&cumulative, draw)
                    .ok_or(NumericDegeneracy::SearchOutOfRange { value: draw })?;
                indices.push(index);
            }
        }
        ResamplingScheme::LowVariance => {
            let stride = 1.0 / output_count as f64;
            let base = rng.next_uniform() * stride;
            for i in 0..output_count {
                let draw = base + i as f64 * stride;
                let index = binary_interval_search(&cumulative, draw)
                    .ok_or(NumericDegeneracy::SearchOutOfRange { value: draw })?;
                indices.push(index);
            }
        }
    }
    Ok(indices)
}
