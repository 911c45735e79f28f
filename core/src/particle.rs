//! Particle entity and the measurement-likelihood weighting engine.
//!
//! A [`Particle`] is one hypothesis in the Monte Carlo approximation of the
//! posterior: a fixed-size state vector plus a scalar importance weight.
//! Particles are owned exclusively by their slot in the filter's particle
//! array; resampling copies values into fresh particles rather than aliasing,
//! so mutating one slot can never affect another.
//!
//! The weighting engine scores a particle as the product of per-channel
//! Gaussian likelihoods, assuming the channels are conditionally independent
//! given the state. This is a modeling assumption, not a general multi-sensor
//! fusion scheme.

use log::warn;
use nalgebra::DVector;

use crate::error::{FilterError, NumericDegeneracy};
use crate::model::{Inputs, MeasurementModel, MeasurementNoise, MeasurementValue};

/// One weighted state hypothesis.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    value: DVector<f64>,
    weight: f64,
}

impl Particle {
    /// Create a zero-valued, zero-weight particle of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Particle {
            value: DVector::zeros(dimension),
            weight: 0.0,
        }
    }

    /// Create a particle from an existing state vector and weight.
    pub fn from_state(value: DVector<f64>, weight: f64) -> Self {
        Particle { value, weight }
    }

    pub fn dimension(&self) -> usize {
        self.value.len()
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    /// Replace the particle's state. The new value must match the particle's
    /// dimension.
    pub fn set_value(&mut self, value: DVector<f64>) -> Result<(), FilterError> {
        if value.len() != self.value.len() {
            return Err(FilterError::Dimension {
                context: "particle value",
                expected: self.value.len(),
                actual: value.len(),
            });
        }
        self.value = value;
        Ok(())
    }
}

/// Which scalar-measurement Gaussian normalizer the weighting engine uses.
///
/// The inherited behavior divides by `σ²` in the normalizer rather than `σ`,
/// which scales absolute (but, for a fixed σ, not relative) weights. It is
/// kept as the default; `Standard` selects the textbook density.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GaussianNormalizer {
    /// `1 / (√(2π)·σ²)` — the source system's literal normalizer.
    #[default]
    Legacy,
    /// `1 / (√(2π)·σ)` — the standard univariate normal density.
    Standard,
}

/// Compute the unnormalized weight of one state hypothesis as the product of
/// per-channel Gaussian likelihoods.
///
/// Scalar channels interpret their noise parameter as a standard deviation;
/// vector channels use the full multivariate density with the channel's
/// covariance matrix. A singular covariance is reported as
/// [`NumericDegeneracy::SingularCovariance`].
pub fn measurement_weight(
    state: &DVector<f64>,
    measurements: &[&dyn MeasurementModel],
    inputs: &Inputs,
    t: f64,
    normalizer: GaussianNormalizer,
) -> Result<f64, FilterError> {
    let mut weight = 1.0;
    for channel in measurements {
        let predicted = channel.predict(state, inputs, t)?;
        let noise = channel.noise(state, inputs, t)?;
        let actual = channel.value();
        weight *= channel_likelihood(&actual, &predicted, &noise, normalizer)?;
    }
    Ok(weight)
}

fn channel_likelihood(
    actual: &MeasurementValue,
    predicted: &MeasurementValue,
    noise: &MeasurementNoise,
    normalizer: GaussianNormalizer,
) -> Result<f64, FilterError> {
    match (actual, predicted, noise) {
        (
            MeasurementValue::Scalar(z),
            MeasurementValue::Scalar(mean),
            MeasurementNoise::Scalar(sigma),
        ) => {
            let coefficient = match normalizer {
                GaussianNormalizer::Legacy => {
                    1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma * sigma)
                }
                GaussianNormalizer::Standard => {
                    1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma)
                }
            };
            let residual = z - mean;
            Ok(coefficient * (-residual * residual / (2.0 * sigma * sigma)).exp())
        }
        (actual, predicted, MeasurementNoise::Matrix(covariance)) => {
            let z = actual.to_vector();
            let mean = predicted.to_vector();
            if z.len() != mean.len() || covariance.nrows() != z.len() {
                return Err(FilterError::Dimension {
                    context: "measurement channel",
                    expected: z.len(),
                    actual: mean.len().max(covariance.nrows()),
                });
            }
            let k = z.len() as f64;
            let determinant = covariance.determinant();
            if determinant <= 0.0 {
                return Err(NumericDegeneracy::SingularCovariance {
                    context: "measurement likelihood",
                }
                .into());
            }
            let inverse = covariance.clone().try_inverse().ok_or(
                NumericDegeneracy::SingularCovariance {
                    context: "measurement likelihood",
                },
            )?;
            let residual = z - mean;
            let quadratic = (residual.transpose() * inverse * &residual)[(0, 0)];
            let multiplier =
                (2.0 * std::f64::consts::PI).powf(-0.5 * k) * determinant.powf(-0.5);
            Ok(multiplier * (-0.5 * quadratic).exp())
        }
        _ => Err(FilterError::Dimension {
            context: "measurement channel shape",
            expected: predicted.dimension(),
            actual: actual.dimension(),
        }),
    }
}

/// Normalize particle weights in place so they sum to one.
///
/// Returns the pre-normalization sum on success. A zero or non-finite sum is
/// reported as [`NumericDegeneracy::ZeroWeightSum`] with the weights left
/// untouched; callers choose the recovery policy.
pub fn normalize_weights(particles: &mut [Particle]) -> Result<f64, NumericDegeneracy> {
    let sum: f64 = particles.iter().map(|p| p.weight()).sum();
    if sum > 0.0 && sum.is_finite() {
        for particle in particles.iter_mut() {
            let w = particle.weight() / sum;
            particle.set_weight(w);
        }
        Ok(sum)
    } else {
        Err(NumericDegeneracy::ZeroWeightSum)
    }
}

/// Reset every weight to `1/N`.
pub fn uniform_weights(particles: &mut [Particle]) {
    let n = particles.len();
    if n == 0 {
        return;
    }
    let uniform = 1.0 / n as f64;
    for particle in particles.iter_mut() {
        particle.set_weight(uniform);
    }
}

/// Normalize, falling back to uniform weights on a degenerate sum.
///
/// This is the filters' explicit recovery policy for the zero-weight-sum
/// degeneracy; the fallback is logged so it is visible in operation.
pub fn normalize_or_uniform(particles: &mut [Particle]) {
    if let Err(degeneracy) = normalize_weights(particles) {
        warn!("{degeneracy}; resetting particle weights to uniform");
        uniform_weights(particles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EquationMeasurement;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;

    fn scalar_channel(actual: f64, sigma: f64) -> EquationMeasurement {
        let mut channel = EquationMeasurement::scalar(
            "z",
            |state, _, _| Some(state[0]),
            move |_, _, _| Some(sigma),
        );
        channel.set_value(MeasurementValue::Scalar(actual));
        channel
    }

    #[test]
    fn particle_rejects_wrong_dimension_value() {
        let mut particle = Particle::new(3);
        let err = particle
            .set_value(DVector::from_vec(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, FilterError::Dimension { expected: 3, actual: 2, .. }));
    }

    #[test]
    fn legacy_normalizer_divides_by_sigma_squared() {
        let sigma = 2.0;
        let channel = scalar_channel(0.0, sigma);
        let state = DVector::from_vec(vec![0.0]);
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let legacy = measurement_weight(
            &state,
            &channels,
            &Inputs::new(),
            0.0,
            GaussianNormalizer::Legacy,
        )
        .unwrap();
        let standard = measurement_weight(
            &state,
            &channels,
            &Inputs::new(),
            0.0,
            GaussianNormalizer::Standard,
        )
        .unwrap();
        // At zero residual the densities differ exactly by the extra 1/σ.
        assert_approx_eq!(standard / legacy, sigma, 1e-12);
        assert_approx_eq!(
            standard,
            1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma),
            1e-12
        );
    }

    #[test]
    fn likelihood_is_product_over_channels() {
        let a = scalar_channel(0.0, 1.0);
        let b = scalar_channel(0.0, 1.0);
        let state = DVector::from_vec(vec![0.0]);
        let one: [&dyn MeasurementModel; 1] = [&a];
        let two: [&dyn MeasurementModel; 2] = [&a, &b];
        let w1 = measurement_weight(&state, &one, &Inputs::new(), 0.0, GaussianNormalizer::Legacy)
            .unwrap();
        let w2 = measurement_weight(&state, &two, &Inputs::new(), 0.0, GaussianNormalizer::Legacy)
            .unwrap();
        assert_approx_eq!(w2, w1 * w1, 1e-15);
    }

    #[test]
    fn vector_channel_uses_multivariate_density() {
        let mut channel = EquationMeasurement::new(
            "pos",
            2,
            |state, _, _| Some(MeasurementValue::Vector(state.clone())),
            |_, _, _| Some(MeasurementNoise::Matrix(DMatrix::identity(2, 2))),
        );
        channel.set_value(MeasurementValue::Vector(DVector::from_vec(vec![0.0, 0.0])));
        let state = DVector::from_vec(vec![0.0, 0.0]);
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let w = measurement_weight(
            &state,
            &channels,
            &Inputs::new(),
            0.0,
            GaussianNormalizer::Legacy,
        )
        .unwrap();
        // (2π)^{-k/2} with k = 2, det = 1, zero residual.
        assert_approx_eq!(w, 1.0 / (2.0 * std::f64::consts::PI), 1e-12);
    }

    #[test]
    fn singular_covariance_is_reported() {
        let mut channel = EquationMeasurement::new(
            "pos",
            2,
            |state, _, _| Some(MeasurementValue::Vector(state.clone())),
            |_, _, _| Some(MeasurementNoise::Matrix(DMatrix::zeros(2, 2))),
        );
        channel.set_value(MeasurementValue::Vector(DVector::zeros(2)));
        let state = DVector::zeros(2);
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let err = measurement_weight(
            &state,
            &channels,
            &Inputs::new(),
            0.0,
            GaussianNormalizer::Legacy,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FilterError::Degeneracy(NumericDegeneracy::SingularCovariance { .. })
        ));
    }

    #[test]
    fn normalize_sums_to_one() {
        let mut particles: Vec<Particle> = (1..=4)
            .map(|i| Particle::from_state(DVector::zeros(1), i as f64))
            .collect();
        let sum = normalize_weights(&mut particles).unwrap();
        assert_approx_eq!(sum, 10.0, 1e-12);
        let total: f64 = particles.iter().map(|p| p.weight()).sum();
        assert_approx_eq!(total, 1.0, 1e-9);
    }

    #[test]
    fn normalize_reports_zero_sum() {
        let mut particles = vec![Particle::new(1), Particle::new(1)];
        let err = normalize_weights(&mut particles).unwrap_err();
        assert_eq!(err, NumericDegeneracy::ZeroWeightSum);
        // Weights untouched on failure.
        assert_eq!(particles[0].weight(), 0.0);
    }

    #[test]
    fn normalize_or_uniform_recovers_from_zero_sum() {
        let mut particles = vec![Particle::new(1), Particle::new(1)];
        normalize_or_uniform(&mut particles);
        assert_approx_eq!(particles[0].weight(), 0.5, 1e-12);
        assert_approx_eq!(particles[1].weight(), 0.5, 1e-12);
    }
}
