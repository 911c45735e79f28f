//! Unscented Kalman filter over a user-defined state-space model.
//!
//! The filter carries a mean state and covariance as its sufficient
//! statistics and represents them with `2n + 1` deterministically placed
//! sigma points. Sigma points are regenerated from the mean and covariance
//! after every change: once after prediction and once after correction.
//!
//! Unlike the particle filter, no noise is injected per sigma point;
//! process noise enters through the covariance inflation term during
//! prediction.

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::SequentialEstimator;
use crate::error::{ConfigError, FilterError, NumericDegeneracy};
use crate::linalg::modified_cholesky;
use crate::model::{Inputs, MeasurementModel, MeasurementNoise, StateSpaceModel};
use crate::records::{StateEstimate, WeightedState};

/// Policy for inverting the innovation covariance during correction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum InnovationPolicy {
    /// Report [`NumericDegeneracy::SingularInnovation`] if inversion fails.
    #[default]
    FailFast,
    /// Add `ε·I` to the innovation covariance before inverting.
    Regularize(f64),
}

/// Unscented filter configuration, immutable for the duration of one run.
#[derive(Clone, Debug)]
pub struct UkfConfig {
    /// Sigma-point spread parameter. The center point carries weight
    /// `kappa / (n + kappa)`; all others carry `1 / (2(n + kappa))`.
    pub kappa: f64,
    /// Prior mean state, dimension `n`.
    pub prior_mean: DVector<f64>,
    /// Prior state covariance, `n × n`.
    pub prior_covariance: DMatrix<f64>,
    /// Process-noise covariance added during prediction, `n × n`.
    pub process_noise_covariance: DMatrix<f64>,
    pub innovation_policy: InnovationPolicy,
}

/// One deterministically placed point of the unscented transform.
#[derive(Clone, Debug)]
pub struct SigmaPoint {
    x_hat: DVector<f64>,
    weight: f64,
    y_hat: DVector<f64>,
    y_actual: DVector<f64>,
    noise_all: DMatrix<f64>,
}

impl SigmaPoint {
    fn new(dimension: usize, index: usize, kappa: f64) -> Self {
        let n = dimension as f64;
        let weight = if index == 0 {
            kappa / (n + kappa)
        } else {
            1.0 / (2.0 * (n + kappa))
        };
        SigmaPoint {
            x_hat: DVector::zeros(dimension),
            weight,
            y_hat: DVector::zeros(0),
            y_actual: DVector::zeros(0),
            noise_all: DMatrix::zeros(0, 0),
        }
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.x_hat
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Result of one unscented filter step.
#[derive(Clone, Debug)]
pub struct UkfOutput {
    /// Corrected mean state keyed by state names.
    pub estimate: StateEstimate,
    /// The `2n + 1` sigma points with their fixed weights.
    pub sigma_points: Vec<WeightedState>,
}

/// Unscented Kalman filter.
pub struct UnscentedKalmanFilter<M: StateSpaceModel> {
    model: M,
    config: UkfConfig,
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    sigma_points: Vec<SigmaPoint>,
    first_iteration: bool,
}

impl<M: StateSpaceModel + std::fmt::Debug> std::fmt::Debug for UnscentedKalmanFilter<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnscentedKalmanFilter")
            .field("model", &self.model)
            .field("config", &self.config)
            .field("mean", &self.mean)
            .field("covariance", &self.covariance)
            .field("sigma_points", &self.sigma_points)
            .field("first_iteration", &self.first_iteration)
            .finish()
    }
}

impl<M: StateSpaceModel> UnscentedKalmanFilter<M> {
    pub fn new(model: M, config: UkfConfig) -> Result<Self, ConfigError> {
        let n = model.state_dimension();
        if n == 0 {
            return Err(ConfigError::EmptyStateSpace);
        }
        if config.prior_mean.len() != n {
            return Err(ConfigError::DimensionMismatch {
                context: "prior mean",
                expected: n,
                actual: config.prior_mean.len(),
            });
        }
        if config.prior_covariance.shape() != (n, n) {
            return Err(ConfigError::DimensionMismatch {
                context: "prior covariance",
                expected: n,
                actual: config.prior_covariance.nrows(),
            });
        }
        if config.process_noise_covariance.shape() != (n, n) {
            return Err(ConfigError::DimensionMismatch {
                context: "process noise covariance",
                expected: n,
                actual: config.process_noise_covariance.nrows(),
            });
        }
        if n as f64 + config.kappa <= 0.0 {
            return Err(ConfigError::InvalidKappa {
                kappa: config.kappa,
                state_dimension: n,
            });
        }
        let mean = config.prior_mean.clone();
        let covariance = config.prior_covariance.clone();
        Ok(UnscentedKalmanFilter {
            model,
            config,
            mean,
            covariance,
            sigma_points: Vec::new(),
            first_iteration: true,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &UkfConfig {
        &self.config
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn sigma_points(&self) -> &[SigmaPoint] {
        &self.sigma_points
    }

    fn initialize(&mut self) {
        let n = self.model.state_dimension();
        self.mean = self.config.prior_mean.clone();
        self.covariance = self.config.prior_covariance.clone();
        self.sigma_points = (0..2 * n + 1)
            .map(|index| SigmaPoint::new(n, index, self.config.kappa))
            .collect();
        self.regenerate_sigma_points();
    }

    /// Re-derive the sigma points from the current mean and covariance.
    fn regenerate_sigma_points(&mut self) {
        let n = self.model.state_dimension();
        let decomposition = modified_cholesky(&self.covariance);
        if decomposition.is_degenerate() {
            warn!(
                "covariance has non-positive pivots in dimensions {:?}; sigma spread zeroed there",
                decomposition.degenerate
            );
        }
        let scale = (n as f64 + self.config.kappa).sqrt();
        self.sigma_points[0].x_hat = self.mean.clone();
        for col in 0..n {
            let offset = decomposition.factor.column(col) * scale;
            self.sigma_points[2 * col + 1].x_hat = &self.mean + &offset;
            self.sigma_points[2 * col + 2].x_hat = &self.mean - &offset;
        }
    }

    /// Unscented prediction: propagate the points, recombine the mean and
    /// covariance, inflate with process noise, re-derive the points.
    fn predict(&mut self, t: f64, inputs: &Inputs) -> Result<(), FilterError> {
        let n = self.model.state_dimension();
        for point in &mut self.sigma_points {
            let next = self.model.update(&point.x_hat, inputs, t)?;
            if next.len() != n {
                return Err(FilterError::Dimension {
                    context: "state update",
                    expected: n,
                    actual: next.len(),
                });
            }
            point.x_hat = next;
        }
        let mut mean = DVector::<f64>::zeros(n);
        for point in &self.sigma_points {
            mean += point.weight * &point.x_hat;
        }
        let mut covariance = DMatrix::<f64>::zeros(n, n);
        for point in &self.sigma_points {
            let diff = &point.x_hat - &mean;
            covariance += point.weight * &diff * diff.transpose();
        }
        covariance += &self.config.process_noise_covariance;
        self.mean = mean;
        self.covariance = covariance;
        self.regenerate_sigma_points();
        Ok(())
    }

    /// Correction: map the points into measurement space, form the innovation
    /// and cross covariances, apply the Kalman gain, re-derive the points.
    fn correct(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<(), FilterError> {
        let n = self.model.state_dimension();
        for point in &mut self.sigma_points {
            let (y_hat, y_actual, noise_all) =
                measurement_space(&point.x_hat, measurements, inputs, t)?;
            point.y_hat = y_hat;
            point.y_actual = y_actual;
            point.noise_all = noise_all;
        }
        let m = self.sigma_points[0].y_hat.len();
        let mut y_mean = DVector::<f64>::zeros(m);
        for point in &self.sigma_points {
            y_mean += point.weight * &point.y_hat;
        }
        let mut innovation_covariance = self.sigma_points[0].noise_all.clone();
        for point in &self.sigma_points {
            let diff = &point.y_hat - &y_mean;
            innovation_covariance += point.weight * &diff * diff.transpose();
        }
        let mut cross_covariance = DMatrix::<f64>::zeros(n, m);
        for point in &self.sigma_points {
            let state_diff = &point.x_hat - &self.mean;
            let measurement_diff = &point.y_hat - &y_mean;
            cross_covariance += point.weight * &state_diff * measurement_diff.transpose();
        }
        let inverse = self.invert_innovation(&innovation_covariance)?;
        let gain = &cross_covariance * inverse;
        // Innovation here is predicted minus actual; the gain term is
        // subtracted from the mean accordingly.
        let innovation = &y_mean - &self.sigma_points[0].y_actual;
        self.mean -= &gain * innovation;
        self.covariance -= &gain * cross_covariance.transpose();
        self.regenerate_sigma_points();
        Ok(())
    }

    fn invert_innovation(&self, s: &DMatrix<f64>) -> Result<DMatrix<f64>, FilterError> {
        match self.config.innovation_policy {
            InnovationPolicy::FailFast => s
                .clone()
                .try_inverse()
                .ok_or_else(|| NumericDegeneracy::SingularInnovation.into()),
            InnovationPolicy::Regularize(epsilon) => {
                let mut regularized = s.clone();
                for i in 0..regularized.nrows() {
                    regularized[(i, i)] += epsilon;
                }
                regularized
                    .try_inverse()
                    .ok_or_else(|| NumericDegeneracy::SingularInnovation.into())
            }
        }
    }
}

impl<M: StateSpaceModel> SequentialEstimator for UnscentedKalmanFilter<M> {
    type Output = UkfOutput;

    /// Run one step. Correction is skipped when no measurement channels are
    /// supplied for the step.
    fn step(
        &mut self,
        t: f64,
        inputs: &Inputs,
        measurements: &[&dyn MeasurementModel],
    ) -> Result<UkfOutput, FilterError> {
        if self.first_iteration {
            self.initialize();
            self.first_iteration = false;
        } else {
            self.predict(t, inputs)?;
        }
        if !measurements.is_empty() {
            self.correct(t, inputs, measurements)?;
        }
        let sigma_points = self
            .sigma_points
            .iter()
            .map(|p| WeightedState::new(p.x_hat.clone(), p.weight))
            .collect();
        Ok(UkfOutput {
            estimate: self.estimate(),
            sigma_points,
        })
    }

    fn estimate(&self) -> StateEstimate {
        StateEstimate::new(self.model.state_names().to_vec(), self.mean.clone())
    }

    fn reset(&mut self) {
        self.first_iteration = true;
    }
}

/// Map a state into the concatenated measurement space: predicted vector,
/// actual vector, and the block-diagonal noise matrix.
///
/// A scalar channel's noise value is written directly into its diagonal
/// block, i.e. it is treated as a variance here.
fn measurement_space(
    state: &DVector<f64>,
    measurements: &[&dyn MeasurementModel],
    inputs: &Inputs,
    t: f64,
) -> Result<(DVector<f64>, DVector<f64>, DMatrix<f64>), FilterError> {
    let mut predictions = Vec::with_capacity(measurements.len());
    let mut total = 0;
    for channel in measurements {
        let predicted = channel.predict(state, inputs, t)?;
        let noise = channel.noise(state, inputs, t)?;
        let actual = channel.value();
        let dimension = predicted.dimension();
        if actual.dimension() != dimension {
            return Err(FilterError::Dimension {
                context: "actual measurement",
                expected: dimension,
                actual: actual.dimension(),
            });
        }
        if noise.dimension() != dimension {
            return Err(FilterError::Dimension {
                context: "measurement noise block",
                expected: dimension,
                actual: noise.dimension(),
            });
        }
        total += dimension;
        predictions.push((predicted, actual, noise));
    }
    let mut y_hat = DVector::<f64>::zeros(total);
    let mut y_actual = DVector::<f64>::zeros(total);
    let mut noise_all = DMatrix::<f64>::zeros(total, total);
    let mut offset = 0;
    for (predicted, actual, noise) in predictions {
        let dimension = predicted.dimension();
        y_hat
            .rows_mut(offset, dimension)
            .copy_from(&predicted.to_vector());
        y_actual
            .rows_mut(offset, dimension)
            .copy_from(&actual.to_vector());
        match noise {
            MeasurementNoise::Scalar(value) => {
                noise_all[(offset, offset)] = value;
            }
            MeasurementNoise::Matrix(matrix) => {
                noise_all
                    .view_mut((offset, offset), (dimension, dimension))
                    .copy_from(&matrix);
            }
        }
        offset += dimension;
    }
    Ok((y_hat, y_actual, noise_all))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EquationMeasurement, EquationModel, MeasurementValue};
    use assert_approx_eq::assert_approx_eq;

    fn identity_model(names: &[&str]) -> EquationModel {
        let mut builder = EquationModel::builder().state_names(names.to_vec());
        for (i, name) in names.iter().enumerate() {
            builder = builder.update(*name, move |s, _, _| Some(s[i]));
        }
        builder
            .prior(|_| None)
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap()
    }

    fn scalar_config(kappa: f64) -> UkfConfig {
        UkfConfig {
            kappa,
            prior_mean: DVector::from_element(1, 0.0),
            prior_covariance: DMatrix::from_element(1, 1, 1.0),
            process_noise_covariance: DMatrix::zeros(1, 1),
            innovation_policy: InnovationPolicy::FailFast,
        }
    }

    fn state_channel(actual: f64, variance: f64) -> EquationMeasurement {
        let mut channel = EquationMeasurement::scalar(
            "z",
            |s, _, _| Some(s[0]),
            move |_, _, _| Some(variance),
        );
        channel.set_value(MeasurementValue::Scalar(actual));
        channel
    }

    #[test]
    fn sigma_point_weights_sum_to_one() {
        for &(n, kappa) in &[(1usize, 0.0), (2, 0.5), (3, 2.0), (5, 0.1)] {
            let sum: f64 = (0..2 * n + 1)
                .map(|index| SigmaPoint::new(n, index, kappa).weight())
                .sum();
            assert_approx_eq!(sum, 1.0, 1e-12);
        }
    }

    #[test]
    fn rejects_mismatched_prior_dimensions() {
        let model = identity_model(&["x", "v"]);
        let config = UkfConfig {
            kappa: 0.0,
            prior_mean: DVector::zeros(1),
            prior_covariance: DMatrix::identity(2, 2),
            process_noise_covariance: DMatrix::zeros(2, 2),
            innovation_policy: InnovationPolicy::FailFast,
        };
        let err = UnscentedKalmanFilter::new(model, config).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DimensionMismatch {
                context: "prior mean",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_kappa() {
        let model = identity_model(&["x"]);
        let config = UkfConfig {
            kappa: -1.0,
            ..scalar_config(0.0)
        };
        let err = UnscentedKalmanFilter::new(model, config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKappa { .. }));
    }

    #[test]
    fn one_dimensional_correction_moves_toward_measurement() {
        // Prior N(0, 1), identity update, measurement z = 2 with variance 1:
        // the Kalman gain is 1/2, so the posterior is N(1, 0.5).
        let model = identity_model(&["x"]);
        let mut ukf = UnscentedKalmanFilter::new(model, scalar_config(0.0)).unwrap();
        let channel = state_channel(2.0, 1.0);
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let output = ukf.step(0.0, &Inputs::new(), &channels).unwrap();
        assert_approx_eq!(output.estimate.get("x").unwrap(), 1.0, 1e-9);
        assert_approx_eq!(ukf.covariance()[(0, 0)], 0.5, 1e-9);
        assert!(ukf.covariance()[(0, 0)] < 1.0);
        assert_eq!(output.sigma_points.len(), 3);
    }

    #[test]
    fn prediction_follows_the_update_equation() {
        // x' = x + 1 with zero process noise shifts the mean by one per step
        // and leaves the covariance unchanged.
        let model = EquationModel::builder()
            .state_names(["x"])
            .update("x", |s, _, _| Some(s[0] + 1.0))
            .prior(|_| None)
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap();
        let mut ukf = UnscentedKalmanFilter::new(model, scalar_config(0.0)).unwrap();
        ukf.step(0.0, &Inputs::new(), &[]).unwrap();
        assert_approx_eq!(ukf.mean()[0], 0.0, 1e-12);
        ukf.step(1.0, &Inputs::new(), &[]).unwrap();
        assert_approx_eq!(ukf.mean()[0], 1.0, 1e-9);
        assert_approx_eq!(ukf.covariance()[(0, 0)], 1.0, 1e-9);
    }

    #[test]
    fn process_noise_inflates_the_covariance() {
        let model = identity_model(&["x"]);
        let config = UkfConfig {
            process_noise_covariance: DMatrix::from_element(1, 1, 0.25),
            ..scalar_config(0.0)
        };
        let mut ukf = UnscentedKalmanFilter::new(model, config).unwrap();
        ukf.step(0.0, &Inputs::new(), &[]).unwrap();
        ukf.step(1.0, &Inputs::new(), &[]).unwrap();
        assert_approx_eq!(ukf.covariance()[(0, 0)], 1.25, 1e-9);
    }

    #[test]
    fn degenerate_covariance_dimension_has_zero_spread() {
        // A zero leading variance must not panic; the corresponding sigma
        // spread collapses onto the mean.
        let model = identity_model(&["x", "v"]);
        let mut prior_covariance = DMatrix::zeros(2, 2);
        prior_covariance[(1, 1)] = 1.0;
        let config = UkfConfig {
            kappa: 0.0,
            prior_mean: DVector::zeros(2),
            prior_covariance,
            process_noise_covariance: DMatrix::zeros(2, 2),
            innovation_policy: InnovationPolicy::FailFast,
        };
        let mut ukf = UnscentedKalmanFilter::new(model, config).unwrap();
        let mut channel = EquationMeasurement::scalar(
            "z",
            |s, _, _| Some(s[1]),
            |_, _, _| Some(1.0),
        );
        channel.set_value(MeasurementValue::Scalar(0.5));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        ukf.step(0.0, &Inputs::new(), &channels).unwrap();
        // Dimension 0 had no prior spread and the measurement observes only
        // dimension 1, so the first state stays at its prior mean.
        assert_approx_eq!(ukf.mean()[0], 0.0, 1e-12);
        let points = ukf.sigma_points();
        assert_approx_eq!(points[1].value()[0], ukf.mean()[0], 1e-12);
        assert_approx_eq!(points[2].value()[0], ukf.mean()[0], 1e-12);
    }

    #[test]
    fn singular_innovation_fails_fast_by_default() {
        // A constant measurement prediction with zero noise gives a zero
        // innovation covariance.
        let model = identity_model(&["x"]);
        let mut ukf = UnscentedKalmanFilter::new(model, scalar_config(0.0)).unwrap();
        let mut channel = EquationMeasurement::scalar(
            "z",
            |_, _, _| Some(0.0),
            |_, _, _| Some(0.0),
        );
        channel.set_value(MeasurementValue::Scalar(1.0));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        let err = ukf.step(0.0, &Inputs::new(), &channels).unwrap_err();
        assert_eq!(
            err,
            FilterError::Degeneracy(NumericDegeneracy::SingularInnovation)
        );
    }

    #[test]
    fn regularization_recovers_a_singular_innovation() {
        let model = identity_model(&["x"]);
        let config = UkfConfig {
            innovation_policy: InnovationPolicy::Regularize(1e-6),
            ..scalar_config(0.0)
        };
        let mut ukf = UnscentedKalmanFilter::new(model, config).unwrap();
        let mut channel = EquationMeasurement::scalar(
            "z",
            |_, _, _| Some(0.0),
            |_, _, _| Some(0.0),
        );
        channel.set_value(MeasurementValue::Scalar(1.0));
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        assert!(ukf.step(0.0, &Inputs::new(), &channels).is_ok());
    }

    #[test]
    fn two_channels_concatenate_block_diagonally() {
        let state = DVector::from_vec(vec![1.0, 2.0]);
        let mut a = EquationMeasurement::scalar(
            "a",
            |s, _, _| Some(s[0]),
            |_, _, _| Some(0.5),
        );
        a.set_value(MeasurementValue::Scalar(1.0));
        let mut b = EquationMeasurement::new(
            "b",
            2,
            |s, _, _| Some(MeasurementValue::Vector(s.clone())),
            |_, _, _| Some(MeasurementNoise::Matrix(DMatrix::identity(2, 2) * 2.0)),
        );
        b.set_value(MeasurementValue::Vector(DVector::from_vec(vec![1.0, 2.0])));
        let channels: [&dyn MeasurementModel; 2] = [&a, &b];
        let (y_hat, y_actual, noise_all) =
            measurement_space(&state, &channels, &Inputs::new(), 0.0).unwrap();
        assert_eq!(y_hat.len(), 3);
        assert_eq!(y_actual.len(), 3);
        assert_eq!(noise_all.shape(), (3, 3));
        assert_eq!(noise_all[(0, 0)], 0.5);
        assert_eq!(noise_all[(1, 1)], 2.0);
        assert_eq!(noise_all[(2, 2)], 2.0);
        assert_eq!(noise_all[(0, 1)], 0.0);
    }

    #[test]
    fn reset_restores_the_prior() {
        let model = identity_model(&["x"]);
        let mut ukf = UnscentedKalmanFilter::new(model, scalar_config(0.0)).unwrap();
        let channel = state_channel(2.0, 1.0);
        let channels: [&dyn MeasurementModel; 1] = [&channel];
        ukf.step(0.0, &Inputs::new(), &channels).unwrap();
        assert!(ukf.mean()[0] != 0.0);
        ukf.reset();
        let output = ukf.step(0.0, &Inputs::new(), &[]).unwrap();
        assert_approx_eq!(output.estimate.get("x").unwrap(), 0.0, 1e-12);
        assert_approx_eq!(ukf.covariance()[(0, 0)], 1.0, 1e-12);
    }
}
