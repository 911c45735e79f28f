//! User-defined state-space and measurement models.
//!
//! The estimators never parse or evaluate expressions themselves; the host
//! supplies compiled closures (or any type implementing the traits below),
//! constructed once at setup and invoked per particle or sigma point. Every
//! evaluation receives an immutable snapshot of the state vector, the named
//! control inputs, and the current time; there is no shared mutable
//! evaluation scope, so evaluation order cannot change results.
//!
//! [`EquationModel`] is the closure-backed [`StateSpaceModel`] used by the
//! runner and the tests: one update closure per state variable (registered by
//! name and validated at build time), one prior-sampling closure, and one
//! process-noise closure. [`EquationMeasurement`] is the matching
//! closure-backed [`MeasurementModel`].

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::error::{ConfigError, EvaluationError};
use crate::random::RandomSource;

/// Named control-input values for one step.
///
/// Control inputs are measurements used to drive the state update rather
/// than to constrain error; they are visible to every model closure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Inputs(BTreeMap<String, f64>);

impl Inputs {
    pub fn new() -> Self {
        Inputs(BTreeMap::new())
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) -> &mut Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// An actual or predicted measurement: one scalar channel or one vector channel.
#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementValue {
    Scalar(f64),
    Vector(DVector<f64>),
}

impl MeasurementValue {
    pub fn dimension(&self) -> usize {
        match self {
            MeasurementValue::Scalar(_) => 1,
            MeasurementValue::Vector(v) => v.len(),
        }
    }

    /// The value as a column vector (a scalar becomes a length-1 vector).
    pub fn to_vector(&self) -> DVector<f64> {
        match self {
            MeasurementValue::Scalar(z) => DVector::from_element(1, *z),
            MeasurementValue::Vector(v) => v.clone(),
        }
    }
}

/// The noise parameter attached to a measurement channel.
///
/// A scalar channel carries a single noise parameter; a vector channel
/// carries a full covariance matrix. Note the inherited semantics: the
/// particle weighting interprets `Scalar(sigma)` as a standard deviation,
/// while the unscented filter writes the scalar value directly into its
/// innovation-covariance block (variance semantics). Hosts supplying the same
/// channel to both filters must account for this.
#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementNoise {
    Scalar(f64),
    Matrix(DMatrix<f64>),
}

impl MeasurementNoise {
    pub fn dimension(&self) -> usize {
        match self {
            MeasurementNoise::Scalar(_) => 1,
            MeasurementNoise::Matrix(m) => m.nrows(),
        }
    }
}

/// The state-space model boundary consumed by every estimator.
///
/// `update` returns the deterministic part of the transition; process noise
/// is sampled separately and applied additively by the filters.
pub trait StateSpaceModel {
    /// Declared state variable names, one per dimension.
    fn state_names(&self) -> &[String];

    fn state_dimension(&self) -> usize {
        self.state_names().len()
    }

    /// Evaluate the state update equations: `x_{t+1} = f(x, u, t)`.
    fn update(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<DVector<f64>, EvaluationError>;

    /// Draw one sample from the prior state distribution.
    fn sample_prior(&self, rng: &mut RandomSource) -> Result<DVector<f64>, EvaluationError>;

    /// Draw one process-noise sample matching the state dimension.
    fn sample_process_noise(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
        rng: &mut RandomSource,
    ) -> Result<DVector<f64>, EvaluationError>;
}

/// One measurement channel: the actual measurement for the current step plus
/// the user-defined prediction and noise functions.
///
/// Channels are assumed conditionally independent given the state; the
/// particle weighting multiplies their likelihoods and the unscented filter
/// stacks them block-diagonally.
pub trait MeasurementModel {
    fn name(&self) -> &str;

    /// Declared dimension of this channel.
    fn dimension(&self) -> usize;

    /// The actual measurement received for the current step.
    fn value(&self) -> MeasurementValue;

    /// Predicted measurement for the given state: `y = g(x, u, t)`.
    fn predict(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<MeasurementValue, EvaluationError>;

    /// Noise parameter for the given state.
    fn noise(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<MeasurementNoise, EvaluationError>;
}

/// Per-state update closure: returns the next value of one state variable,
/// or `None` if the evaluation yields no result.
pub type UpdateFn = Box<dyn Fn(&DVector<f64>, &Inputs, f64) -> Option<f64>>;
/// Prior-sampling closure.
pub type PriorFn = Box<dyn Fn(&mut RandomSource) -> Option<DVector<f64>>>;
/// Process-noise sampling closure.
pub type ProcessNoiseFn =
    Box<dyn Fn(&DVector<f64>, &Inputs, f64, &mut RandomSource) -> Option<DVector<f64>>>;
/// Measurement-prediction closure.
pub type PredictFn = Box<dyn Fn(&DVector<f64>, &Inputs, f64) -> Option<MeasurementValue>>;
/// Measurement-noise closure.
pub type NoiseFn = Box<dyn Fn(&DVector<f64>, &Inputs, f64) -> Option<MeasurementNoise>>;

/// Closure-backed [`StateSpaceModel`], built with [`EquationModelBuilder`].
pub struct EquationModel {
    state_names: Vec<String>,
    updates: Vec<UpdateFn>,
    prior: PriorFn,
    process_noise: ProcessNoiseFn,
}

impl std::fmt::Debug for EquationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquationModel")
            .field("state_names", &self.state_names)
            .finish_non_exhaustive()
    }
}

impl EquationModel {
    pub fn builder() -> EquationModelBuilder {
        EquationModelBuilder::new()
    }
}

impl StateSpaceModel for EquationModel {
    fn state_names(&self) -> &[String] {
        &self.state_names
    }

    fn update(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<DVector<f64>, EvaluationError> {
        let mut next = DVector::zeros(self.state_names.len());
        for (i, update) in self.updates.iter().enumerate() {
            next[i] = update(state, inputs, t).ok_or_else(|| {
                EvaluationError::null_result(format!("{}_update", self.state_names[i]))
            })?;
        }
        Ok(next)
    }

    fn sample_prior(&self, rng: &mut RandomSource) -> Result<DVector<f64>, EvaluationError> {
        (self.prior)(rng).ok_or_else(|| EvaluationError::null_result("prior"))
    }

    fn sample_process_noise(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
        rng: &mut RandomSource,
    ) -> Result<DVector<f64>, EvaluationError> {
        (self.process_noise)(state, inputs, t, rng)
            .ok_or_else(|| EvaluationError::null_result("processNoise"))
    }
}

/// Builder that registers update equations by state variable name and
/// validates the model before any estimator can run it.
pub struct EquationModelBuilder {
    state_names: Vec<String>,
    updates: BTreeMap<String, UpdateFn>,
    prior: Option<PriorFn>,
    process_noise: Option<ProcessNoiseFn>,
}

impl EquationModelBuilder {
    pub fn new() -> Self {
        EquationModelBuilder {
            state_names: Vec::new(),
            updates: BTreeMap::new(),
            prior: None,
            process_noise: None,
        }
    }

    /// Declare the state variable names, in state-vector order.
    pub fn state_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Register the update equation for one state variable.
    pub fn update(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&DVector<f64>, &Inputs, f64) -> Option<f64> + 'static,
    ) -> Self {
        self.updates.insert(name.into(), Box::new(f));
        self
    }

    pub fn prior(
        mut self,
        f: impl Fn(&mut RandomSource) -> Option<DVector<f64>> + 'static,
    ) -> Self {
        self.prior = Some(Box::new(f));
        self
    }

    pub fn process_noise(
        mut self,
        f: impl Fn(&DVector<f64>, &Inputs, f64, &mut RandomSource) -> Option<DVector<f64>> + 'static,
    ) -> Self {
        self.process_noise = Some(Box::new(f));
        self
    }

    /// Validate and build. Every declared state must be non-empty, unique,
    /// and have a registered update equation; prior and process-noise
    /// functions are required.
    pub fn build(mut self) -> Result<EquationModel, ConfigError> {
        if self.state_names.is_empty() {
            return Err(ConfigError::EmptyStateSpace);
        }
        for (index, name) in self.state_names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyStateName { index });
            }
            if self.state_names[..index].contains(name) {
                return Err(ConfigError::DuplicateStateName { name: name.clone() });
            }
        }
        let mut updates = Vec::with_capacity(self.state_names.len());
        for name in &self.state_names {
            match self.updates.remove(name) {
                Some(f) => updates.push(f),
                None => {
                    return Err(ConfigError::MissingUpdateEquation { name: name.clone() });
                }
            }
        }
        let prior = self.prior.ok_or(ConfigError::MissingPrior)?;
        let process_noise = self.process_noise.ok_or(ConfigError::MissingProcessNoise)?;
        Ok(EquationModel {
            state_names: self.state_names,
            updates,
            prior,
            process_noise,
        })
    }
}

impl Default for EquationModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Closure-backed [`MeasurementModel`]. The actual measurement value is set
/// by the host before each step via [`EquationMeasurement::set_value`].
pub struct EquationMeasurement {
    name: String,
    dimension: usize,
    value: MeasurementValue,
    predict: PredictFn,
    noise: NoiseFn,
}

impl EquationMeasurement {
    pub fn new(
        name: impl Into<String>,
        dimension: usize,
        predict: impl Fn(&DVector<f64>, &Inputs, f64) -> Option<MeasurementValue> + 'static,
        noise: impl Fn(&DVector<f64>, &Inputs, f64) -> Option<MeasurementNoise> + 'static,
    ) -> Self {
        let value = if dimension == 1 {
            MeasurementValue::Scalar(0.0)
        } else {
            MeasurementValue::Vector(DVector::zeros(dimension))
        };
        EquationMeasurement {
            name: name.into(),
            dimension,
            value,
            predict: Box::new(predict),
            noise: Box::new(noise),
        }
    }

    /// Convenience constructor for a scalar channel.
    pub fn scalar(
        name: impl Into<String>,
        predict: impl Fn(&DVector<f64>, &Inputs, f64) -> Option<f64> + 'static,
        noise: impl Fn(&DVector<f64>, &Inputs, f64) -> Option<f64> + 'static,
    ) -> Self {
        EquationMeasurement::new(
            name,
            1,
            move |state, inputs, t| predict(state, inputs, t).map(MeasurementValue::Scalar),
            move |state, inputs, t| noise(state, inputs, t).map(MeasurementNoise::Scalar),
        )
    }

    /// Record the actual measurement received for the current step.
    pub fn set_value(&mut self, value: MeasurementValue) {
        self.value = value;
    }
}

impl MeasurementModel for EquationMeasurement {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn value(&self) -> MeasurementValue {
        self.value.clone()
    }

    fn predict(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<MeasurementValue, EvaluationError> {
        (self.predict)(state, inputs, t)
            .ok_or_else(|| EvaluationError::null_result(format!("{}_equation", self.name)))
    }

    fn noise(
        &self,
        state: &DVector<f64>,
        inputs: &Inputs,
        t: f64,
    ) -> Result<MeasurementNoise, EvaluationError> {
        (self.noise)(state, inputs, t)
            .ok_or_else(|| EvaluationError::null_result(format!("{}_noise", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_builder() -> EquationModelBuilder {
        EquationModel::builder()
            .state_names(["x", "v"])
            .update("x", |s, _, _| Some(s[0] + s[1]))
            .update("v", |s, _, _| Some(s[1]))
            .prior(|_| Some(DVector::from_vec(vec![0.0, 1.0])))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
    }

    #[test]
    fn builder_produces_working_model() {
        let model = two_state_builder().build().unwrap();
        assert_eq!(model.state_dimension(), 2);
        let next = model
            .update(&DVector::from_vec(vec![1.0, 2.0]), &Inputs::new(), 0.0)
            .unwrap();
        assert_eq!(next, DVector::from_vec(vec![3.0, 2.0]));
    }

    #[test]
    fn builder_rejects_empty_state_space() {
        let err = EquationModel::builder().build().unwrap_err();
        assert_eq!(err, ConfigError::EmptyStateSpace);
    }

    #[test]
    fn builder_rejects_empty_state_name() {
        let err = EquationModel::builder()
            .state_names(["x", "  "])
            .update("x", |s, _, _| Some(s[0]))
            .prior(|_| Some(DVector::zeros(2)))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::EmptyStateName { index: 1 });
    }

    #[test]
    fn builder_rejects_duplicate_state_name() {
        let err = EquationModel::builder()
            .state_names(["x", "x"])
            .update("x", |s, _, _| Some(s[0]))
            .prior(|_| Some(DVector::zeros(2)))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateStateName {
                name: "x".to_string()
            }
        );
    }

    #[test]
    fn builder_requires_an_update_per_state() {
        let err = EquationModel::builder()
            .state_names(["x", "v"])
            .update("x", |s, _, _| Some(s[0]))
            .prior(|_| Some(DVector::zeros(2)))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingUpdateEquation {
                name: "v".to_string()
            }
        );
    }

    #[test]
    fn builder_requires_prior_and_noise() {
        let err = EquationModel::builder()
            .state_names(["x"])
            .update("x", |s, _, _| Some(s[0]))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingPrior);
    }

    #[test]
    fn null_update_result_is_an_evaluation_error() {
        let model = EquationModel::builder()
            .state_names(["x"])
            .update("x", |_, _, _| None)
            .prior(|_| Some(DVector::zeros(1)))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap();
        let err = model
            .update(&DVector::zeros(1), &Inputs::new(), 0.0)
            .unwrap_err();
        assert!(err.name.contains("x_update"));
    }

    #[test]
    fn control_inputs_reach_the_update_equations() {
        let model = EquationModel::builder()
            .state_names(["x"])
            .update("x", |s, u, _| Some(s[0] + u.get("accel")?))
            .prior(|_| Some(DVector::zeros(1)))
            .process_noise(|s, _, _, _| Some(DVector::zeros(s.len())))
            .build()
            .unwrap();
        let mut inputs = Inputs::new();
        inputs.set("accel", 2.5);
        let next = model
            .update(&DVector::from_vec(vec![1.0]), &inputs, 0.0)
            .unwrap();
        assert_eq!(next[0], 3.5);
    }

    #[test]
    fn scalar_measurement_channel_evaluates() {
        let mut channel = EquationMeasurement::scalar(
            "z",
            |s, _, _| Some(s[0]),
            |_, _, _| Some(0.5),
        );
        channel.set_value(MeasurementValue::Scalar(1.25));
        assert_eq!(channel.dimension(), 1);
        assert_eq!(channel.value(), MeasurementValue::Scalar(1.25));
        let predicted = channel
            .predict(&DVector::from_vec(vec![2.0]), &Inputs::new(), 0.0)
            .unwrap();
        assert_eq!(predicted, MeasurementValue::Scalar(2.0));
    }
}
