//! Error types for the estimation crate.
//!
//! Three failure families exist. [`ConfigError`] covers problems that can be
//! detected at setup time and must be raised before the first step.
//! [`EvaluationError`] covers user-supplied model closures that fail or return
//! no value during a step. [`NumericDegeneracy`] covers conditions that are
//! recoverable by an explicit policy (zero weight sums, singular covariances,
//! degenerate cumulative arrays); they are surfaced as values rather than
//! masked by defensive fallbacks so callers and tests can assert on them.
//! [`FilterError`] is the step-level umbrella returned by the filters.

use std::error::Error;
use std::fmt::{self, Display};

/// Setup-time configuration failure. Fatal; never retried.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// The state space has zero declared dimensions.
    EmptyStateSpace,
    /// A state variable name is the empty string.
    EmptyStateName { index: usize },
    /// The same state variable name was declared twice.
    DuplicateStateName { name: String },
    /// A state variable has no registered update equation.
    MissingUpdateEquation { name: String },
    /// No prior-sampling function was registered.
    MissingPrior,
    /// No process-noise sampling function was registered.
    MissingProcessNoise,
    /// A configured vector or matrix does not match the state dimension.
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A particle or output-particle count of zero was requested.
    InvalidParticleCount { requested: usize },
    /// The sigma-point weight denominator `n + kappa` is not positive.
    InvalidKappa { kappa: f64, state_dimension: usize },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyStateSpace => {
                write!(f, "state space must have at least one state variable")
            }
            ConfigError::EmptyStateName { index } => {
                write!(f, "state variable name at index {index} is empty")
            }
            ConfigError::DuplicateStateName { name } => {
                write!(f, "state variable name '{name}' is declared more than once")
            }
            ConfigError::MissingUpdateEquation { name } => {
                write!(f, "state variable '{name}' has no registered update equation")
            }
            ConfigError::MissingPrior => write!(f, "no prior-sampling function registered"),
            ConfigError::MissingProcessNoise => {
                write!(f, "no process-noise sampling function registered")
            }
            ConfigError::DimensionMismatch {
                context,
                expected,
                actual,
            } => write!(
                f,
                "{context}: expected dimension {expected}, got {actual}"
            ),
            ConfigError::InvalidParticleCount { requested } => {
                write!(f, "particle count must be positive, got {requested}")
            }
            ConfigError::InvalidKappa {
                kappa,
                state_dimension,
            } => write!(
                f,
                "kappa {kappa} is invalid for state dimension {state_dimension}: n + kappa must be positive"
            ),
        }
    }
}

impl Error for ConfigError {}

/// A user-defined model function failed or produced no value.
///
/// Fatal for the step in which it occurs; filtering has no retry semantics
/// since the next step depends on this step's outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationError {
    /// Name of the state variable, channel, or function that failed.
    pub name: String,
    /// Human-readable failure description.
    pub reason: String,
}

impl EvaluationError {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        EvaluationError {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// The conventional error for a closure that returned `None`.
    pub fn null_result(name: impl Into<String>) -> Self {
        EvaluationError::new(name, "evaluation yielded no result")
    }
}

impl Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation of '{}' failed: {}", self.name, self.reason)
    }
}

impl Error for EvaluationError {}

/// A numerically degenerate condition with an explicit, testable policy.
#[derive(Clone, Debug, PartialEq)]
pub enum NumericDegeneracy {
    /// The particle weight sum is zero or non-finite; normalization is impossible.
    ZeroWeightSum,
    /// A binary interval search landed outside the cumulative array. This
    /// indicates a cumulative-sum construction bug and is never recoverable.
    SearchOutOfRange { value: f64 },
    /// A measurement-noise covariance could not be inverted.
    SingularCovariance { context: &'static str },
    /// The innovation covariance could not be inverted under the configured
    /// policy.
    SingularInnovation,
}

impl Display for NumericDegeneracy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumericDegeneracy::ZeroWeightSum => {
                write!(f, "particle weight sum is zero or non-finite")
            }
            NumericDegeneracy::SearchOutOfRange { value } => write!(
                f,
                "cumulative interval search out of range for draw {value}"
            ),
            NumericDegeneracy::SingularCovariance { context } => {
                write!(f, "singular covariance matrix in {context}")
            }
            NumericDegeneracy::SingularInnovation => {
                write!(f, "innovation covariance is singular")
            }
        }
    }
}

impl Error for NumericDegeneracy {}

/// Umbrella error returned by the per-step filter operations.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterError {
    Config(ConfigError),
    Evaluation(EvaluationError),
    Degeneracy(NumericDegeneracy),
    /// A vector produced at runtime does not match the declared dimensions.
    Dimension {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Config(e) => write!(f, "configuration error: {e}"),
            FilterError::Evaluation(e) => write!(f, "{e}"),
            FilterError::Degeneracy(e) => write!(f, "numeric degeneracy: {e}"),
            FilterError::Dimension {
                context,
                expected,
                actual,
            } => write!(
                f,
                "dimension mismatch in {context}: expected {expected}, got {actual}"
            ),
        }
    }
}

impl Error for FilterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FilterError::Config(e) => Some(e),
            FilterError::Evaluation(e) => Some(e),
            FilterError::Degeneracy(e) => Some(e),
            FilterError::Dimension { .. } => None,
        }
    }
}

impl From<ConfigError> for FilterError {
    fn from(e: ConfigError) -> Self {
        FilterError::Config(e)
    }
}

impl From<EvaluationError> for FilterError {
    fn from(e: EvaluationError) -> Self {
        FilterError::Evaluation(e)
    }
}

impl From<NumericDegeneracy> for FilterError {
    fn from(e: NumericDegeneracy) -> Self {
        FilterError::Degeneracy(e)
    }
}
