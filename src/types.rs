use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use thiserror::Error;

use crate::faer_ndarray::FaerLinalgError;

/// Covariance hyperparameters on their natural (positive) scale.
///
/// Ordered as `[noise variance, params of component 0, params of component 1, ...]`
/// where kernel components contribute `(marginal variance, range)` and grouped
/// components contribute their variance only. Owned by the composite
/// covariance model and mutated only through the optimizer.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct CovParams(pub Array1<f64>);

impl CovParams {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn ln(&self) -> LogCovParams {
        LogCovParams(self.0.mapv(f64::ln))
    }
}

impl Deref for CovParams {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for CovParams {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for CovParams {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<CovParams> for Array1<f64> {
    fn from(values: CovParams) -> Self {
        values.0
    }
}

/// Log-scale covariance parameters: the optimizer's unconstrained coordinates.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct LogCovParams(pub Array1<f64>);

impl LogCovParams {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn exp(&self) -> CovParams {
        CovParams(self.0.mapv(f64::exp))
    }

    pub fn view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for LogCovParams {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LogCovParams {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for LogCovParams {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

/// Which algorithm updates the covariance hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    GradientDescent,
    FisherScoring,
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_momentum_rate() -> f64 {
    0.5
}

fn default_tolerance() -> f64 {
    1e-6
}

fn default_max_iterations() -> usize {
    1000
}

fn default_max_consecutive_failures() -> usize {
    10
}

/// Covariance-optimizer configuration.
///
/// Only the options listed here are recognized; everything else about the
/// optimization (jitter, backoff policy) is fixed engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Nesterov momentum for gradient descent; ignored by Fisher scoring.
    #[serde(default)]
    pub use_momentum: bool,
    #[serde(default = "default_momentum_rate")]
    pub momentum_rate: f64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Per-iteration logging at debug level.
    #[serde(default)]
    pub trace: bool,
    /// Consecutive rejected steps before the optimizer gives up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::FisherScoring,
            learning_rate: default_learning_rate(),
            use_momentum: false,
            momentum_rate: default_momentum_rate(),
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            trace: false,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl OptimizerConfig {
    pub fn gradient_descent(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::GradientDescent,
            learning_rate,
            ..Self::default()
        }
    }

    pub fn fisher_scoring() -> Self {
        Self {
            kind: OptimizerKind::FisherScoring,
            ..Self::default()
        }
    }

    pub fn with_momentum(mut self, rate: f64) -> Self {
        self.use_momentum = true;
        self.momentum_rate = rate;
        self
    }

    pub fn validate(&self) -> Result<(), RemError> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(RemError::InvalidParameter(format!(
                "learning rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if self.use_momentum && !(0.0..1.0).contains(&self.momentum_rate) {
            return Err(RemError::InvalidParameter(format!(
                "momentum rate must lie in [0, 1), got {}",
                self.momentum_rate
            )));
        }
        if !(self.tolerance > 0.0) {
            return Err(RemError::InvalidParameter(format!(
                "convergence tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(RemError::InvalidParameter(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engine-level error type.
///
/// Optimizer non-convergence is deliberately NOT an error: it is reported in
/// the fit summary and logged, and training continues with the best
/// parameters found.
#[derive(Debug, Error)]
pub enum RemError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(
        "Covariance factorization failed even after diagonal jitter (n = {n}). \
        The covariance matrix is numerically singular for the current hyperparameters."
    )]
    FactorizationFailure { n: usize },

    #[error("Configuration conflict: {0}")]
    ConfigurationConflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Linear algebra backend error: {0}")]
    Linalg(#[from] FaerLinalgError),
}
