//! Prediction composition.
//!
//! The fixed-effect (tree ensemble) prediction and the random-effect
//! posterior are kept separate so callers decide how to combine or report
//! uncertainty; `response()` is the plain sum used for point prediction.

use ndarray::{Array1, Array2};

/// Posterior of the random-effect component at query inputs.
#[derive(Debug, Clone)]
pub struct RandomEffectPrediction {
    /// Posterior mean, one entry per query sample.
    pub mean: Array1<f64>,
    /// Posterior variances (diagonal of the posterior covariance), present
    /// only when covariance prediction was requested.
    pub variance: Option<Array1<f64>>,
    /// Full posterior covariance, present only when requested; its
    /// computation is O(n_new^2 * n_train) and gated for that reason.
    pub covariance: Option<Array2<f64>>,
}

impl RandomEffectPrediction {
    pub fn mean_only(mean: Array1<f64>) -> Self {
        Self {
            mean,
            variance: None,
            covariance: None,
        }
    }
}

/// Combined prediction at query points: fixed effect, random effect, and
/// optional uncertainty, kept separate.
#[derive(Debug, Clone)]
pub struct PredictionOutput {
    pub fixed: Array1<f64>,
    pub random: RandomEffectPrediction,
}

impl PredictionOutput {
    /// Point prediction: fixed effect plus random-effect posterior mean.
    pub fn response(&self) -> Array1<f64> {
        &self.fixed + &self.random.mean
    }
}

/// Standard errors from a covariance diagonal, clamped at zero against
/// roundoff.
pub fn se_from_covariance(cov: &Array2<f64>) -> Array1<f64> {
    let p = cov.nrows().min(cov.ncols());
    let mut se = Array1::<f64>::zeros(p);
    for i in 0..p {
        se[i] = cov[[i, i]].max(0.0).sqrt();
    }
    se
}
