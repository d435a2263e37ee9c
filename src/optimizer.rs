//! Covariance hyperparameter optimization.
//!
//! Two update rules over eta = log(theta): plain gradient ascent with
//! optional Nesterov look-ahead, and Fisher scoring, which solves the
//! Fisher-information system for a natural-gradient step. Both share the
//! same outer state machine:
//!
//!   Init -> Iterate -> { Converged, MaxIterReached, Diverged }
//!
//! A rejected step (factorization failure, non-finite candidate, or a
//! likelihood drop beyond tolerance) halves the step scale and resets the
//! momentum history instead of aborting; after a configured number of
//! consecutive rejections the optimizer halts with `Diverged`, keeping the
//! best parameters seen. Divergence is a warning to the caller, never a
//! panic, so garbage parameters cannot leak into the boosting loop.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use faer::Side;

use crate::covariance::CompositeCovarianceModel;
use crate::faer_ndarray::{factorize_symmetric_with_fallback, FaerCholesky};
use crate::likelihood::SigmaFactor;
use crate::types::{CovParams, LogCovParams, OptimizerConfig, OptimizerKind, RemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerOutcome {
    Converged,
    MaxIterReached,
    Diverged,
}

/// One accepted optimizer iteration, retained for the `trace` option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub iteration: usize,
    pub log_lik: f64,
    pub step_scale: f64,
}

/// Result of one covariance-optimization call.
#[derive(Debug, Clone)]
pub struct FitSummary {
    /// Best hyperparameters found, natural scale.
    pub params: CovParams,
    pub log_lik: f64,
    pub iterations: usize,
    pub outcome: OptimizerOutcome,
    pub trace: Vec<TraceRecord>,
}

impl FitSummary {
    pub fn converged(&self) -> bool {
        self.outcome == OptimizerOutcome::Converged
    }
}

fn evaluate(
    model: &mut CompositeCovarianceModel,
    eta: &LogCovParams,
    residual: &Array1<f64>,
) -> Result<(f64, SigmaFactor), RemError> {
    model.set_log_params(eta)?;
    let factor = SigmaFactor::compute(model)?;
    let ll = factor.log_marginal(residual);
    Ok((ll, factor))
}

/// Solve the Fisher system `info * d = grad`.
///
/// The information matrix is PSD but can be numerically singular when the
/// likelihood surface is flat in some direction. The solver is LLT with an
/// LDLT fallback; if the fallback direction is unusable the diagonal ridge
/// grows until a Cholesky succeeds. Returns `None` when even a heavy ridge
/// fails, in which case the caller falls back to a plain gradient step.
fn fisher_direction(info: &Array2<f64>, grad: &Array1<f64>) -> Option<Array1<f64>> {
    if let Ok(factor) = factorize_symmetric_with_fallback(info, Side::Lower) {
        let d = factor.solve_vec(grad);
        if d.iter().all(|v| v.is_finite()) {
            return Some(d);
        }
    }

    let p = info.nrows();
    let scale = (0..p).map(|i| info[[i, i]].abs()).fold(0.0_f64, f64::max);
    let base = if scale > 0.0 { scale } else { 1.0 };
    let mut ridge = base * 1e-8;
    for _ in 0..8 {
        let ridged = info + &(Array2::<f64>::eye(p) * ridge);
        if let Ok(chol) = ridged.cholesky(Side::Lower) {
            let d = chol.solve_vec(grad);
            if d.iter().all(|v| v.is_finite()) {
                return Some(d);
            }
        }
        ridge *= 10.0;
    }
    None
}

/// Maximize the marginal log-likelihood over theta for a fixed residual.
///
/// On return the model holds the best parameters found, whatever the
/// outcome. Fatal errors are limited to invalid configuration/input and a
/// factorization failure at the starting point.
pub fn optimize(
    model: &mut CompositeCovarianceModel,
    residual: &Array1<f64>,
    config: &OptimizerConfig,
) -> Result<FitSummary, RemError> {
    config.validate()?;
    if residual.len() != model.n_samples() {
        return Err(RemError::InvalidInput(format!(
            "residual has {} entries, model covers {} samples",
            residual.len(),
            model.n_samples()
        )));
    }
    if !residual.iter().all(|v| v.is_finite()) {
        return Err(RemError::InvalidInput(
            "residual contains non-finite values".to_string(),
        ));
    }

    let mut eta = model.log_params();
    let mut eta_prev = eta.clone();
    let (mut ll, _) = evaluate(model, &eta, residual)?;

    let mut best_eta = eta.clone();
    let mut best_ll = ll;
    let mut step_scale = 1.0_f64;
    let mut failures = 0usize;
    let mut iterations = 0usize;
    let mut trace = Vec::new();
    let mut outcome = OptimizerOutcome::MaxIterReached;

    'iterate: for iter in 1..=config.max_iterations {
        iterations = iter;

        // Gradient evaluation point: the Nesterov look-ahead for momentum
        // gradient descent, the current iterate otherwise.
        let momentum_active = config.kind == OptimizerKind::GradientDescent
            && config.use_momentum
            && iter > 1
            && failures == 0;
        let base = if momentum_active {
            let ahead = &eta.0 + &((&eta.0 - &eta_prev.0) * config.momentum_rate);
            LogCovParams::new(ahead)
        } else {
            eta.clone()
        };

        let step = match evaluate(model, &base, residual) {
            Ok((_, base_factor)) => {
                let grad = base_factor.gradient_log_scale(model, residual);
                match config.kind {
                    OptimizerKind::GradientDescent => &grad * config.learning_rate,
                    OptimizerKind::FisherScoring => {
                        let info = base_factor.fisher_information_log_scale(model);
                        fisher_direction(&info, &grad)
                            .unwrap_or_else(|| &grad * config.learning_rate)
                    }
                }
            }
            Err(RemError::FactorizationFailure { .. }) | Err(RemError::InvalidParameter(_)) => {
                // Look-ahead point is not factorizable: shrink and retry
                // without momentum history.
                step_scale *= 0.5;
                failures += 1;
                eta_prev = eta.clone();
                if failures >= config.max_consecutive_failures {
                    outcome = OptimizerOutcome::Diverged;
                    break 'iterate;
                }
                continue;
            }
            Err(other) => return Err(other),
        };

        let candidate = LogCovParams::new(&base.0 + &(&step * step_scale));
        let accepted = match evaluate(model, &candidate, residual) {
            Ok((ll_new, _)) if ll_new.is_finite() => {
                if ll_new < ll - config.tolerance {
                    None
                } else {
                    Some(ll_new)
                }
            }
            Ok(_) => None,
            Err(RemError::FactorizationFailure { .. }) | Err(RemError::InvalidParameter(_)) => None,
            Err(other) => return Err(other),
        };

        match accepted {
            Some(ll_new) => {
                let delta_ll = ll_new - ll;
                let delta_eta = candidate
                    .iter()
                    .zip(eta.iter())
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0_f64, f64::max);

                eta_prev = eta;
                eta = candidate;
                ll = ll_new;
                failures = 0;
                step_scale = (step_scale * 2.0).min(1.0);

                if ll > best_ll {
                    best_ll = ll;
                    best_eta = eta.clone();
                }
                trace.push(TraceRecord {
                    iteration: iter,
                    log_lik: ll,
                    step_scale,
                });
                if config.trace {
                    log::debug!(
                        "[cov-opt] iter {iter}: log_lik = {ll:.6}, |dll| = {:.3e}, step_scale = {step_scale:.3}",
                        delta_ll.abs()
                    );
                }
                if delta_ll.abs() < config.tolerance || delta_eta < config.tolerance {
                    outcome = OptimizerOutcome::Converged;
                    break 'iterate;
                }
            }
            None => {
                step_scale *= 0.5;
                failures += 1;
                eta_prev = eta.clone();
                if config.trace {
                    log::debug!(
                        "[cov-opt] iter {iter}: step rejected, step_scale -> {step_scale:.3e}"
                    );
                }
                if failures >= config.max_consecutive_failures {
                    outcome = OptimizerOutcome::Diverged;
                    break 'iterate;
                }
            }
        }
    }

    // Leave the model at the best parameters seen, never at a rejected point.
    model.set_log_params(&best_eta)?;

    match outcome {
        OptimizerOutcome::Converged => {}
        OptimizerOutcome::MaxIterReached => {
            log::warn!(
                "covariance optimizer hit the iteration limit ({}) without converging; \
                continuing with the best parameters found (log_lik = {best_ll:.6})",
                config.max_iterations
            );
        }
        OptimizerOutcome::Diverged => {
            log::warn!(
                "covariance optimizer diverged after {failures} consecutive rejected steps; \
                keeping the last valid parameters (log_lik = {best_ll:.6})"
            );
        }
    }

    Ok(FitSummary {
        params: model.params().clone(),
        log_lik: best_ll,
        iterations,
        outcome,
        trace,
    })
}
