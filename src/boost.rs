//! Boosting coupling loop.
//!
//! The tree engine stays an external collaborator behind the `TreeLearner`
//! trait: the loop hands it a per-sample gradient and Hessian, receives one
//! fitted tree back, and owns everything else — the cumulative score, the
//! cadenced re-optimization of the covariance hyperparameters, the held-out
//! metric and early stopping, and the fold fan-out for cross-validation.
//!
//! Training is round-sequential by construction; parallelism lives inside a
//! round (and across CV folds, each with its own model instances).

use ndarray::{Array1, Array2, ArrayView2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::components::{ComponentInput, ComponentSpec};
use crate::model::RandomEffectsModel;
use crate::optimizer::FitSummary;
use crate::predict::PredictionOutput;
use crate::types::{OptimizerConfig, RemError};

/// One fitted tree: predicts its contribution at arbitrary inputs.
pub trait TreeFunction: Send + Sync {
    fn predict(&self, x: ArrayView2<'_, f64>) -> Array1<f64>;
}

/// The external tree engine contract: fit one tree to a supplied per-sample
/// gradient and Hessian, return it as a prediction function.
pub trait TreeLearner {
    fn fit_tree(
        &mut self,
        x: ArrayView2<'_, f64>,
        grad: &Array1<f64>,
        hess: &Array1<f64>,
    ) -> Result<Box<dyn TreeFunction>, RemError>;
}

fn default_shrinkage() -> f64 {
    0.1
}

fn default_re_fit_cadence() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostingConfig {
    pub num_rounds: usize,
    /// Learning rate applied to each tree's contribution.
    #[serde(default = "default_shrinkage")]
    pub shrinkage: f64,
    /// Re-optimize covariance hyperparameters every this many rounds.
    /// Early rounds move theta the most; once F stabilizes a sparser
    /// cadence trades a little fidelity for speed.
    #[serde(default = "default_re_fit_cadence")]
    pub re_fit_cadence: usize,
    /// Stop after this many rounds without held-out improvement.
    #[serde(default)]
    pub early_stopping_rounds: Option<usize>,
    /// Fold the random-effect posterior into the held-out metric.
    #[serde(default)]
    pub use_re_model_for_validation: bool,
    /// Also report the metric on the training partition.
    #[serde(default)]
    pub evaluate_training_metric: bool,
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self {
            num_rounds: 100,
            shrinkage: default_shrinkage(),
            re_fit_cadence: default_re_fit_cadence(),
            early_stopping_rounds: None,
            use_re_model_for_validation: false,
            evaluate_training_metric: false,
        }
    }
}

impl BoostingConfig {
    pub fn validate(&self) -> Result<(), RemError> {
        if self.num_rounds == 0 {
            return Err(RemError::InvalidParameter(
                "num_rounds must be at least 1".to_string(),
            ));
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(RemError::InvalidParameter(format!(
                "shrinkage must lie in (0, 1], got {}",
                self.shrinkage
            )));
        }
        if self.re_fit_cadence == 0 {
            return Err(RemError::InvalidParameter(
                "re_fit_cadence must be at least 1".to_string(),
            ));
        }
        // Scoring the training partition through the random-effects model
        // would leak the training residuals into their own metric.
        if self.use_re_model_for_validation && self.evaluate_training_metric {
            return Err(RemError::ConfigurationConflict(
                "use_re_model_for_validation cannot be combined with a metric on the \
                training partition; the posterior already interpolates the training \
                residuals"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Held-out data for the early-stopping metric.
pub struct ValidationSet {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// Random-effect inputs for the held-out rows, one per component, used
    /// when `use_re_model_for_validation` is set.
    pub inputs: Vec<ComponentInput>,
}

/// Per-round diagnostics.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    pub round: usize,
    pub train_metric: Option<f64>,
    pub valid_metric: Option<f64>,
}

fn rmse(truth: &Array1<f64>, pred: &Array1<f64>) -> f64 {
    debug_assert_eq!(truth.len(), pred.len());
    let n = truth.len().max(1) as f64;
    let sse: f64 = truth
        .iter()
        .zip(pred.iter())
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    (sse / n).sqrt()
}

/// A trained ensemble plus the state needed to compose predictions.
pub struct BoostedModel {
    trees: Vec<Box<dyn TreeFunction>>,
    shrinkage: f64,
    /// Number of trees kept for prediction; trees past the best round are
    /// discarded at predict time, not rolled back.
    best_iteration: usize,
    /// Cumulative training score at the best iteration, the offset the
    /// random-effect posterior conditions on.
    train_score: Array1<f64>,
    history: Vec<RoundRecord>,
    fit_summaries: Vec<FitSummary>,
}

impl std::fmt::Debug for BoostedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoostedModel")
            .field("n_trees", &self.trees.len())
            .field("shrinkage", &self.shrinkage)
            .field("best_iteration", &self.best_iteration)
            .field("train_score", &self.train_score)
            .field("history", &self.history)
            .field("fit_summaries", &self.fit_summaries)
            .finish()
    }
}

impl BoostedModel {
    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    /// Covariance-optimization summaries collected over the cadenced re-fits.
    pub fn fit_summaries(&self) -> &[FitSummary] {
        &self.fit_summaries
    }

    /// Fixed-effect (tree ensemble) prediction, capped at the best iteration.
    pub fn predict_fixed(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        let mut score = Array1::<f64>::zeros(x.nrows());
        for tree in self.trees.iter().take(self.best_iteration) {
            score = score + tree.predict(x) * self.shrinkage;
        }
        score
    }

    /// Composed prediction: fixed effect plus random-effect posterior at the
    /// query inputs, conditioned on the training residual at the best round.
    pub fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        re_model: &mut RandomEffectsModel,
        y_train: &Array1<f64>,
        inputs: &[ComponentInput],
        predict_covariance: bool,
    ) -> Result<PredictionOutput, RemError> {
        let fixed = self.predict_fixed(x);
        let random = re_model.predict(y_train, &self.train_score, inputs, predict_covariance)?;
        Ok(PredictionOutput { fixed, random })
    }
}

/// Run the combined boosting loop.
///
/// Each round: (1) gradient/Hessian of the correlated-noise loss through the
/// random-effects model, (2) one tree from the external learner, (3) score
/// update with shrinkage, (4) on the configured cadence, covariance
/// re-optimization against the updated residual.
pub fn train(
    x: &Array2<f64>,
    y: &Array1<f64>,
    re_model: &mut RandomEffectsModel,
    learner: &mut dyn TreeLearner,
    config: &BoostingConfig,
    validation: Option<&ValidationSet>,
) -> Result<BoostedModel, RemError> {
    config.validate()?;
    let n = y.len();
    if x.nrows() != n {
        return Err(RemError::InvalidInput(format!(
            "feature matrix has {} rows, y has {n} entries",
            x.nrows()
        )));
    }
    if re_model.n_samples() != n {
        return Err(RemError::InvalidInput(format!(
            "random-effects model covers {} samples, y has {n} entries",
            re_model.n_samples()
        )));
    }
    if let Some(v) = validation {
        if v.x.nrows() != v.y.len() {
            return Err(RemError::InvalidInput(format!(
                "validation features have {} rows, validation y has {}",
                v.x.nrows(),
                v.y.len()
            )));
        }
        if v.x.ncols() != x.ncols() {
            return Err(RemError::InvalidInput(format!(
                "validation features have {} columns, training has {}",
                v.x.ncols(),
                x.ncols()
            )));
        }
    }

    let mut score = Array1::<f64>::zeros(n);
    let mut fit_summaries = vec![re_model.fit(y, &score)?];

    let mut trees: Vec<Box<dyn TreeFunction>> = Vec::with_capacity(config.num_rounds);
    let mut history = Vec::with_capacity(config.num_rounds);
    let mut valid_score = validation.map(|v| Array1::<f64>::zeros(v.y.len()));

    let mut best_metric = f64::INFINITY;
    let mut best_round = 0usize;
    let mut best_score = score.clone();
    let mut rounds_since_best = 0usize;

    for round in 1..=config.num_rounds {
        let (grad, hess) = re_model.compute_grad_hess(y, &score)?;
        let tree = learner.fit_tree(x.view(), &grad, &hess)?;

        let contrib = tree.predict(x.view());
        score = score + contrib * config.shrinkage;

        if round % config.re_fit_cadence == 0 {
            fit_summaries.push(re_model.fit(y, &score)?);
        }

        let train_metric = config.evaluate_training_metric.then(|| rmse(y, &score));

        let valid_metric = match (validation, valid_score.as_mut()) {
            (Some(v), Some(vscore)) => {
                *vscore = vscore.clone() + tree.predict(v.x.view()) * config.shrinkage;
                let metric = if config.use_re_model_for_validation {
                    let posterior = re_model.predict(y, &score, &v.inputs, false)?;
                    let composed = vscore.clone() + posterior.mean;
                    rmse(&v.y, &composed)
                } else {
                    rmse(&v.y, vscore)
                };
                Some(metric)
            }
            _ => None,
        };

        trees.push(tree);
        history.push(RoundRecord {
            round,
            train_metric,
            valid_metric,
        });

        if let Some(metric) = valid_metric {
            if metric < best_metric {
                best_metric = metric;
                best_round = round;
                best_score = score.clone();
                rounds_since_best = 0;
            } else {
                rounds_since_best += 1;
            }
            if let Some(patience) = config.early_stopping_rounds {
                if rounds_since_best >= patience {
                    log::info!(
                        "early stopping at round {round}: no held-out improvement for \
                        {patience} rounds (best round {best_round}, metric {best_metric:.6})"
                    );
                    break;
                }
            }
        }
    }

    let (best_iteration, train_score) = if validation.is_some() && best_round > 0 {
        (best_round, best_score)
    } else {
        (trees.len(), score)
    };

    Ok(BoostedModel {
        trees,
        shrinkage: config.shrinkage,
        best_iteration,
        train_score,
        history,
        fit_summaries,
    })
}

/// Cross-validation result: one held-out score per fold plus the mean.
#[derive(Debug, Clone)]
pub struct CvResult {
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
}

/// K-fold cross-validation with independent models per fold.
///
/// Folds are assigned round-robin, so they are disjoint by construction;
/// each fold builds its own random-effects model and learner, and the folds
/// communicate nothing but their final score. Fold fan-out runs on rayon.
pub fn cross_validate<L, F>(
    x: &Array2<f64>,
    y: &Array1<f64>,
    specs: &[ComponentSpec],
    n_folds: usize,
    config: &BoostingConfig,
    optimizer: &OptimizerConfig,
    make_learner: F,
) -> Result<CvResult, RemError>
where
    L: TreeLearner,
    F: Fn() -> L + Sync,
{
    config.validate()?;
    optimizer.validate()?;
    let n = y.len();
    if n_folds < 2 || n_folds > n {
        return Err(RemError::InvalidParameter(format!(
            "n_folds must lie in [2, {n}], got {n_folds}"
        )));
    }

    let folds: Vec<(Vec<usize>, Vec<usize>)> = (0..n_folds)
        .map(|fold| {
            let valid: Vec<usize> = (0..n).filter(|i| i % n_folds == fold).collect();
            let train: Vec<usize> = (0..n).filter(|i| i % n_folds != fold).collect();
            (train, valid)
        })
        .collect();

    let fold_scores: Vec<f64> = folds
        .into_par_iter()
        .map(|(train_idx, valid_idx)| -> Result<f64, RemError> {
            let x_train = select_rows(x, &train_idx);
            let y_train = Array1::from_iter(train_idx.iter().map(|&i| y[i]));
            let x_valid = select_rows(x, &valid_idx);
            let y_valid = Array1::from_iter(valid_idx.iter().map(|&i| y[i]));

            let train_specs: Vec<ComponentSpec> =
                specs.iter().map(|s| s.subset(&train_idx)).collect();
            let valid_inputs: Vec<ComponentInput> =
                specs.iter().map(|s| s.to_input(&valid_idx)).collect();

            let mut re_model = RandomEffectsModel::with_config(&train_specs, optimizer.clone())?;
            let mut learner = make_learner();
            let validation = ValidationSet {
                x: x_valid.clone(),
                y: y_valid.clone(),
                inputs: valid_inputs.clone(),
            };
            let model = train(
                &x_train,
                &y_train,
                &mut re_model,
                &mut learner,
                config,
                Some(&validation),
            )?;

            let fixed = model.predict_fixed(x_valid.view());
            let pred = if config.use_re_model_for_validation {
                let posterior =
                    re_model.predict(&y_train, &model.train_score, &valid_inputs, false)?;
                fixed + posterior.mean
            } else {
                fixed
            };
            Ok(rmse(&y_valid, &pred))
        })
        .collect::<Result<Vec<f64>, RemError>>()?;

    let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
    Ok(CvResult {
        fold_scores,
        mean_score,
    })
}

fn select_rows(x: &Array2<f64>, idx: &[usize]) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((idx.len(), x.ncols()));
    for (r, &i) in idx.iter().enumerate() {
        out.row_mut(r).assign(&x.row(i));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_conflict_between_re_validation_and_training_metric() {
        let config = BoostingConfig {
            use_re_model_for_validation: true,
            evaluate_training_metric: true,
            ..BoostingConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RemError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn config_rejects_degenerate_values() {
        for config in [
            BoostingConfig {
                num_rounds: 0,
                ..BoostingConfig::default()
            },
            BoostingConfig {
                shrinkage: 0.0,
                ..BoostingConfig::default()
            },
            BoostingConfig {
                re_fit_cadence: 0,
                ..BoostingConfig::default()
            },
        ] {
            assert!(matches!(
                config.validate(),
                Err(RemError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn rmse_of_identical_vectors_is_zero() {
        let a = Array1::from(vec![1.0, -2.0, 3.0]);
        assert_eq!(rmse(&a, &a), 0.0);
    }
}
