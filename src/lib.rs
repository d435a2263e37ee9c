//! remboost: tree boosting combined with latent-Gaussian random effects.
//!
//! Fits models of the form `y = F(X) + Zb + e`, where `F` is a tree ensemble
//! learned by an external engine, `Zb` is a structured random effect
//! (Gaussian-process kernels over coordinates and/or grouped effects) with
//! estimated covariance hyperparameters, and `e` is independent noise. The
//! crate owns the covariance engine and its coupling protocol with the
//! boosting loop: hyperparameter optimization, the per-round
//! gradient/Hessian contract, and posterior prediction of the random-effect
//! part at new inputs.

pub mod boost;
pub mod components;
pub mod covariance;
pub mod faer_ndarray;
pub mod likelihood;
pub mod model;
pub mod optimizer;
pub mod predict;
pub mod types;

pub use boost::{
    cross_validate, train, BoostedModel, BoostingConfig, CvResult, RoundRecord, TreeFunction,
    TreeLearner, ValidationSet,
};
pub use components::{
    combine_nested_keys, ComponentInput, ComponentSpec, CovarianceComponent, KernelKind,
};
pub use covariance::CompositeCovarianceModel;
pub use likelihood::SigmaFactor;
pub use model::{ModelSummary, RandomEffectsModel};
pub use optimizer::{FitSummary, OptimizerOutcome, TraceRecord};
pub use predict::{se_from_covariance, PredictionOutput, RandomEffectPrediction};
pub use types::{CovParams, LogCovParams, OptimizerConfig, OptimizerKind, RemError};
