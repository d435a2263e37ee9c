//! The composite covariance model: sum of component covariances plus noise.
//!
//! Owns the component list and the hyperparameter vector theta, and is the
//! only place Sigma(theta) = sum_k Z_k Cov_k Z_k^T + sigma^2 I (+ jitter) is
//! assembled. A version counter ticks on every parameter or structure change
//! so downstream factorization caches can invalidate by version mismatch.

use ndarray::Array2;

use crate::components::{ComponentSpec, CovarianceComponent, UnionFind};
use crate::types::{CovParams, LogCovParams, RemError};

/// Fixed diagonal epsilon guaranteeing factorizability of the assembled
/// covariance even with duplicate kernel coordinates.
pub const JITTER: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
enum ParamSlot {
    Noise,
    Component { index: usize, local: usize },
}

pub struct CompositeCovarianceModel {
    components: Vec<CovarianceComponent>,
    params: CovParams,
    layout: Vec<ParamSlot>,
    n: usize,
    version: u64,
}

impl CompositeCovarianceModel {
    pub fn from_specs(specs: &[ComponentSpec]) -> Result<Self, RemError> {
        if specs.is_empty() {
            return Err(RemError::InvalidParameter(
                "covariance model needs at least one component".to_string(),
            ));
        }
        let components: Vec<CovarianceComponent> = specs
            .iter()
            .map(CovarianceComponent::from_spec)
            .collect::<Result<_, _>>()?;
        let n = components[0].n_samples();
        for (k, comp) in components.iter().enumerate() {
            if comp.n_samples() != n {
                return Err(RemError::InvalidInput(format!(
                    "component {k} covers {} samples, expected {n}",
                    comp.n_samples()
                )));
            }
        }

        let mut model = Self {
            components,
            params: CovParams::new(ndarray::Array1::zeros(0)),
            layout: Vec::new(),
            n,
            version: 0,
        };
        model.rebuild_layout();
        Ok(model)
    }

    /// Recompute the theta layout and reseed parameters with defaults.
    fn rebuild_layout(&mut self) {
        let mut layout = vec![ParamSlot::Noise];
        let mut values = vec![1.0];
        for (index, comp) in self.components.iter().enumerate() {
            for (local, value) in comp.default_params().into_iter().enumerate() {
                layout.push(ParamSlot::Component { index, local });
                values.push(value);
            }
        }
        self.layout = layout;
        self.params = CovParams::new(ndarray::Array1::from(values));
        self.version += 1;
    }

    /// Append a component; theta is reassembled and all caches invalidated.
    pub fn push_component(&mut self, spec: &ComponentSpec) -> Result<(), RemError> {
        let comp = CovarianceComponent::from_spec(spec)?;
        if comp.n_samples() != self.n {
            return Err(RemError::InvalidInput(format!(
                "new component covers {} samples, expected {}",
                comp.n_samples(),
                self.n
            )));
        }
        self.components.push(comp);
        self.rebuild_layout();
        Ok(())
    }

    pub fn n_samples(&self) -> usize {
        self.n
    }

    pub fn n_params(&self) -> usize {
        self.layout.len()
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn components(&self) -> &[CovarianceComponent] {
        &self.components
    }

    pub fn params(&self) -> &CovParams {
        &self.params
    }

    pub fn log_params(&self) -> LogCovParams {
        self.params.ln()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Noise variance sigma^2 (theta slot 0).
    pub fn noise_variance(&self) -> f64 {
        self.params[0]
    }

    fn validate(&self, params: &CovParams) -> Result<(), RemError> {
        if params.len() != self.layout.len() {
            return Err(RemError::InvalidParameter(format!(
                "expected {} covariance parameters, got {}",
                self.layout.len(),
                params.len()
            )));
        }
        if !(params[0] > 0.0 && params[0].is_finite()) {
            return Err(RemError::InvalidParameter(format!(
                "noise variance must be positive and finite, got {}",
                params[0]
            )));
        }
        for (index, comp) in self.components.iter().enumerate() {
            let slice = self.component_params_of(params, index);
            comp.validate_params(&slice)?;
        }
        Ok(())
    }

    pub fn set_params(&mut self, params: CovParams) -> Result<(), RemError> {
        self.validate(&params)?;
        self.params = params;
        self.version += 1;
        Ok(())
    }

    /// Set theta from log-space coordinates (the optimizer's move).
    pub fn set_log_params(&mut self, log_params: &LogCovParams) -> Result<(), RemError> {
        if !log_params.iter().all(|v| v.is_finite()) {
            return Err(RemError::InvalidParameter(
                "log covariance parameters must be finite".to_string(),
            ));
        }
        self.set_params(log_params.exp())
    }

    fn component_params_of(&self, params: &CovParams, index: usize) -> Vec<f64> {
        self.layout
            .iter()
            .zip(params.iter())
            .filter_map(|(slot, &v)| match slot {
                ParamSlot::Component { index: i, .. } if *i == index => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Current theta slice of component `index` (natural scale).
    pub fn component_params(&self, index: usize) -> Vec<f64> {
        self.component_params_of(&self.params, index)
    }

    /// Assemble the full training covariance Sigma(theta), jitter included.
    pub fn assemble(&self) -> Array2<f64> {
        let mut sigma = Array2::<f64>::zeros((self.n, self.n));
        let noise = self.noise_variance() + JITTER;
        for i in 0..self.n {
            sigma[[i, i]] = noise;
        }
        for (index, comp) in self.components.iter().enumerate() {
            comp.add_covariance(&self.component_params(index), &mut sigma);
        }
        sigma
    }

    /// dSigma/dtheta_j on the natural scale.
    pub fn assemble_grad(&self, j: usize) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.n, self.n));
        match self.layout[j] {
            ParamSlot::Noise => {
                for i in 0..self.n {
                    out[[i, i]] = 1.0;
                }
            }
            ParamSlot::Component { index, local } => {
                self.components[index].add_covariance_grad(
                    &self.component_params(index),
                    local,
                    &mut out,
                );
            }
        }
        out
    }

    /// Sigma restricted to the sample subset `idx`.
    pub fn assemble_on(&self, idx: &[usize]) -> Array2<f64> {
        let m = idx.len();
        let mut sigma = Array2::<f64>::zeros((m, m));
        let noise = self.noise_variance() + JITTER;
        for r in 0..m {
            sigma[[r, r]] = noise;
        }
        for (index, comp) in self.components.iter().enumerate() {
            comp.add_covariance_on(&self.component_params(index), idx, &mut sigma);
        }
        sigma
    }

    /// dSigma/dtheta_j restricted to the sample subset `idx`.
    pub fn assemble_grad_on(&self, j: usize, idx: &[usize]) -> Array2<f64> {
        let m = idx.len();
        let mut out = Array2::<f64>::zeros((m, m));
        match self.layout[j] {
            ParamSlot::Noise => {
                for r in 0..m {
                    out[[r, r]] = 1.0;
                }
            }
            ParamSlot::Component { index, local } => {
                self.components[index].add_covariance_grad_on(
                    &self.component_params(index),
                    local,
                    idx,
                    &mut out,
                );
            }
        }
        out
    }

    /// True when every component is grouped, so Sigma is block-sparse and the
    /// factorization can work block-by-block instead of densely.
    pub fn is_block_sparse(&self) -> bool {
        self.components.iter().all(|c| c.is_grouped())
    }

    /// Partition samples into connected components of the union of all
    /// grouping relations. Only meaningful on the block-sparse path.
    pub fn sample_blocks(&self) -> Vec<Vec<usize>> {
        let mut uf = UnionFind::new(self.n);
        for comp in &self.components {
            comp.union_levels(&mut uf);
        }
        uf.components()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::KernelKind;
    use crate::faer_ndarray::FaerCholesky;
    use faer::Side;
    use ndarray::{array, Array2};

    fn kernel_spec(coords: Array2<f64>) -> ComponentSpec {
        ComponentSpec::Kernel {
            kind: KernelKind::Exponential,
            coords,
        }
    }

    fn grouped_spec(raw: &[&str]) -> ComponentSpec {
        ComponentSpec::Grouped {
            keys: raw.iter().map(|s| s.to_string()).collect(),
            slope: None,
        }
    }

    #[test]
    fn assemble_is_symmetric_and_pd_with_duplicate_coordinates() {
        // Two identical and one near-identical coordinate: the kernel block
        // alone is singular, the noise + jitter diagonal keeps Sigma PD.
        let coords = array![[0.3], [0.3], [0.3 + 1e-13], [0.9]];
        let model = CompositeCovarianceModel::from_specs(&[kernel_spec(coords)]).unwrap();
        let sigma = model.assemble();
        for i in 0..4 {
            for j in 0..4 {
                assert!((sigma[[i, j]] - sigma[[j, i]]).abs() < 1e-15);
            }
        }
        assert!(sigma.cholesky(Side::Lower).is_ok());
    }

    #[test]
    fn sum_of_components_equals_sum_of_individual_assemblies() {
        let coords = array![[0.1], [0.5], [0.9], [0.2]];
        let groups = ["a", "b", "a", "b"];

        let both = CompositeCovarianceModel::from_specs(&[
            kernel_spec(coords.clone()),
            grouped_spec(&groups),
        ])
        .unwrap();
        let kernel_only = CompositeCovarianceModel::from_specs(&[kernel_spec(coords)]).unwrap();
        let grouped_only = CompositeCovarianceModel::from_specs(&[grouped_spec(&groups)]).unwrap();

        // The sum double-counts the shared noise + jitter diagonal once.
        let noise = Array2::<f64>::eye(4) * (both.noise_variance() + JITTER);
        let direct_sum = kernel_only.assemble() + grouped_only.assemble() - noise;

        // Align theta: both models start from the same defaults, so the sum
        // of the individual assemblies must equal the joint assembly.
        let joint = both.assemble();
        for (a, b) in joint.iter().zip(direct_sum.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn set_log_params_bumps_version_and_round_trips() {
        let mut model =
            CompositeCovarianceModel::from_specs(&[grouped_spec(&["a", "b", "a"])]).unwrap();
        let v0 = model.version();
        let log_params = crate::types::LogCovParams::new(array![0.5_f64.ln(), 2.0_f64.ln()]);
        model.set_log_params(&log_params).unwrap();
        assert!(model.version() > v0);
        assert!((model.noise_variance() - 0.5).abs() < 1e-15);
        assert!((model.component_params(0)[0] - 2.0).abs() < 1e-15);
    }

    #[test]
    fn non_finite_log_params_are_rejected() {
        let mut model =
            CompositeCovarianceModel::from_specs(&[grouped_spec(&["a", "b"])]).unwrap();
        let bad = crate::types::LogCovParams::new(array![f64::NAN, 0.0]);
        assert!(matches!(
            model.set_log_params(&bad),
            Err(RemError::InvalidParameter(_))
        ));
    }

    #[test]
    fn grad_layout_covers_noise_and_component_slots() {
        let coords = array![[0.0], [1.0]];
        let model = CompositeCovarianceModel::from_specs(&[
            kernel_spec(coords),
            grouped_spec(&["a", "b"]),
        ])
        .unwrap();
        // noise + (variance, range) + variance
        assert_eq!(model.n_params(), 4);
        let noise_grad = model.assemble_grad(0);
        assert_eq!(noise_grad, Array2::<f64>::eye(2));
    }

    #[test]
    fn blocked_restriction_matches_dense_submatrix() {
        let model = CompositeCovarianceModel::from_specs(&[grouped_spec(&[
            "a", "b", "a", "c", "b", "c",
        ])])
        .unwrap();
        assert!(model.is_block_sparse());
        let dense = model.assemble();
        for block in model.sample_blocks() {
            let sub = model.assemble_on(&block);
            for (r, &i) in block.iter().enumerate() {
                for (c, &j) in block.iter().enumerate() {
                    assert!((sub[[r, c]] - dense[[i, j]]).abs() < 1e-15);
                }
            }
        }
    }
}
