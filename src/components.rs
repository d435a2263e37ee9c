//! Covariance components: the individual random-effect terms.
//!
//! A component is either a Gaussian-process kernel over a coordinate matrix
//! or a grouped (categorical) effect, optionally carrying a random-slope
//! covariate. Components are a closed enum with a small fixed operation set:
//! assemble their covariance contribution, assemble its per-parameter
//! gradient, and build cross-covariances against new inputs. New kernel
//! types are added as new `KernelKind` variants, not new trait impls.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::RemError;

/// Stationary correlation functions k(d; rho), monotone-decreasing in d.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    Exponential,
    SquaredExponential,
    Matern32,
}

impl KernelKind {
    /// Correlation at distance `d` for range `range`.
    #[inline]
    pub fn correlation(&self, d: f64, range: f64) -> f64 {
        match self {
            KernelKind::Exponential => (-d / range).exp(),
            KernelKind::SquaredExponential => {
                let u = d / range;
                (-u * u).exp()
            }
            KernelKind::Matern32 => {
                let u = 3.0_f64.sqrt() * d / range;
                (1.0 + u) * (-u).exp()
            }
        }
    }

    /// d/d(range) of `correlation(d, range)`.
    #[inline]
    pub fn range_derivative(&self, d: f64, range: f64) -> f64 {
        match self {
            KernelKind::Exponential => (-d / range).exp() * d / (range * range),
            KernelKind::SquaredExponential => {
                let u = d / range;
                (-u * u).exp() * 2.0 * d * d / (range * range * range)
            }
            KernelKind::Matern32 => {
                let u = 3.0_f64.sqrt() * d / range;
                u * u * (-u).exp() / range
            }
        }
    }
}

/// User-facing specification of one random-effect term over the full sample.
///
/// Specs are row-subsettable so cross-validation folds can carve out
/// independent components without touching the covariance algebra.
#[derive(Debug, Clone)]
pub enum ComponentSpec {
    Kernel {
        kind: KernelKind,
        /// One row per sample, one column per coordinate dimension.
        coords: Array2<f64>,
    },
    Grouped {
        /// One key per sample; distinct keys define the effect levels.
        keys: Vec<String>,
        /// Optional random-slope covariate, one value per sample.
        slope: Option<Array1<f64>>,
    },
}

impl ComponentSpec {
    pub fn n_samples(&self) -> usize {
        match self {
            ComponentSpec::Kernel { coords, .. } => coords.nrows(),
            ComponentSpec::Grouped { keys, .. } => keys.len(),
        }
    }

    /// Restriction of this spec to the given sample rows.
    pub fn subset(&self, idx: &[usize]) -> ComponentSpec {
        match self {
            ComponentSpec::Kernel { kind, coords } => {
                let mut sub = Array2::<f64>::zeros((idx.len(), coords.ncols()));
                for (r, &i) in idx.iter().enumerate() {
                    sub.row_mut(r).assign(&coords.row(i));
                }
                ComponentSpec::Kernel { kind: *kind, coords: sub }
            }
            ComponentSpec::Grouped { keys, slope } => ComponentSpec::Grouped {
                keys: idx.iter().map(|&i| keys[i].clone()).collect(),
                slope: slope
                    .as_ref()
                    .map(|s| Array1::from_iter(idx.iter().map(|&i| s[i]))),
            },
        }
    }

    /// The prediction-side view of the same rows: what `REModel::predict`
    /// consumes for held-out data.
    pub fn to_input(&self, idx: &[usize]) -> ComponentInput {
        match self.subset(idx) {
            ComponentSpec::Kernel { coords, .. } => ComponentInput::Coords(coords),
            ComponentSpec::Grouped { keys, slope } => ComponentInput::Groups { keys, slope },
        }
    }
}

/// Combine two grouping key vectors into nested keys (`inner` within `outer`).
///
/// Crossed structures need no helper: add the factors as separate components.
pub fn combine_nested_keys<S1: AsRef<str>, S2: AsRef<str>>(
    outer: &[S1],
    inner: &[S2],
) -> Result<Vec<String>, RemError> {
    if outer.len() != inner.len() {
        return Err(RemError::InvalidInput(format!(
            "nested grouping factors must have equal length ({} vs {})",
            outer.len(),
            inner.len()
        )));
    }
    Ok(outer
        .iter()
        .zip(inner.iter())
        .map(|(o, i)| format!("{}/{}", o.as_ref(), i.as_ref()))
        .collect())
}

/// New-data inputs for prediction, one entry per component, in component order.
#[derive(Debug, Clone)]
pub enum ComponentInput {
    Coords(Array2<f64>),
    Groups {
        keys: Vec<String>,
        slope: Option<Array1<f64>>,
    },
}

impl ComponentInput {
    pub fn n_samples(&self) -> usize {
        match self {
            ComponentInput::Coords(c) => c.nrows(),
            ComponentInput::Groups { keys, .. } => keys.len(),
        }
    }
}

/// A validated kernel component with precomputed pairwise training distances.
#[derive(Debug, Clone)]
pub struct KernelComponent {
    kind: KernelKind,
    coords: Array2<f64>,
    dists: Array2<f64>,
}

fn euclidean(a: ndarray::ArrayView1<'_, f64>, b: ndarray::ArrayView1<'_, f64>) -> f64 {
    let mut acc = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let delta = x - y;
        acc += delta * delta;
    }
    acc.sqrt()
}

impl KernelComponent {
    pub fn new(kind: KernelKind, coords: Array2<f64>) -> Result<Self, RemError> {
        if coords.nrows() == 0 || coords.ncols() == 0 {
            return Err(RemError::InvalidParameter(
                "kernel component needs a non-empty coordinate matrix".to_string(),
            ));
        }
        if !coords.iter().all(|v| v.is_finite()) {
            return Err(RemError::InvalidParameter(
                "kernel coordinates must be finite".to_string(),
            ));
        }
        let n = coords.nrows();
        let mut dists = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in (i + 1)..n {
                let d = euclidean(coords.row(i), coords.row(j));
                dists[[i, j]] = d;
                dists[[j, i]] = d;
            }
        }
        Ok(Self { kind, coords, dists })
    }

    /// Median nonzero pairwise distance; seed for the range parameter.
    fn distance_scale(&self) -> f64 {
        let n = self.dists.nrows();
        let mut ds: Vec<f64> = Vec::with_capacity(n * (n - 1) / 2);
        for i in 0..n {
            for j in (i + 1)..n {
                if self.dists[[i, j]] > 0.0 {
                    ds.push(self.dists[[i, j]]);
                }
            }
        }
        if ds.is_empty() {
            return 1.0;
        }
        ds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        ds[ds.len() / 2]
    }
}

/// A validated grouped (categorical) random effect.
///
/// Stores the level index of every sample plus the key -> level map used to
/// align new data with the training levels. A random slope scales each
/// sample's loading on its level.
#[derive(Debug, Clone)]
pub struct GroupedComponent {
    level_of: Vec<usize>,
    level_index: HashMap<String, usize>,
    n_levels: usize,
    slope: Option<Array1<f64>>,
}

impl GroupedComponent {
    pub fn new(keys: &[String], slope: Option<Array1<f64>>) -> Result<Self, RemError> {
        if keys.is_empty() {
            return Err(RemError::InvalidParameter(
                "grouped component needs at least one sample".to_string(),
            ));
        }
        if let Some(s) = &slope {
            if s.len() != keys.len() {
                return Err(RemError::InvalidParameter(format!(
                    "random-slope covariate length {} does not match {} samples",
                    s.len(),
                    keys.len()
                )));
            }
            if !s.iter().all(|v| v.is_finite()) {
                return Err(RemError::InvalidParameter(
                    "random-slope covariate must be finite".to_string(),
                ));
            }
        }
        let mut level_index: HashMap<String, usize> = HashMap::new();
        let mut level_of = Vec::with_capacity(keys.len());
        for key in keys {
            let next = level_index.len();
            let idx = *level_index.entry(key.clone()).or_insert(next);
            level_of.push(idx);
        }
        let n_levels = level_index.len();
        if n_levels < 2 {
            return Err(RemError::InvalidParameter(format!(
                "grouped component needs at least 2 distinct levels, found {n_levels}"
            )));
        }
        Ok(Self {
            level_of,
            level_index,
            n_levels,
            slope,
        })
    }

    pub fn n_levels(&self) -> usize {
        self.n_levels
    }

    #[inline]
    fn loading(&self, i: usize) -> f64 {
        self.slope.as_ref().map_or(1.0, |s| s[i])
    }

    /// Training level index for a new-data key, if the level was observed.
    fn level_for_key(&self, key: &str) -> Option<usize> {
        self.level_index.get(key).copied()
    }
}

/// One structured random-effect term.
#[derive(Debug, Clone)]
pub enum CovarianceComponent {
    Kernel(KernelComponent),
    Grouped(GroupedComponent),
}

impl CovarianceComponent {
    pub fn from_spec(spec: &ComponentSpec) -> Result<Self, RemError> {
        match spec {
            ComponentSpec::Kernel { kind, coords } => Ok(CovarianceComponent::Kernel(
                KernelComponent::new(*kind, coords.clone())?,
            )),
            ComponentSpec::Grouped { keys, slope } => Ok(CovarianceComponent::Grouped(
                GroupedComponent::new(keys, slope.clone())?,
            )),
        }
    }

    pub fn n_samples(&self) -> usize {
        match self {
            CovarianceComponent::Kernel(k) => k.coords.nrows(),
            CovarianceComponent::Grouped(g) => g.level_of.len(),
        }
    }

    /// Number of hyperparameters this component contributes to theta.
    pub fn n_params(&self) -> usize {
        match self {
            CovarianceComponent::Kernel(_) => 2,
            CovarianceComponent::Grouped(_) => 1,
        }
    }

    /// Starting values for this component's theta slice.
    pub fn default_params(&self) -> Vec<f64> {
        match self {
            CovarianceComponent::Kernel(k) => vec![1.0, k.distance_scale()],
            CovarianceComponent::Grouped(_) => vec![1.0],
        }
    }

    pub fn validate_params(&self, params: &[f64]) -> Result<(), RemError> {
        debug_assert_eq!(params.len(), self.n_params());
        match self {
            CovarianceComponent::Kernel(_) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                if !(sigma1_sq > 0.0 && sigma1_sq.is_finite()) {
                    return Err(RemError::InvalidParameter(format!(
                        "kernel marginal variance must be positive and finite, got {sigma1_sq}"
                    )));
                }
                if !(range > 0.0 && range.is_finite()) {
                    return Err(RemError::InvalidParameter(format!(
                        "kernel range must be positive and finite, got {range}"
                    )));
                }
            }
            CovarianceComponent::Grouped(_) => {
                let var = params[0];
                if !(var > 0.0 && var.is_finite()) {
                    return Err(RemError::InvalidParameter(format!(
                        "grouped-effect variance must be positive and finite, got {var}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Add `Z_k Cov_k(theta_k) Z_k^T` to `sigma` (full training matrix).
    pub fn add_covariance(&self, params: &[f64], sigma: &mut Array2<f64>) {
        match self {
            CovarianceComponent::Kernel(k) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                let n = k.dists.nrows();
                for i in 0..n {
                    for j in 0..n {
                        sigma[[i, j]] += sigma1_sq * k.kind.correlation(k.dists[[i, j]], range);
                    }
                }
            }
            CovarianceComponent::Grouped(g) => {
                let var = params[0];
                let n = g.level_of.len();
                for i in 0..n {
                    for j in 0..n {
                        if g.level_of[i] == g.level_of[j] {
                            sigma[[i, j]] += var * g.loading(i) * g.loading(j);
                        }
                    }
                }
            }
        }
    }

    /// Add the derivative of this component's covariance with respect to its
    /// `local_j`-th parameter (natural scale) to `out`.
    pub fn add_covariance_grad(&self, params: &[f64], local_j: usize, out: &mut Array2<f64>) {
        match self {
            CovarianceComponent::Kernel(k) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                let n = k.dists.nrows();
                match local_j {
                    0 => {
                        for i in 0..n {
                            for j in 0..n {
                                out[[i, j]] += k.kind.correlation(k.dists[[i, j]], range);
                            }
                        }
                    }
                    1 => {
                        for i in 0..n {
                            for j in 0..n {
                                out[[i, j]] +=
                                    sigma1_sq * k.kind.range_derivative(k.dists[[i, j]], range);
                            }
                        }
                    }
                    _ => unreachable!("kernel components have exactly 2 parameters"),
                }
            }
            CovarianceComponent::Grouped(g) => {
                debug_assert_eq!(local_j, 0);
                let n = g.level_of.len();
                for i in 0..n {
                    for j in 0..n {
                        if g.level_of[i] == g.level_of[j] {
                            out[[i, j]] += g.loading(i) * g.loading(j);
                        }
                    }
                }
            }
        }
    }

    /// Restriction of `add_covariance` to the sample subset `idx` (block path).
    pub fn add_covariance_on(&self, params: &[f64], idx: &[usize], sigma: &mut Array2<f64>) {
        match self {
            CovarianceComponent::Kernel(k) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                for (r, &i) in idx.iter().enumerate() {
                    for (c, &j) in idx.iter().enumerate() {
                        sigma[[r, c]] += sigma1_sq * k.kind.correlation(k.dists[[i, j]], range);
                    }
                }
            }
            CovarianceComponent::Grouped(g) => {
                let var = params[0];
                for (r, &i) in idx.iter().enumerate() {
                    for (c, &j) in idx.iter().enumerate() {
                        if g.level_of[i] == g.level_of[j] {
                            sigma[[r, c]] += var * g.loading(i) * g.loading(j);
                        }
                    }
                }
            }
        }
    }

    /// Restriction of `add_covariance_grad` to the sample subset `idx`.
    pub fn add_covariance_grad_on(
        &self,
        params: &[f64],
        local_j: usize,
        idx: &[usize],
        out: &mut Array2<f64>,
    ) {
        match self {
            CovarianceComponent::Kernel(k) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                match local_j {
                    0 => {
                        for (r, &i) in idx.iter().enumerate() {
                            for (c, &j) in idx.iter().enumerate() {
                                out[[r, c]] += k.kind.correlation(k.dists[[i, j]], range);
                            }
                        }
                    }
                    1 => {
                        for (r, &i) in idx.iter().enumerate() {
                            for (c, &j) in idx.iter().enumerate() {
                                out[[r, c]] +=
                                    sigma1_sq * k.kind.range_derivative(k.dists[[i, j]], range);
                            }
                        }
                    }
                    _ => unreachable!("kernel components have exactly 2 parameters"),
                }
            }
            CovarianceComponent::Grouped(g) => {
                debug_assert_eq!(local_j, 0);
                for (r, &i) in idx.iter().enumerate() {
                    for (c, &j) in idx.iter().enumerate() {
                        if g.level_of[i] == g.level_of[j] {
                            out[[r, c]] += g.loading(i) * g.loading(j);
                        }
                    }
                }
            }
        }
    }

    /// Add the cross-covariance between new inputs (rows) and the training
    /// samples (columns) to `out` (n_new x n_train).
    ///
    /// New group levels unseen in training contribute nothing here: their
    /// posterior mean is the prior mean, zero.
    pub fn add_cross_covariance(
        &self,
        params: &[f64],
        input: &ComponentInput,
        out: &mut Array2<f64>,
    ) -> Result<(), RemError> {
        match (self, input) {
            (CovarianceComponent::Kernel(k), ComponentInput::Coords(new_coords)) => {
                if new_coords.ncols() != k.coords.ncols() {
                    return Err(RemError::InvalidInput(format!(
                        "prediction coordinates have {} columns, training has {}",
                        new_coords.ncols(),
                        k.coords.ncols()
                    )));
                }
                let (sigma1_sq, range) = (params[0], params[1]);
                for r in 0..new_coords.nrows() {
                    for j in 0..k.coords.nrows() {
                        let d = euclidean(new_coords.row(r), k.coords.row(j));
                        out[[r, j]] += sigma1_sq * k.kind.correlation(d, range);
                    }
                }
                Ok(())
            }
            (CovarianceComponent::Grouped(g), ComponentInput::Groups { keys, slope }) => {
                if let Some(s) = slope {
                    if s.len() != keys.len() {
                        return Err(RemError::InvalidInput(
                            "prediction slope length does not match prediction keys".to_string(),
                        ));
                    }
                }
                let var = params[0];
                for (r, key) in keys.iter().enumerate() {
                    let Some(level) = g.level_for_key(key) else {
                        continue;
                    };
                    let z_new = slope.as_ref().map_or(1.0, |s| s[r]);
                    for (j, &lj) in g.level_of.iter().enumerate() {
                        if lj == level {
                            out[[r, j]] += var * z_new * g.loading(j);
                        }
                    }
                }
                Ok(())
            }
            (CovarianceComponent::Kernel(_), _) => Err(RemError::InvalidInput(
                "kernel component expects coordinate inputs for prediction".to_string(),
            )),
            (CovarianceComponent::Grouped(_), _) => Err(RemError::InvalidInput(
                "grouped component expects group-key inputs for prediction".to_string(),
            )),
        }
    }

    /// Add this component's prior covariance among the new inputs to `out`
    /// (n_new x n_new). Unseen levels still correlate with themselves.
    pub fn add_prior_covariance(
        &self,
        params: &[f64],
        input: &ComponentInput,
        out: &mut Array2<f64>,
    ) -> Result<(), RemError> {
        match (self, input) {
            (CovarianceComponent::Kernel(k), ComponentInput::Coords(new_coords)) => {
                let (sigma1_sq, range) = (params[0], params[1]);
                let m = new_coords.nrows();
                for i in 0..m {
                    for j in 0..m {
                        let d = euclidean(new_coords.row(i), new_coords.row(j));
                        out[[i, j]] += sigma1_sq * k.kind.correlation(d, range);
                    }
                }
                Ok(())
            }
            (CovarianceComponent::Grouped(_), ComponentInput::Groups { keys, slope }) => {
                let var = params[0];
                let m = keys.len();
                for i in 0..m {
                    let zi = slope.as_ref().map_or(1.0, |s| s[i]);
                    for j in 0..m {
                        if keys[i] == keys[j] {
                            let zj = slope.as_ref().map_or(1.0, |s| s[j]);
                            out[[i, j]] += var * zi * zj;
                        }
                    }
                }
                Ok(())
            }
            (CovarianceComponent::Kernel(_), _) => Err(RemError::InvalidInput(
                "kernel component expects coordinate inputs for prediction".to_string(),
            )),
            (CovarianceComponent::Grouped(_), _) => Err(RemError::InvalidInput(
                "grouped component expects group-key inputs for prediction".to_string(),
            )),
        }
    }

    /// Union all samples sharing a level, for the block partition of the
    /// grouped-only factorization path. Kernel components have no block
    /// structure to contribute.
    pub fn union_levels(&self, uf: &mut UnionFind) {
        if let CovarianceComponent::Grouped(g) = self {
            let mut first_of_level: Vec<Option<usize>> = vec![None; g.n_levels];
            for (i, &level) in g.level_of.iter().enumerate() {
                match first_of_level[level] {
                    Some(first) => uf.union(first, i),
                    None => first_of_level[level] = Some(i),
                }
            }
        }
    }

    pub fn is_grouped(&self) -> bool {
        matches!(self, CovarianceComponent::Grouped(_))
    }
}

/// Path-compressing union-find over sample indices.
pub struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = i;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    /// Connected components as sorted index lists, ordered by first member.
    pub fn components(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..n {
            let root = self.find(i);
            groups.entry(root).or_default().push(i);
        }
        let mut out: Vec<Vec<usize>> = groups.into_values().collect();
        out.sort_by_key(|g| g[0]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn keys(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn kernel_correlation_is_one_at_zero_distance() {
        for kind in [
            KernelKind::Exponential,
            KernelKind::SquaredExponential,
            KernelKind::Matern32,
        ] {
            assert!((kind.correlation(0.0, 0.7) - 1.0).abs() < 1e-15);
        }
    }

    #[test]
    fn kernel_range_derivative_matches_finite_difference() {
        let d = 0.83;
        let range = 0.41;
        let h = 1e-7;
        for kind in [
            KernelKind::Exponential,
            KernelKind::SquaredExponential,
            KernelKind::Matern32,
        ] {
            let fd = (kind.correlation(d, range + h) - kind.correlation(d, range - h)) / (2.0 * h);
            let analytic = kind.range_derivative(d, range);
            assert!(
                (fd - analytic).abs() < 1e-6,
                "{kind:?}: fd {fd} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn grouped_component_rejects_single_level() {
        let err = GroupedComponent::new(&keys(&["a", "a", "a"]), None).unwrap_err();
        assert!(matches!(err, RemError::InvalidParameter(_)));
    }

    #[test]
    fn grouped_covariance_is_block_structured() {
        let g = GroupedComponent::new(&keys(&["a", "b", "a"]), None).unwrap();
        let comp = CovarianceComponent::Grouped(g);
        let mut sigma = Array2::<f64>::zeros((3, 3));
        comp.add_covariance(&[2.0], &mut sigma);
        let expected = array![[2.0, 0.0, 2.0], [0.0, 2.0, 0.0], [2.0, 0.0, 2.0]];
        assert_eq!(sigma, expected);
    }

    #[test]
    fn random_slope_scales_loadings() {
        let g = GroupedComponent::new(
            &keys(&["a", "a", "b"]),
            Some(array![2.0, 3.0, 1.0]),
        )
        .unwrap();
        let comp = CovarianceComponent::Grouped(g);
        let mut sigma = Array2::<f64>::zeros((3, 3));
        comp.add_covariance(&[1.0], &mut sigma);
        assert!((sigma[[0, 1]] - 6.0).abs() < 1e-15);
        assert!((sigma[[0, 0]] - 4.0).abs() < 1e-15);
        assert!((sigma[[2, 2]] - 1.0).abs() < 1e-15);
        assert_eq!(sigma[[0, 2]], 0.0);
    }

    #[test]
    fn nested_keys_separate_inner_levels_across_outer_levels() {
        let nested = combine_nested_keys(&["s1", "s1", "s2"], &["g1", "g2", "g1"]).unwrap();
        assert_eq!(nested, vec!["s1/g1", "s1/g2", "s2/g1"]);
        // g1 inside s1 and g1 inside s2 are distinct levels.
        let g = GroupedComponent::new(&nested, None).unwrap();
        assert_eq!(g.n_levels(), 3);
    }

    #[test]
    fn cross_covariance_ignores_unseen_levels() {
        let comp = CovarianceComponent::Grouped(
            GroupedComponent::new(&keys(&["a", "b"]), None).unwrap(),
        );
        let mut cross = Array2::<f64>::zeros((2, 2));
        comp.add_cross_covariance(
            &[1.5],
            &ComponentInput::Groups {
                keys: keys(&["a", "zzz"]),
                slope: None,
            },
            &mut cross,
        )
        .unwrap();
        assert!((cross[[0, 0]] - 1.5).abs() < 1e-15);
        assert_eq!(cross.row(1).sum(), 0.0);
    }

    #[test]
    fn union_find_partitions_by_shared_levels() {
        let comp = CovarianceComponent::Grouped(
            GroupedComponent::new(&keys(&["a", "b", "a", "c", "b"]), None).unwrap(),
        );
        let mut uf = UnionFind::new(5);
        comp.union_levels(&mut uf);
        let blocks = uf.components();
        assert_eq!(blocks, vec![vec![0, 2], vec![1, 4], vec![3]]);
    }
}
