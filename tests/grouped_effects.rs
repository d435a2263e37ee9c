use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use remboost::{
    combine_nested_keys, ComponentInput, ComponentSpec, CompositeCovarianceModel, CovParams,
    OptimizerConfig, RandomEffectsModel, SigmaFactor,
};

fn group_keys(n: usize, group_size: usize) -> Vec<String> {
    (0..n).map(|i| format!("g{}", i / group_size)).collect()
}

/// y_i = b_{group(i)} + e_i with b ~ N(0, group_var), e ~ N(0, noise_var).
fn simulate_grouped(
    n: usize,
    group_size: usize,
    group_var: f64,
    noise_var: f64,
    seed: u64,
) -> (Vec<String>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let keys = group_keys(n, group_size);
    let n_groups = n / group_size + usize::from(n % group_size != 0);
    let group_noise = Normal::new(0.0, group_var.sqrt()).expect("normal params must be valid");
    let effects: Vec<f64> = (0..n_groups).map(|_| group_noise.sample(&mut rng)).collect();
    let obs_noise = Normal::new(0.0, noise_var.sqrt()).expect("normal params must be valid");
    let y = Array1::from_iter((0..n).map(|i| effects[i / group_size] + obs_noise.sample(&mut rng)));
    (keys, y)
}

#[test]
fn grouped_variances_are_recovered_from_simulated_data() {
    let (keys, y) = simulate_grouped(400, 8, 1.0, 0.25, 42);
    let mut model = CompositeCovarianceModel::from_specs(&[ComponentSpec::Grouped {
        keys,
        slope: None,
    }])
    .unwrap();

    let summary =
        remboost::optimizer::optimize(&mut model, &y, &OptimizerConfig::fisher_scoring()).unwrap();
    assert!(summary.converged(), "fisher scoring should converge");

    let noise_var = summary.params[0];
    let group_var = summary.params[1];
    assert!(
        (noise_var - 0.25).abs() < 0.15,
        "noise variance estimate {noise_var} too far from 0.25"
    );
    assert!(
        (group_var - 1.0).abs() < 0.6,
        "group variance estimate {group_var} too far from 1.0"
    );
}

#[test]
fn blocked_and_dense_paths_agree_on_the_likelihood() {
    let (keys, y) = simulate_grouped(60, 5, 0.8, 0.2, 7);

    // Grouped-only: factorization takes the blocked path.
    let blocked_model = CompositeCovarianceModel::from_specs(&[ComponentSpec::Grouped {
        keys: keys.clone(),
        slope: None,
    }])
    .unwrap();
    assert!(blocked_model.is_block_sparse());
    assert!(blocked_model.sample_blocks().len() > 1);
    let blocked_ll = SigmaFactor::compute(&blocked_model)
        .unwrap()
        .log_marginal(&y);

    // Adding a kernel with negligible variance forces the dense path while
    // leaving the likelihood essentially unchanged.
    let mut coords = Array2::<f64>::zeros((60, 1));
    for i in 0..60 {
        coords[[i, 0]] = i as f64;
    }
    let mut dense_model = CompositeCovarianceModel::from_specs(&[
        ComponentSpec::Grouped { keys, slope: None },
        ComponentSpec::Kernel {
            kind: remboost::KernelKind::Exponential,
            coords,
        },
    ])
    .unwrap();
    assert!(!dense_model.is_block_sparse());
    dense_model
        .set_params(CovParams::new(ndarray::array![1.0, 1.0, 1e-14, 1.0]))
        .unwrap();
    let dense_ll = SigmaFactor::compute(&dense_model).unwrap().log_marginal(&y);

    assert!(
        (blocked_ll - dense_ll).abs() < 1e-6,
        "blocked {blocked_ll} vs dense {dense_ll}"
    );
}

#[test]
fn boosting_gradient_matches_finite_difference_of_the_loss() {
    let (keys, y) = simulate_grouped(20, 4, 0.5, 0.3, 99);
    let mut model = RandomEffectsModel::new(&[ComponentSpec::Grouped { keys, slope: None }]).unwrap();

    let mut rng = StdRng::seed_from_u64(5);
    let f = Array1::from_iter((0..20).map(|_| rng.gen_range(-0.5..0.5)));
    let (grad, hess) = model.compute_grad_hess(&y, &f).unwrap();

    // Negative marginal log-likelihood as a function of F, evaluated through
    // the factorization directly.
    let neg_ll = |f_try: &Array1<f64>| -> f64 {
        let factor = SigmaFactor::compute(model.covariance()).unwrap();
        -factor.log_marginal(&(&y - f_try))
    };

    let h = 1e-6;
    for i in [0usize, 7, 13, 19] {
        let mut f_plus = f.clone();
        f_plus[i] += h;
        let mut f_minus = f.clone();
        f_minus[i] -= h;
        let fd_grad = (neg_ll(&f_plus) - neg_ll(&f_minus)) / (2.0 * h);
        assert!(
            (fd_grad - grad[i]).abs() < 1e-5,
            "sample {i}: fd {fd_grad} vs analytic {}",
            grad[i]
        );

        // Second differences need a wider step to stay above rounding noise.
        let h2 = 1e-4;
        let mut f_plus2 = f.clone();
        f_plus2[i] += h2;
        let mut f_minus2 = f.clone();
        f_minus2[i] -= h2;
        let fd_hess = (neg_ll(&f_plus2) - 2.0 * neg_ll(&f) + neg_ll(&f_minus2)) / (h2 * h2);
        assert!(
            (fd_hess - hess[i]).abs() < 1e-2 * (1.0 + hess[i].abs()),
            "sample {i}: fd hessian {fd_hess} vs analytic {}",
            hess[i]
        );
    }
}

#[test]
fn posterior_mean_shrinks_group_means_toward_zero() {
    let (keys, y) = simulate_grouped(100, 10, 1.0, 0.25, 4242);
    let mut model = RandomEffectsModel::new(&[ComponentSpec::Grouped {
        keys: keys.clone(),
        slope: None,
    }])
    .unwrap();
    let offset = Array1::<f64>::zeros(100);
    model.fit(&y, &offset).unwrap();

    let inputs = vec![ComponentInput::Groups {
        keys: keys.clone(),
        slope: None,
    }];
    let pred = model.predict(&y, &offset, &inputs, false).unwrap();

    // Per-group: posterior mean lies between zero and the raw group mean,
    // on the same side.
    for g in 0..10 {
        let members: Vec<usize> = (0..100).filter(|&i| keys[i] == format!("g{g}")).collect();
        let raw_mean: f64 = members.iter().map(|&i| y[i]).sum::<f64>() / members.len() as f64;
        let post = pred.mean[members[0]];
        assert!(
            post.abs() <= raw_mean.abs() + 1e-9,
            "group {g}: posterior {post} exceeds raw mean {raw_mean}"
        );
        if raw_mean.abs() > 0.2 {
            assert_eq!(post.signum(), raw_mean.signum(), "group {g} flipped sign");
        }
    }
}

#[test]
fn nested_grouping_creates_levels_within_outer_levels() {
    let outer: Vec<String> = ["s1", "s1", "s1", "s2", "s2", "s2"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let inner: Vec<String> = ["a", "a", "b", "a", "b", "b"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let nested = combine_nested_keys(&outer, &inner).unwrap();

    let model = CompositeCovarianceModel::from_specs(&[
        ComponentSpec::Grouped {
            keys: outer,
            slope: None,
        },
        ComponentSpec::Grouped {
            keys: nested,
            slope: None,
        },
    ])
    .unwrap();

    let sigma = model.assemble();
    // Samples 0 and 1 share outer AND nested levels; 0 and 2 share only the
    // outer level; 0 and 3 share nothing.
    assert!(sigma[[0, 1]] > sigma[[0, 2]]);
    assert!(sigma[[0, 2]] > sigma[[0, 3]]);
    assert_eq!(sigma[[0, 3]], 0.0);
}

#[test]
fn random_slope_component_recovers_slope_variance_structure() {
    let n = 300;
    let mut rng = StdRng::seed_from_u64(11);
    let keys = group_keys(n, 10);
    let slope = Array1::from_iter((0..n).map(|_| rng.gen_range(0.5..1.5)));

    let slope_noise = Normal::new(0.0, 1.0).unwrap();
    let effects: Vec<f64> = (0..30).map(|_| slope_noise.sample(&mut rng)).collect();
    let obs = Normal::new(0.0, 0.3).unwrap();
    let y = Array1::from_iter((0..n).map(|i| slope[i] * effects[i / 10] + obs.sample(&mut rng)));

    let mut model = CompositeCovarianceModel::from_specs(&[ComponentSpec::Grouped {
        keys,
        slope: Some(slope),
    }])
    .unwrap();
    let summary =
        remboost::optimizer::optimize(&mut model, &y, &OptimizerConfig::fisher_scoring()).unwrap();
    let slope_var = summary.params[1];
    assert!(
        slope_var > 0.3 && slope_var < 3.0,
        "slope variance estimate {slope_var} too far from 1.0"
    );
}
