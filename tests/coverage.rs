use moraine::bayes::fit::fit;
use moraine::bayes::hmc::NutsConfig;
use moraine::bayes::spec::ModelSpec;
use moraine::lakes::frame::{Categorical, Column, LakeFrame};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const TRUE_INTERCEPT: f64 = -0.5;
const TRUE_SLOPE: f64 = 1.0;
const GROUP_OFFSETS: [f64; 2] = [-0.4, 0.4];

fn simulate(rows: usize, seed: u64) -> LakeFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Array1<f64> = (0..rows).map(|_| rng.sample(StandardNormal)).collect();
    let group: Vec<usize> = (0..rows).map(|i| i % 2).collect();
    let y: Array1<f64> = (0..rows)
        .map(|i| {
            let eta = TRUE_INTERCEPT + TRUE_SLOPE * x[i] + GROUP_OFFSETS[group[i]];
            let p = 1.0 / (1.0 + (-eta).exp());
            f64::from(rng.r#gen::<f64>() < p)
        })
        .collect();
    let labels = group.iter().map(|&g| Some(["a", "b"][g]));
    LakeFrame::new((0..rows).map(|i| format!("S{i:03}")).collect())
        .with_column("glof", Column::Numeric(y))
        .unwrap()
        .with_column("x", Column::Numeric(x))
        .unwrap()
        .with_column("group", Column::Categorical(Categorical::from_labels(labels)))
        .unwrap()
}

/// The 95% interval of a planted slope covers it in at least 90 of 100
/// simulated datasets.
#[test]
#[ignore = "fits 100 models; run with --ignored"]
fn slope_interval_coverage() {
    let spec = ModelSpec::new("coverage", "glof")
        .with_predictor("x")
        .with_group("group");
    let mut covered = 0;
    for replicate in 0..100u64 {
        let frame = simulate(100, 1000 + replicate);
        let config = NutsConfig {
            chains: 2,
            warmup: 300,
            iterations: 800,
            seed: replicate,
            ..NutsConfig::default()
        };
        let fitted = fit(&spec, &frame, &config).unwrap();
        let slope = &fitted.fixed_effects().unwrap()[1];
        assert_eq!(slope.parameter, "b_x");
        if slope.estimate.contains(TRUE_SLOPE) {
            covered += 1;
        }
    }
    assert!(covered >= 90, "only {covered} of 100 intervals covered the slope");
}
