//! NUTS sampling through mini-mcmc.
//!
//! mini-mcmc builds the trajectories and tunes the step size by dual averaging
//! toward `target_accept` during warmup. Its mass matrix is the identity; the
//! non-centred group effects keep the posterior scales close to one.
//!
//! Each chain is a single-chain `NUTS` run on a rayon pool, seeded from
//! `(seed, chain)`, so chains are independent of scheduling. The sampler does
//! not report divergent transitions, so every chain wraps its target in a
//! [`TrackedTarget`] that counts divergent log density evaluations: non-finite
//! values, or values more than [`DIVERGENCE_THRESHOLD`] below the highest the
//! chain has reached.
//!
//! Log densities and gradients come from [`LogDensity`] in ndarray; the tensors
//! are only the exchange format with the sampler.

use crate::bayes::fit::FitError;
use crate::bayes::posterior::HierarchicalLogitPosterior;
use crate::bayes::progress::SamplingProgressObserver;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Backend type for NUTS, f64 throughout.
pub type NutsBackend = Autodiff<NdArray<f64>>;

/// Drop in log density below a chain's highest value that counts as divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Initial positions are drawn uniformly from `(-INIT_RADIUS, INIT_RADIUS)`.
const INIT_RADIUS: f64 = 2.0;
const INIT_ATTEMPTS: usize = 100;

/// A differentiable log density on an unconstrained space.
pub trait LogDensity: Sync + Send {
    fn dim(&self) -> usize;

    /// Log density up to a constant and its gradient.
    fn log_density_and_grad(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>);

    /// Maps an unconstrained position to the values recorded as a draw, of
    /// the same length.
    fn constrain(&self, q: ArrayView1<f64>) -> Array1<f64> {
        q.to_owned()
    }
}

impl LogDensity for HierarchicalLogitPosterior {
    fn dim(&self) -> usize {
        HierarchicalLogitPosterior::dim(self)
    }

    fn log_density_and_grad(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>) {
        HierarchicalLogitPosterior::log_density_and_grad(self, q)
    }

    fn constrain(&self, q: ArrayView1<f64>) -> Array1<f64> {
        self.layout().constrain(q)
    }
}

#[derive(Debug, Clone, Copy)]
struct MonitorState {
    evaluations: usize,
    divergent: usize,
    highest: f64,
}

/// Counts divergent evaluations across every clone of one chain's target.
#[derive(Debug)]
pub struct DivergenceMonitor {
    state: Mutex<MonitorState>,
}

impl DivergenceMonitor {
    fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                evaluations: 0,
                divergent: 0,
                highest: f64::NEG_INFINITY,
            }),
        }
    }

    fn record(&self, logp: f64, grad: &Array1<f64>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.evaluations += 1;
        if !logp.is_finite() || !grad.iter().all(|g| g.is_finite()) {
            state.divergent += 1;
        } else if logp < state.highest - DIVERGENCE_THRESHOLD {
            state.divergent += 1;
        } else {
            state.highest = state.highest.max(logp);
        }
    }

    fn snapshot(&self) -> MonitorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn evaluations(&self) -> usize {
        self.snapshot().evaluations
    }

    pub fn divergent(&self) -> usize {
        self.snapshot().divergent
    }
}

/// A [`LogDensity`] exposed to mini-mcmc, recording every evaluation.
///
/// Clones share the monitor, so the counts cover whatever copies the
/// sampler makes.
#[derive(Debug, Clone)]
pub struct TrackedTarget<T> {
    target: T,
    monitor: Arc<DivergenceMonitor>,
}

impl<T: LogDensity> TrackedTarget<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            monitor: Arc::new(DivergenceMonitor::new()),
        }
    }

    pub fn monitor(&self) -> Arc<DivergenceMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn evaluate(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let (logp, grad) = self.target.log_density_and_grad(q);
        self.monitor.record(logp, &grad);
        (logp, grad)
    }

    fn evaluate_tensor(&self, z: Tensor<NutsBackend, 1>) -> (f64, Array1<f64>) {
        let dim = self.target.dim();
        let q: Vec<f64> = z.into_data().to_vec::<f64>().unwrap_or_default();
        if q.len() != dim {
            log::error!("Sampler passed a position of length {} for dimension {}", q.len(), dim);
            return (f64::NEG_INFINITY, Array1::zeros(dim));
        }
        self.evaluate(Array1::from_vec(q).view())
    }
}

impl<T: LogDensity + Clone> GradientTarget<f64, NutsBackend> for TrackedTarget<T> {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let (logp, _) = self.evaluate_tensor(z);
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let (logp, grad) = self.evaluate_tensor(z);
        let dim = grad.len();
        let logp_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let grad_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(grad.to_vec(), [dim]), &device);
        (logp_tensor, grad_tensor)
    }
}

/// Configuration for NUTS sampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NutsConfig {
    /// Number of independent chains
    pub chains: usize,
    /// Warmup iterations per chain, discarded
    pub warmup: usize,
    /// Total iterations per chain, warmup included
    pub iterations: usize,
    /// Target acceptance statistic for step size adaptation
    pub target_accept: f64,
    pub seed: u64,
    /// Divergent evaluations tolerated across all chains before an issue is raised
    pub divergence_tolerance: usize,
    /// Rhat above this flags a parameter as non-converged
    pub rhat_threshold: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            iterations: 2000,
            target_accept: 0.95,
            seed: 2024,
            divergence_tolerance: 0,
            rhat_threshold: 1.01,
        }
    }
}

impl NutsConfig {
    /// Retained draws per chain.
    pub fn draws_per_chain(&self) -> usize {
        self.iterations.saturating_sub(self.warmup)
    }

    pub fn validate(&self) -> Result<(), FitError> {
        let invalid = |msg: String| Err(FitError::InvalidConfig(msg));
        if self.chains == 0 {
            return invalid("at least one chain is required".to_string());
        }
        if self.iterations <= self.warmup {
            return invalid(format!(
                "iterations ({}) must exceed warmup ({})",
                self.iterations, self.warmup
            ));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return invalid(format!(
                "target_accept must lie in (0, 1), got {}",
                self.target_accept
            ));
        }
        if !(self.rhat_threshold > 1.0) {
            return invalid(format!(
                "rhat_threshold must exceed 1, got {}",
                self.rhat_threshold
            ));
        }
        Ok(())
    }
}

/// Per-chain sampler statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStats {
    pub chain: usize,
    pub seed: u64,
    /// Divergent log density evaluations over the whole chain, warmup included
    pub divergences: usize,
    pub log_density_evaluations: usize,
    /// Share of retained draws that differ from the previous draw
    pub move_rate: f64,
}

/// Constrained draws of one chain plus its statistics.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    /// Shape `[draws_per_chain, dim]`
    pub draws: Array2<f64>,
    pub stats: ChainStats,
}

/// Runs `config.chains` chains on a pool of at most `num_cpus` threads.
///
/// Chain `c` is seeded from `(config.seed, c)`, so the result does not depend
/// on scheduling.
pub fn run_chains<T>(
    target: &T,
    config: &NutsConfig,
    model: &str,
    observer: &dyn SamplingProgressObserver,
) -> Result<Vec<ChainOutput>, FitError>
where
    T: LogDensity + Clone + 'static,
{
    config.validate()?;
    let threads = config.chains.min(num_cpus::get()).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| FitError::ThreadPool(e.to_string()))?;
    log::debug!(
        "[{}] running {} chains on {} threads",
        model,
        config.chains,
        threads
    );
    pool.install(|| {
        (0..config.chains)
            .into_par_iter()
            .map(|chain| run_chain(target, config, chain, model, observer))
            .collect()
    })
}

/// Deterministic per-chain seed.
pub fn chain_seed(seed: u64, chain: usize) -> u64 {
    seed ^ (chain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Runs one chain: `warmup` discarded iterations, then `draws_per_chain`
/// retained draws.
pub fn run_chain<T>(
    target: &T,
    config: &NutsConfig,
    chain: usize,
    model: &str,
    observer: &dyn SamplingProgressObserver,
) -> Result<ChainOutput, FitError>
where
    T: LogDensity + Clone + 'static,
{
    let seed = chain_seed(config.seed, chain);
    let mut rng = StdRng::seed_from_u64(seed);
    observer.on_chain_start(model, chain, config.iterations);

    let start = initial_position(target, &mut rng).ok_or(FitError::NonFiniteStart {
        chain,
        attempts: INIT_ATTEMPTS,
    })?;
    let tracked = TrackedTarget::new(target.clone());
    let monitor = tracked.monitor();
    let mut sampler = NUTS::<f64, NutsBackend, TrackedTarget<T>>::new(
        tracked,
        vec![start.to_vec()],
        config.target_accept,
    )
    .set_seed(seed);
    let samples = sampler.run(config.draws_per_chain(), config.warmup);
    let raw = unconstrained_draws(samples, target.dim())?;

    let mut draws = Array2::<f64>::zeros(raw.raw_dim());
    for (i, row) in raw.rows().into_iter().enumerate() {
        draws.row_mut(i).assign(&target.constrain(row));
    }
    let moves = raw
        .rows()
        .into_iter()
        .zip(raw.rows().into_iter().skip(1))
        .filter(|(a, b)| a != b)
        .count();
    let stats = ChainStats {
        chain,
        seed,
        divergences: monitor.divergent(),
        log_density_evaluations: monitor.evaluations(),
        move_rate: moves as f64 / raw.nrows().saturating_sub(1).max(1) as f64,
    };

    log::info!(
        "[{}] chain {} done: {} draws, {} divergences, move rate {:.3}, {} log density evaluations",
        model,
        chain,
        draws.nrows(),
        stats.divergences,
        stats.move_rate,
        stats.log_density_evaluations
    );
    observer.on_chain_finish(model, chain);
    Ok(ChainOutput { draws, stats })
}

fn initial_position<T: LogDensity>(target: &T, rng: &mut StdRng) -> Option<Array1<f64>> {
    let dim = target.dim();
    for attempt in 0..INIT_ATTEMPTS {
        let q: Array1<f64> = (0..dim)
            .map(|_| rng.gen_range(-INIT_RADIUS..INIT_RADIUS))
            .collect();
        let (logp, grad) = target.log_density_and_grad(q.view());
        if logp.is_finite() && grad.iter().all(|g| g.is_finite()) {
            if attempt > 0 {
                log::debug!("Initial position found after {} attempts", attempt + 1);
            }
            return Some(q);
        }
    }
    None
}

/// Reads a single-chain `[1, n, dim]` sample tensor into `[n, dim]`.
fn unconstrained_draws(samples: Tensor<NutsBackend, 3>, dim: usize) -> Result<Array2<f64>, FitError> {
    let [_, n, _] = samples.dims();
    let flat: Vec<f64> = samples
        .into_data()
        .to_vec::<f64>()
        .map_err(|e| FitError::Sampler(format!("unreadable draws: {e:?}")))?;
    Array2::from_shape_vec((n, dim), flat).map_err(|e| FitError::Sampler(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayes::progress::NoopSamplingProgress;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Independent normals with the given standard deviations.
    #[derive(Clone)]
    struct Gaussian {
        sd: Array1<f64>,
    }

    impl LogDensity for Gaussian {
        fn dim(&self) -> usize {
            self.sd.len()
        }

        fn log_density_and_grad(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>) {
            let z = &q / &self.sd;
            let logp = -0.5 * z.dot(&z);
            let grad = -(&z / &self.sd);
            (logp, grad)
        }
    }

    #[derive(Clone)]
    struct Nowhere;

    impl LogDensity for Nowhere {
        fn dim(&self) -> usize {
            2
        }

        fn log_density_and_grad(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>) {
            (f64::NEG_INFINITY, Array1::zeros(q.len()))
        }
    }

    /// Standard normal that is undefined beyond `|q| > 50`.
    #[derive(Clone)]
    struct Cliff;

    impl LogDensity for Cliff {
        fn dim(&self) -> usize {
            1
        }

        fn log_density_and_grad(&self, q: ArrayView1<f64>) -> (f64, Array1<f64>) {
            if q[0].abs() > 50.0 {
                (f64::NAN, array![f64::NAN])
            } else {
                (-0.5 * q[0] * q[0], array![-q[0]])
            }
        }
    }

    fn config(warmup: usize, iterations: usize, chains: usize) -> NutsConfig {
        NutsConfig {
            chains,
            warmup,
            iterations,
            target_accept: 0.8,
            ..NutsConfig::default()
        }
    }

    fn tensor(values: Vec<f64>) -> Tensor<NutsBackend, 1> {
        let n = values.len();
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(values, [n]), &Default::default())
    }

    #[test]
    fn gradient_target_matches_analytic_density() {
        let gaussian = Gaussian {
            sd: array![1.0, 3.0],
        };
        let tracked = TrackedTarget::new(gaussian.clone());
        let q = array![0.5, -1.5];
        let (expected_logp, expected_grad) = gaussian.log_density_and_grad(q.view());

        let (logp, grad) = tracked.unnorm_logp_and_grad(tensor(q.to_vec()));
        let logp: Vec<f64> = logp.into_data().to_vec().unwrap();
        let grad: Vec<f64> = grad.into_data().to_vec().unwrap();
        assert_abs_diff_eq!(logp[0], expected_logp, epsilon = 1e-12);
        for (g, e) in grad.iter().zip(expected_grad.iter()) {
            assert_abs_diff_eq!(*g, *e, epsilon = 1e-12);
        }
        let only: Vec<f64> = tracked
            .unnorm_logp(tensor(q.to_vec()))
            .into_data()
            .to_vec()
            .unwrap();
        assert_abs_diff_eq!(only[0], expected_logp, epsilon = 1e-12);
        assert_eq!(tracked.monitor().evaluations(), 2);
        assert_eq!(tracked.monitor().divergent(), 0);
    }

    #[test]
    fn wrong_length_position_is_rejected() {
        let tracked = TrackedTarget::new(Cliff);
        let (logp, grad) = tracked.evaluate_tensor(tensor(vec![0.0, 1.0]));
        assert_eq!(logp, f64::NEG_INFINITY);
        assert_eq!(grad.len(), 1);
    }

    #[test]
    fn monitor_counts_cliffs_and_undefined_values() {
        let tracked = TrackedTarget::new(Cliff);
        tracked.evaluate(array![0.0].view());
        tracked.evaluate(array![10.0].view());
        // -1250 is more than the threshold below the best value, 0
        tracked.evaluate(array![50.0].view());
        tracked.evaluate(array![60.0].view());
        let clone = tracked.clone();
        clone.evaluate(array![1.0].view());
        let monitor = tracked.monitor();
        assert_eq!(monitor.evaluations(), 5);
        assert_eq!(monitor.divergent(), 2);
    }

    #[test]
    fn samples_independent_gaussian() {
        let target = Gaussian {
            sd: array![1.0, 3.0],
        };
        let out = run_chain(&target, &config(500, 2500, 1), 0, "gauss", &NoopSamplingProgress)
            .unwrap();
        assert_eq!(out.draws.nrows(), 2000);
        assert_eq!(out.draws.ncols(), 2);
        for (j, &sd) in target.sd.iter().enumerate() {
            let col = out.draws.column(j);
            let mean = col.mean().unwrap();
            let est_sd = col.std(1.0);
            assert!(mean.abs() < 0.3 * sd, "mean {} for sd {}", mean, sd);
            assert!((est_sd / sd - 1.0).abs() < 0.2, "sd {} vs {}", est_sd, sd);
        }
        assert!(out.stats.move_rate > 0.5);
        assert!(out.stats.log_density_evaluations >= 2500);
    }

    #[test]
    fn chains_are_reproducible_per_seed() {
        let target = Gaussian {
            sd: array![1.0, 0.5],
        };
        let cfg = config(50, 100, 2);
        let a = run_chains(&target, &cfg, "g", &NoopSamplingProgress).unwrap();
        let b = run_chains(&target, &cfg, "g", &NoopSamplingProgress).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].draws, b[0].draws);
        assert_eq!(a[1].draws, b[1].draws);
        assert_ne!(a[0].draws, a[1].draws);
        assert_ne!(a[0].stats.seed, a[1].stats.seed);
    }

    #[test]
    fn impossible_start_is_an_error() {
        let err = run_chain(&Nowhere, &config(10, 20, 1), 0, "x", &NoopSamplingProgress)
            .unwrap_err();
        assert!(matches!(err, FitError::NonFiniteStart { chain: 0, .. }));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(config(100, 100, 1).validate().is_err());
        assert!(config(10, 20, 0).validate().is_err());
        let mut cfg = config(10, 20, 1);
        cfg.target_accept = 1.0;
        assert!(cfg.validate().is_err());
        assert!(NutsConfig::default().validate().is_ok());
        assert_eq!(NutsConfig::default().draws_per_chain(), 1000);
    }
}
