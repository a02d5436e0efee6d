//! Approximate leave-one-out cross-validation with Pareto-smoothed importance
//! sampling (PSIS-LOO).
//!
//! For every observation the importance ratios `1 / p(y_i | theta_s)` have
//! their largest values replaced by expected order statistics of a generalized
//! Pareto distribution fitted to the tail. The fitted shape `k` is the
//! reliability diagnostic: values above 0.7 mean the estimate for that row
//! should not be trusted.

use crate::bayes::design::ModelData;
use crate::bayes::draws::PosteriorDraws;
use crate::bayes::fit::FitError;
use crate::bayes::posterior::{bernoulli_logit_log_likelihood, linear_predictor_draws};
use ndarray::{Array2, Axis};
use serde::Serialize;

/// Pareto k above which a row's LOO estimate is unreliable.
pub const PARETO_K_WARN: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ParetoKCounts {
    /// `k <= 0.5`
    pub good: usize,
    /// `0.5 < k <= 0.7`
    pub ok: usize,
    /// `0.7 < k <= 1`
    pub bad: usize,
    /// `k > 1`, including rows where no tail could be fitted
    pub very_bad: usize,
}

impl ParetoKCounts {
    pub fn from_ks(ks: impl IntoIterator<Item = f64>) -> Self {
        let mut counts = Self::default();
        for k in ks {
            if k <= 0.5 {
                counts.good += 1;
            } else if k <= PARETO_K_WARN {
                counts.ok += 1;
            } else if k <= 1.0 {
                counts.bad += 1;
            } else {
                counts.very_bad += 1;
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LooPoint {
    pub id: String,
    pub elpd_loo: f64,
    pub p_loo: f64,
    pub pareto_k: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LooResult {
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    pub k_counts: ParetoKCounts,
    pub pointwise: Vec<LooPoint>,
}

impl LooResult {
    pub fn max_pareto_k(&self) -> f64 {
        self.pointwise
            .iter()
            .map(|p| p.pareto_k)
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Pointwise log-likelihood of the training rows: `[n_draws, n_rows]`.
pub fn log_likelihood_matrix(
    draws: &PosteriorDraws,
    predictors: &[String],
    data: &ModelData,
) -> Result<Array2<f64>, FitError> {
    let mut eta = linear_predictor_draws(draws, predictors, &data.design, &data.groups)?;
    for mut row in eta.outer_iter_mut() {
        for (e, &y) in row.iter_mut().zip(data.y.iter()) {
            *e = bernoulli_logit_log_likelihood(y, *e);
        }
    }
    Ok(eta)
}

/// PSIS-LOO of a fitted model, logging every row with `k > 0.7`.
pub fn approximate_loo(
    draws: &PosteriorDraws,
    predictors: &[String],
    data: &ModelData,
    model: &str,
) -> Result<LooResult, FitError> {
    let log_lik = log_likelihood_matrix(draws, predictors, data)?;
    let result = psis_loo(&log_lik, &data.design.ids);
    for point in result.pointwise.iter().filter(|p| p.pareto_k > PARETO_K_WARN) {
        log::warn!(
            "[{}] Pareto k {:.2} for lake {}: LOO estimate unreliable",
            model,
            point.pareto_k,
            point.id
        );
    }
    log::info!(
        "[{}] elpd_loo {:.2} (se {:.2}), p_loo {:.2}, looic {:.2}",
        model,
        result.elpd_loo,
        result.se_elpd_loo,
        result.p_loo,
        result.looic
    );
    Ok(result)
}

/// PSIS-LOO from a `[n_draws, n_rows]` log-likelihood matrix.
pub fn psis_loo(log_lik: &Array2<f64>, ids: &[String]) -> LooResult {
    let n_draws = log_lik.nrows() as f64;
    let pointwise: Vec<LooPoint> = log_lik
        .axis_iter(Axis(1))
        .enumerate()
        .map(|(i, ll)| {
            let log_ratios: Vec<f64> = ll.iter().map(|v| -v).collect();
            let (log_weights, pareto_k) = psis_smooth(&log_ratios);
            let elpd_loo = log_sum_exp(log_weights.iter().zip(ll.iter()).map(|(w, l)| w + l));
            let lpd = log_sum_exp(ll.iter().copied()) - n_draws.ln();
            LooPoint {
                id: ids.get(i).cloned().unwrap_or_else(|| i.to_string()),
                elpd_loo,
                p_loo: lpd - elpd_loo,
                pareto_k,
            }
        })
        .collect();

    let (elpd_loo, se_elpd_loo) = sum_and_se(pointwise.iter().map(|p| p.elpd_loo));
    let (p_loo, se_p_loo) = sum_and_se(pointwise.iter().map(|p| p.p_loo));
    LooResult {
        elpd_loo,
        se_elpd_loo,
        p_loo,
        se_p_loo,
        looic: -2.0 * elpd_loo,
        se_looic: 2.0 * se_elpd_loo,
        k_counts: ParetoKCounts::from_ks(pointwise.iter().map(|p| p.pareto_k)),
        pointwise,
    }
}

/// Sum of pointwise values and its standard error `sqrt(n * var)`.
fn sum_and_se(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    let n = values.len() as f64;
    let sum = values.iter().sum::<f64>();
    if values.len() < 2 {
        return (sum, f64::NAN);
    }
    let mean = sum / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (sum, (n * var).sqrt())
}

fn log_sum_exp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Tail length used for the Pareto fit with `s` draws.
pub fn tail_length(s: usize) -> usize {
    let s = s as f64;
    (0.2 * s).ceil().min((3.0 * s.sqrt()).ceil()) as usize
}

/// Pareto-smoothed, truncated and normalised log importance weights, plus
/// the fitted tail shape `k`.
///
/// `k` is infinite when the tail is too short to fit (fewer than five draws
/// in it); the raw weights are then only truncated and normalised.
pub fn psis_smooth(log_ratios: &[f64]) -> (Vec<f64>, f64) {
    let s = log_ratios.len();
    let max = log_ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut lw: Vec<f64> = log_ratios.iter().map(|r| r - max).collect();

    let tail_len = tail_length(s);
    let k = if tail_len < 5 || tail_len >= s {
        f64::INFINITY
    } else {
        let mut order: Vec<usize> = (0..s).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail = &order[s - tail_len..];
        let cutoff = lw[order[s - tail_len - 1]];
        let exp_cutoff = cutoff.exp();
        let exceedances: Vec<f64> = tail.iter().map(|&i| lw[i].exp() - exp_cutoff).collect();

        if exceedances.iter().all(|&x| x <= 0.0) {
            0.0
        } else {
            let (k, sigma) = gpdfit(&exceedances);
            if k.is_finite() {
                for (j, &i) in tail.iter().enumerate() {
                    let p = (j as f64 + 0.5) / tail_len as f64;
                    lw[i] = (qgpd(p, k, sigma) + exp_cutoff).ln();
                }
            }
            k
        }
    };

    // Truncate at the largest raw weight, then normalise
    for w in lw.iter_mut() {
        if *w > 0.0 {
            *w = 0.0;
        }
    }
    let norm = log_sum_exp(lw.iter().copied());
    for w in lw.iter_mut() {
        *w -= norm;
    }
    (lw, k)
}

/// Empirical Bayes estimate of the generalized Pareto parameters `(k, sigma)`
/// for exceedances sorted in ascending order (Zhang and Stephens, 2009), with
/// the shape shrunk toward 0.5 by a weakly informative prior.
pub fn gpdfit(sorted: &[f64]) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    let prior = 3.0;
    let m = 30 + (n as f64).sqrt().floor() as usize;
    let quartile = sorted[((n as f64 / 4.0 + 0.5).floor() as usize).saturating_sub(1)];
    let x_max = sorted[n - 1];

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / prior / quartile)
        .collect();
    let profile: Vec<f64> = theta
        .iter()
        .map(|&t| n as f64 * profile_log_likelihood(t, sorted))
        .collect();
    let norm = log_sum_exp(profile.iter().copied());
    let theta_hat: f64 = theta
        .iter()
        .zip(&profile)
        .map(|(t, l)| t * (l - norm).exp())
        .sum();

    let mean_log = sorted.iter().map(|x| (-theta_hat * x).ln_1p()).sum::<f64>() / n as f64;
    let sigma = -mean_log / theta_hat;
    let k = adjust_k(mean_log, n);
    if k.is_nan() {
        (f64::INFINITY, sigma)
    } else {
        (k, sigma)
    }
}

fn profile_log_likelihood(theta: f64, x: &[f64]) -> f64 {
    let a = -theta;
    let k = x.iter().map(|v| (a * v).ln_1p()).sum::<f64>() / x.len() as f64;
    (a / k).ln() - k - 1.0
}

/// Shrinks `k` toward 0.5 with the weight of ten pseudo-observations.
fn adjust_k(k: f64, n: usize) -> f64 {
    let n = n as f64;
    let a = 10.0;
    k * n / (n + a) + a * 0.5 / (n + a)
}

/// Quantile function of the generalized Pareto distribution with location 0.
pub fn qgpd(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1e-12 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn gpd_sample(rng: &mut StdRng, n: usize, k: f64, sigma: f64) -> Vec<f64> {
        let mut x: Vec<f64> = (0..n).map(|_| qgpd(rng.r#gen::<f64>(), k, sigma)).collect();
        x.sort_by(f64::total_cmp);
        x
    }

    #[test]
    fn gpdfit_recovers_exponential_tail() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = gpd_sample(&mut rng, 2000, 0.0, 1.0);
        let (k, sigma) = gpdfit(&x);
        assert!(k.abs() < 0.1, "k {}", k);
        assert!((sigma - 1.0).abs() < 0.15, "sigma {}", sigma);
    }

    #[test]
    fn gpdfit_recovers_heavy_tail() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = gpd_sample(&mut rng, 2000, 0.5, 2.0);
        let (k, sigma) = gpdfit(&x);
        assert!((k - 0.5).abs() < 0.12, "k {}", k);
        assert!((sigma / 2.0 - 1.0).abs() < 0.2, "sigma {}", sigma);
    }

    #[test]
    fn qgpd_limits() {
        assert_abs_diff_eq!(qgpd(0.5, 0.0, 1.0), 2f64.ln(), epsilon = 1e-12);
        // k = 1: sigma * (1 / (1 - p) - 1)
        assert_abs_diff_eq!(qgpd(0.5, 1.0, 1.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn tail_length_follows_draw_count() {
        assert_eq!(tail_length(4000), 190);
        assert_eq!(tail_length(100), 20);
        assert_eq!(tail_length(20), 4);
    }

    #[test]
    fn short_tail_gives_infinite_k() {
        let ratios: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let (lw, k) = psis_smooth(&ratios);
        assert!(k.is_infinite());
        assert_abs_diff_eq!(log_sum_exp(lw.iter().copied()), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn smoothed_weights_are_normalised_and_capped() {
        let mut rng = StdRng::seed_from_u64(5);
        let ratios: Vec<f64> = (0..1000)
            .map(|_| 2.0 * rng.sample::<f64, _>(StandardNormal))
            .collect();
        let (lw, k) = psis_smooth(&ratios);
        assert!(k.is_finite());
        assert_abs_diff_eq!(log_sum_exp(lw.iter().copied()), 0.0, epsilon = 1e-10);
        // the largest draws are replaced by smoothed values
        let largest = (0..ratios.len())
            .max_by(|&a, &b| ratios[a].total_cmp(&ratios[b]))
            .unwrap();
        let smallest_weight = lw.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(lw[largest] > smallest_weight);
    }

    #[test]
    fn constant_likelihood_gives_exact_elpd() {
        let log_lik = Array2::from_elem((400, 3), -0.5);
        let ids: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let loo = psis_loo(&log_lik, &ids);
        assert_abs_diff_eq!(loo.elpd_loo, -1.5, epsilon = 1e-10);
        assert_abs_diff_eq!(loo.p_loo, 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(loo.looic, 3.0, epsilon = 1e-10);
        assert_eq!(loo.k_counts.good, 3);
        assert_eq!(loo.pointwise[1].id, "b");
    }

    #[test]
    fn loo_penalizes_relative_to_in_sample_fit() {
        let mut rng = StdRng::seed_from_u64(6);
        let (s, n) = (1000, 25);
        let log_lik = Array2::from_shape_fn((s, n), |(_, i)| {
            -0.3 - 0.05 * i as f64 + 0.2 * rng.sample::<f64, _>(StandardNormal)
        });
        let ids: Vec<String> = (0..n).map(|i| format!("L{i}")).collect();
        let loo = psis_loo(&log_lik, &ids);
        assert!(loo.p_loo > 0.0);
        assert!(loo.elpd_loo.is_finite());
        assert_abs_diff_eq!(loo.looic, -2.0 * loo.elpd_loo, epsilon = 1e-12);
        let c = loo.k_counts;
        assert_eq!(c.good + c.ok + c.bad + c.very_bad, n);
        assert!(loo.max_pareto_k() < PARETO_K_WARN);
    }

    #[test]
    fn heavy_tailed_row_is_flagged() {
        let mut rng = StdRng::seed_from_u64(8);
        let s = 4000;
        // importance ratios U^-1.2 have a Pareto tail with shape 1.2
        let log_lik = Array2::from_shape_fn((s, 3), |(_, i)| {
            if i == 2 {
                1.2 * (1.0 - rng.r#gen::<f64>()).ln()
            } else {
                -0.5 + 0.2 * rng.sample::<f64, _>(StandardNormal)
            }
        });
        let ids: Vec<String> = vec!["a".into(), "b".into(), "heavy".into()];

        let well_behaved = psis_loo(&log_lik.slice(ndarray::s![.., ..2]).to_owned(), &ids[..2]);
        assert_eq!(well_behaved.k_counts.bad + well_behaved.k_counts.very_bad, 0);

        let loo = psis_loo(&log_lik, &ids);
        assert!(loo.pointwise[2].pareto_k > PARETO_K_WARN, "k {}", loo.pointwise[2].pareto_k);
        assert!(loo.pointwise[0].pareto_k <= PARETO_K_WARN);
        assert!(loo.pointwise[1].pareto_k <= PARETO_K_WARN);
        assert_eq!(loo.k_counts.bad + loo.k_counts.very_bad, 1);
        assert_eq!(loo.k_counts.good + loo.k_counts.ok, 2);
        assert_eq!(loo.max_pareto_k(), loo.pointwise[2].pareto_k);
    }

    #[test]
    fn k_bands() {
        let counts = ParetoKCounts::from_ks([0.1, 0.5, 0.6, 0.7, 0.9, 1.5, f64::INFINITY]);
        assert_eq!(
            counts,
            ParetoKCounts {
                good: 2,
                ok: 2,
                bad: 1,
                very_bad: 2
            }
        );
    }
}
