//! Convergence diagnostics and posterior predictive checks.

use crate::bayes::design::ModelData;
use crate::bayes::draws::PosteriorDraws;
use crate::bayes::fit::FitError;
use crate::bayes::posterior::{linear_predictor_draws, sigmoid};
use crate::lakes::derive::quantile_sorted;
use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;

/// Splits every chain in half, dropping the middle draw of odd-length chains.
fn split_chains<'a>(chains: &[ArrayView1<'a, f64>]) -> Vec<ArrayView1<'a, f64>> {
    let mut halves = Vec::with_capacity(chains.len() * 2);
    for chain in chains {
        let half = chain.len() / 2;
        let (first, rest) = chain.split_at(ndarray::Axis(0), half);
        let (_, second) = rest.split_at(ndarray::Axis(0), rest.len() - half);
        halves.push(first);
        halves.push(second);
    }
    halves
}

fn mean_and_variance(x: &ArrayView1<f64>) -> (f64, f64) {
    let n = x.len() as f64;
    let mean = x.sum() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

/// Split potential scale reduction factor.
///
/// `NaN` when any half-chain has fewer than two draws; `1` for a parameter
/// that is constant across all draws.
pub fn split_rhat(chains: &[ArrayView1<f64>]) -> f64 {
    let halves = split_chains(chains);
    let m = halves.len();
    let n = halves.first().map_or(0, |h| h.len());
    if m < 2 || n < 2 {
        return f64::NAN;
    }
    let stats: Vec<(f64, f64)> = halves.iter().map(mean_and_variance).collect();
    let w = stats.iter().map(|s| s.1).sum::<f64>() / m as f64;
    let grand = stats.iter().map(|s| s.0).sum::<f64>() / m as f64;
    let b = n as f64 * stats.iter().map(|s| (s.0 - grand).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    if w == 0.0 {
        return if b == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    (var_plus / w).sqrt()
}

/// Autocovariance of `x` at `lag`, normalised by `n`.
fn autocovariance(x: &ArrayView1<f64>, mean: f64, lag: usize) -> f64 {
    let n = x.len();
    (0..n - lag)
        .map(|i| (x[i] - mean) * (x[i + lag] - mean))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size over split chains with Geyer's initial monotone
/// sequence estimator.
pub fn effective_sample_size(chains: &[ArrayView1<f64>]) -> f64 {
    let halves = split_chains(chains);
    let m = halves.len();
    let n = halves.first().map_or(0, |h| h.len());
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let stats: Vec<(f64, f64)> = halves.iter().map(mean_and_variance).collect();
    let mean_var = stats.iter().map(|s| s.1).sum::<f64>() / m as f64;
    let mut var_plus = mean_var * (n as f64 - 1.0) / n as f64;
    if m > 1 {
        let grand = stats.iter().map(|s| s.0).sum::<f64>() / m as f64;
        var_plus += stats.iter().map(|s| (s.0 - grand).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    }
    if !(var_plus > 0.0) {
        return f64::NAN;
    }

    let rho_at = |lag: usize| -> f64 {
        let mean_acov = halves
            .iter()
            .zip(&stats)
            .map(|(h, s)| autocovariance(h, s.0, lag))
            .sum::<f64>()
            / m as f64;
        1.0 - (mean_var - mean_acov) / var_plus
    };

    let mut rho = vec![1.0, rho_at(1)];
    let mut t = 1;
    while t + 2 < n {
        let even = rho_at(t + 1);
        let odd = rho_at(t + 2);
        if !(even + odd > 0.0) {
            break;
        }
        rho.push(even);
        rho.push(odd);
        t += 2;
    }
    // Initial monotone sequence over pair sums
    for k in 1..rho.len() / 2 {
        let previous = rho[2 * k - 2] + rho[2 * k - 1];
        if rho[2 * k] + rho[2 * k + 1] > previous {
            rho[2 * k] = previous / 2.0;
            rho[2 * k + 1] = previous / 2.0;
        }
    }

    let total = (m * n) as f64;
    let tau = (-1.0 + 2.0 * rho.iter().sum::<f64>()).max(1.0 / total.log10());
    total / tau
}

/// Split Rhat of every parameter, keyed by name.
pub fn rhat(draws: &PosteriorDraws) -> BTreeMap<String, f64> {
    draws
        .names()
        .iter()
        .filter_map(|name| {
            let chains = draws.by_chain(name)?;
            Some((name.clone(), split_rhat(&chains)))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterConvergence {
    pub name: String,
    pub rhat: f64,
    pub ess: f64,
    /// `rhat <= threshold`; a NaN Rhat is never converged.
    pub converged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub threshold: f64,
    pub parameters: Vec<ParameterConvergence>,
}

impl ConvergenceReport {
    /// Names of parameters whose Rhat exceeds the threshold.
    pub fn flagged(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| !p.converged)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn all_converged(&self) -> bool {
        self.parameters.iter().all(|p| p.converged)
    }

    pub fn max_rhat(&self) -> f64 {
        self.parameters
            .iter()
            .map(|p| p.rhat)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min_ess(&self) -> f64 {
        self.parameters
            .iter()
            .map(|p| p.ess)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn get(&self, name: &str) -> Option<&ParameterConvergence> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Rhat and ESS for every parameter in draw order, logging each flag.
pub fn convergence_report(draws: &PosteriorDraws, threshold: f64, model: &str) -> ConvergenceReport {
    let parameters: Vec<ParameterConvergence> = draws
        .names()
        .iter()
        .filter_map(|name| {
            let chains = draws.by_chain(name)?;
            let rhat = split_rhat(&chains);
            Some(ParameterConvergence {
                name: name.clone(),
                rhat,
                ess: effective_sample_size(&chains),
                converged: rhat <= threshold,
            })
        })
        .collect();
    for p in parameters.iter().filter(|p| !p.converged) {
        log::warn!(
            "[{}] {} has Rhat {:.4} above {} (ESS {:.0})",
            model,
            p.name,
            p.rhat,
            threshold,
            p.ess
        );
    }
    ConvergenceReport {
        threshold,
        parameters,
    }
}

/// A test statistic compared between observed and replicated outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PpcStatistic {
    pub statistic: String,
    pub observed: f64,
    pub replicated_mean: f64,
    pub replicated_sd: f64,
    pub lower_95: f64,
    pub upper_95: f64,
    /// Fraction of replications with a statistic at least the observed one.
    pub ppp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PpcSummary {
    pub replications: usize,
    pub statistics: Vec<PpcStatistic>,
}

impl PpcSummary {
    pub fn get(&self, statistic: &str) -> Option<&PpcStatistic> {
        self.statistics.iter().find(|s| s.statistic == statistic)
    }
}

pub const GLOF_COUNT: &str = "glof_count";

pub fn group_count_statistic(factor: &str, level: &str) -> String {
    format!("{GLOF_COUNT}[{factor}={level}]")
}

/// Simulates one replicated outcome vector per draw and compares the GLOF
/// count overall and per grouping level with the observed data.
pub fn posterior_predictive_check(
    draws: &PosteriorDraws,
    predictors: &[String],
    data: &ModelData,
    seed: u64,
) -> Result<PpcSummary, FitError> {
    let eta = linear_predictor_draws(draws, predictors, &data.design, &data.groups)?;
    let mut rng = StdRng::seed_from_u64(seed);

    // Statistic 0 is the overall count, then one per (factor, level)
    let mut names = vec![GLOF_COUNT.to_string()];
    let mut members: Vec<Vec<usize>> = vec![(0..data.n_rows()).collect()];
    for (g, levels) in data.groups.iter().enumerate() {
        for (l, level) in levels.levels.iter().enumerate() {
            names.push(group_count_statistic(&levels.factor, level));
            members.push(
                data.codes[g]
                    .iter()
                    .enumerate()
                    .filter(|&(_, &c)| c == l)
                    .map(|(i, _)| i)
                    .collect(),
            );
        }
    }

    let mut replicated = vec![Vec::with_capacity(eta.nrows()); names.len()];
    let mut y_rep = vec![0.0; data.n_rows()];
    for row in eta.outer_iter() {
        for (i, &e) in row.iter().enumerate() {
            y_rep[i] = if rng.r#gen::<f64>() < sigmoid(e) { 1.0 } else { 0.0 };
        }
        for (k, rows) in members.iter().enumerate() {
            replicated[k].push(rows.iter().map(|&i| y_rep[i]).sum::<f64>());
        }
    }

    let statistics = names
        .into_iter()
        .zip(members.iter())
        .zip(replicated)
        .map(|((statistic, rows), mut reps)| {
            let observed = rows.iter().map(|&i| data.y[i]).sum::<f64>();
            summarize_replications(statistic, observed, &mut reps)
        })
        .collect();
    Ok(PpcSummary {
        replications: eta.nrows(),
        statistics,
    })
}

fn summarize_replications(statistic: String, observed: f64, reps: &mut [f64]) -> PpcStatistic {
    let n = reps.len() as f64;
    let mean = reps.iter().sum::<f64>() / n;
    let sd = if reps.len() > 1 {
        (reps.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    let ppp = reps.iter().filter(|&&r| r >= observed).count() as f64 / n;
    reps.sort_by(f64::total_cmp);
    PpcStatistic {
        statistic,
        observed,
        replicated_mean: mean,
        replicated_sd: sd,
        lower_95: quantile_sorted(reps, 0.025),
        upper_95: quantile_sorted(reps, 0.975),
        ppp,
    }
}
