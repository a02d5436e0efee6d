//! Fitting one model: row selection, sampling, convergence assessment.

use crate::bayes::design::{Design, ModelData};
use crate::bayes::diagnostics::{
    ConvergenceReport, PpcSummary, convergence_report, posterior_predictive_check, rhat,
};
use crate::bayes::draws::PosteriorDraws;
use crate::bayes::hmc::{ChainStats, NutsConfig, run_chains};
use crate::bayes::loo::{LooResult, approximate_loo};
use crate::bayes::posterior::{HierarchicalLogitPosterior, sd_name};
use crate::bayes::predict::posterior_mean_prediction;
use crate::bayes::progress::{NoopSamplingProgress, SamplingProgressObserver};
use crate::bayes::spec::ModelSpec;
use crate::bayes::summary::{FixedEffect, GroupEffectTable, fixed_effects, group_effects};
use crate::lakes::data::DataError;
use crate::lakes::frame::LakeFrame;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FitError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(
        "Model '{model}' has no rows to fit: {rows_available} lakes available, {rows_after_filter} after its row filter, none complete"
    )]
    EmptyDataset {
        model: String,
        rows_available: usize,
        rows_after_filter: usize,
    },
    #[error("Column '{column}' must be {expected} for this model")]
    WrongColumnType {
        column: String,
        expected: &'static str,
    },
    #[error("Response column '{column}' must hold 0 or 1, found {value}")]
    NonBinaryResponse { column: String, value: f64 },
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("Chain {chain} found no starting point with a finite log density in {attempts} attempts")]
    NonFiniteStart { chain: usize, attempts: usize },
    #[error("Parameter '{0}' is missing from the posterior draws")]
    MissingParameter(String),
    #[error("Failed to build the sampling thread pool: {0}")]
    ThreadPool(String),
    #[error("Sampler failed: {0}")]
    Sampler(String),
}

/// Problems with a completed fit. They are reported with the fit rather than
/// returned as errors: a model with issues is still summarized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingIssue {
    DivergentTransitions { count: usize, tolerance: usize },
    NonConvergence { parameters: Vec<String>, threshold: f64 },
}

impl fmt::Display for SamplingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingIssue::DivergentTransitions { count, tolerance } => write!(
                f,
                "{count} divergent transitions (tolerance {tolerance})"
            ),
            SamplingIssue::NonConvergence {
                parameters,
                threshold,
            } => write!(
                f,
                "Rhat above {threshold} for {}: {}",
                parameters.len(),
                parameters.join(", ")
            ),
        }
    }
}

/// A fitted model and everything needed to summarize it.
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub spec: ModelSpec,
    pub data: ModelData,
    pub draws: PosteriorDraws,
    pub chain_stats: Vec<ChainStats>,
    pub convergence: ConvergenceReport,
    pub issues: Vec<SamplingIssue>,
}

impl FittedModel {
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn issues(&self) -> &[SamplingIssue] {
        &self.issues
    }

    pub fn divergences(&self) -> usize {
        self.chain_stats.iter().map(|s| s.divergences).sum()
    }

    pub fn rhat(&self) -> BTreeMap<String, f64> {
        rhat(&self.draws)
    }

    pub fn fixed_effects(&self) -> Result<Vec<FixedEffect>, FitError> {
        fixed_effects(&self.draws, self.spec.predictors())
    }

    pub fn group_effects(&self, factor: &str) -> Result<GroupEffectTable, FitError> {
        let group = self
            .data
            .groups
            .iter()
            .find(|g| g.factor == factor)
            .ok_or_else(|| FitError::MissingParameter(sd_name(factor)))?;
        group_effects(&self.draws, group)
    }

    pub fn approximate_loo(&self) -> Result<LooResult, FitError> {
        approximate_loo(&self.draws, self.spec.predictors(), &self.data, self.name())
    }

    pub fn posterior_predictive_check(&self, seed: u64) -> Result<PpcSummary, FitError> {
        posterior_predictive_check(&self.draws, self.spec.predictors(), &self.data, seed)
    }

    /// Posterior mean probabilities of the training rows.
    pub fn fitted_probabilities(&self) -> Result<Array1<f64>, FitError> {
        posterior_mean_prediction(
            &self.draws,
            self.spec.predictors(),
            &self.data.design,
            &self.data.groups,
        )
    }

    /// Posterior mean probabilities for every row of `frame` with complete
    /// predictors and grouping labels.
    pub fn predict(&self, frame: &LakeFrame) -> Result<(Design, Array1<f64>), FitError> {
        let design = Design::for_frame(&self.spec, frame, &self.data.groups)?;
        let probabilities = posterior_mean_prediction(
            &self.draws,
            self.spec.predictors(),
            &design,
            &self.data.groups,
        )?;
        Ok((design, probabilities))
    }
}

/// Fits `spec` to the complete rows of `frame`.
pub fn fit(spec: &ModelSpec, frame: &LakeFrame, config: &NutsConfig) -> Result<FittedModel, FitError> {
    fit_with_progress(spec, frame, config, &NoopSamplingProgress)
}

pub fn fit_with_progress(
    spec: &ModelSpec,
    frame: &LakeFrame,
    config: &NutsConfig,
    observer: &dyn SamplingProgressObserver,
) -> Result<FittedModel, FitError> {
    config.validate()?;
    let data = ModelData::from_frame(spec, frame)?;
    let target = HierarchicalLogitPosterior::new(spec, &data);
    log::info!(
        "[{}] sampling {} parameters from {} rows: {} chains x {} iterations ({} warmup)",
        spec.name(),
        target.dim(),
        data.n_rows(),
        config.chains,
        config.iterations,
        config.warmup
    );

    let chains = run_chains(&target, config, spec.name(), observer)?;
    let (chain_draws, chain_stats): (Vec<Array2<f64>>, Vec<ChainStats>) =
        chains.into_iter().map(|c| (c.draws, c.stats)).unzip();
    let draws = PosteriorDraws::new(target.layout().names(), chain_draws);
    let convergence = convergence_report(&draws, config.rhat_threshold, spec.name());

    let mut issues = Vec::new();
    let divergences: usize = chain_stats.iter().map(|s| s.divergences).sum();
    if divergences > config.divergence_tolerance {
        issues.push(SamplingIssue::DivergentTransitions {
            count: divergences,
            tolerance: config.divergence_tolerance,
        });
    }
    let flagged = convergence.flagged();
    if !flagged.is_empty() {
        issues.push(SamplingIssue::NonConvergence {
            parameters: flagged.iter().map(|s| s.to_string()).collect(),
            threshold: config.rhat_threshold,
        });
    }
    for issue in &issues {
        log::warn!("[{}] {}", spec.name(), issue);
    }

    Ok(FittedModel {
        spec: spec.clone(),
        data,
        draws,
        chain_stats,
        convergence,
        issues,
    })
}
