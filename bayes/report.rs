//! The per-model report and the per-lake prediction table.

use crate::bayes::diagnostics::{ConvergenceReport, PpcSummary};
use crate::bayes::fit::{FitError, FittedModel, SamplingIssue};
use crate::bayes::hmc::{ChainStats, NutsConfig};
use crate::bayes::loo::{LooResult, ParetoKCounts};
use crate::bayes::predict::{LogOddsEvaluation, RowPrediction, evaluate};
use crate::bayes::summary::{FixedEffect, GroupEffect, GroupEffectTable};
use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize report to TOML: {0}")]
    Toml(#[from] toml::ser::Error),
    #[error("Failed to write prediction table: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Fit(#[from] FitError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RowCounts {
    pub available: usize,
    pub after_filter: usize,
    pub fitted: usize,
    pub glof: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriorEntry {
    pub class: String,
    pub prior: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SamplingSummary {
    pub chains: usize,
    pub warmup: usize,
    pub iterations: usize,
    pub target_accept: f64,
    pub seed: u64,
    pub divergences: usize,
    pub max_rhat: f64,
    pub min_ess: f64,
    pub converged: bool,
    pub chain: Vec<ChainStats>,
}

/// PSIS-LOO without the pointwise values, which go to the prediction table.
#[derive(Debug, Clone, Serialize)]
pub struct LooSummary {
    pub elpd_loo: f64,
    pub se_elpd_loo: f64,
    pub p_loo: f64,
    pub se_p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    pub max_pareto_k: f64,
    pub pareto_k: ParetoKCounts,
}

impl From<&LooResult> for LooSummary {
    fn from(loo: &LooResult) -> Self {
        Self {
            elpd_loo: loo.elpd_loo,
            se_elpd_loo: loo.se_elpd_loo,
            p_loo: loo.p_loo,
            se_p_loo: loo.se_p_loo,
            looic: loo.looic,
            se_looic: loo.se_looic,
            max_pareto_k: loo.max_pareto_k(),
            pareto_k: loo.k_counts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    #[serde(flatten)]
    pub table: GroupEffectTable,
    /// Levels and the pooled intercept, ascending by combined mean.
    pub ordered: Vec<GroupEffect>,
}

/// Everything reported for one fitted model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub model: String,
    pub formula: String,
    pub rows: RowCounts,
    pub priors: Vec<PriorEntry>,
    pub sampling: SamplingSummary,
    pub issues: Vec<SamplingIssue>,
    pub fixed_effects: Vec<FixedEffect>,
    pub group_effects: Vec<GroupReport>,
    pub convergence: ConvergenceReport,
    pub loo: LooSummary,
    pub posterior_predictive: PpcSummary,
    pub log_odds: LogOddsEvaluation,
}

/// Report plus per-lake rows, ready to be written.
#[derive(Debug, Clone)]
pub struct ModelOutputs {
    pub report: ModelReport,
    pub predictions: Vec<PredictionRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRow {
    pub prediction: RowPrediction,
    pub pareto_k: f64,
}

impl ModelOutputs {
    /// Summarizes a fit: effects, diagnostics and the log-odds evaluation of
    /// the training rows.
    pub fn build(fitted: &FittedModel, config: &NutsConfig) -> Result<Self, FitError> {
        let fixed_effects = fitted.fixed_effects()?;
        let intercept = fixed_effects[0].estimate;
        let group_effects = fitted
            .spec
            .groups()
            .iter()
            .map(|factor| {
                let table = fitted.group_effects(factor)?;
                let ordered = table.ordered_with_pooled(&intercept);
                Ok(GroupReport { table, ordered })
            })
            .collect::<Result<Vec<_>, FitError>>()?;

        let loo = fitted.approximate_loo()?;
        let posterior_predictive = fitted.posterior_predictive_check(config.seed)?;
        let probabilities = fitted.fitted_probabilities()?.to_vec();
        let observed = fitted.data.y.to_vec();
        let (log_odds, rows) = evaluate(&fitted.data.design.ids, &observed, &probabilities);
        log::info!(
            "[{}] log odds vs base rate: TPR {:.1}% ({} degenerate), TNR {:.1}% ({} degenerate)",
            fitted.name(),
            log_odds.positives.rate_percent,
            log_odds.positives.degenerate,
            log_odds.negatives.rate_percent,
            log_odds.negatives.degenerate
        );

        let predictions = rows
            .into_iter()
            .zip(&loo.pointwise)
            .map(|(prediction, point)| PredictionRow {
                prediction,
                pareto_k: point.pareto_k,
            })
            .collect();

        let report = ModelReport {
            model: fitted.name().to_string(),
            formula: fitted.spec.formula(),
            rows: RowCounts {
                available: fitted.data.rows_available,
                after_filter: fitted.data.rows_after_filter,
                fitted: fitted.data.n_rows(),
                glof: observed.iter().filter(|&&y| y == 1.0).count(),
            },
            priors: fitted
                .spec
                .prior_table()
                .into_iter()
                .map(|(class, prior)| PriorEntry {
                    class: class.to_string(),
                    prior: prior.to_string(),
                })
                .collect(),
            sampling: SamplingSummary {
                chains: config.chains,
                warmup: config.warmup,
                iterations: config.iterations,
                target_accept: config.target_accept,
                seed: config.seed,
                divergences: fitted.divergences(),
                max_rhat: fitted.convergence.max_rhat(),
                min_ess: fitted.convergence.min_ess(),
                converged: fitted.convergence.all_converged(),
                chain: fitted.chain_stats.clone(),
            },
            issues: fitted.issues.clone(),
            fixed_effects,
            group_effects,
            convergence: fitted.convergence.clone(),
            loo: LooSummary::from(&loo),
            posterior_predictive,
            log_odds,
        };
        Ok(Self {
            report,
            predictions,
        })
    }

    /// Writes `<model>.toml` and `<model>_predictions.tsv` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), ReportError> {
        fs::create_dir_all(dir)?;
        let toml_path = dir.join(format!("{}.toml", self.report.model));
        let toml_string = toml::to_string_pretty(&self.report)?;
        let mut file = BufWriter::new(fs::File::create(&toml_path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;

        let tsv_path = dir.join(format!("{}_predictions.tsv", self.report.model));
        write_predictions(&tsv_path, &self.predictions)?;
        log::info!(
            "[{}] wrote {} and {}",
            self.report.model,
            toml_path.display(),
            tsv_path.display()
        );
        Ok(())
    }
}

pub fn write_predictions(path: &Path, rows: &[PredictionRow]) -> Result<(), ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;
    writer.write_record([
        "glims_id",
        "glof",
        "predicted_probability",
        "log_odds_ratio",
        "pareto_k",
    ])?;
    for row in rows {
        let p = &row.prediction;
        writer.write_record([
            p.glims_id.clone(),
            p.glof.to_string(),
            p.predicted_probability.to_string(),
            p.log_odds_ratio.to_string(),
            row.pareto_k.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Human-readable overview of a report for the terminal.
pub fn render_summary(report: &ModelReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("== {} ==\n{}\n", report.model, report.formula));
    out.push_str(&format!(
        "rows: {} available, {} after filter, {} fitted ({} GLOF)\n",
        report.rows.available, report.rows.after_filter, report.rows.fitted, report.rows.glof
    ));
    out.push_str("fixed effects (mean, sd, 95% CI):\n");
    for e in &report.fixed_effects {
        out.push_str(&format!(
            "  {:<45} {:>8.3} {:>7.3}  [{:.3}, {:.3}]\n",
            e.term, e.estimate.mean, e.estimate.sd, e.estimate.lower_95, e.estimate.upper_95
        ));
    }
    for g in &report.group_effects {
        out.push_str(&format!(
            "group '{}' (sd {:.3}): {}\n",
            g.table.factor,
            g.table.sd.mean,
            g.ordered
                .iter()
                .map(|e| format!("{} {:.2}", e.level, e.combined.mean))
                .join(", ")
        ));
    }
    out.push_str(&format!(
        "max Rhat {:.4}, min ESS {:.0}, divergences {}\n",
        report.sampling.max_rhat, report.sampling.min_ess, report.sampling.divergences
    ));
    out.push_str(&format!(
        "elpd_loo {:.2} (se {:.2}), p_loo {:.2}, max Pareto k {:.2}\n",
        report.loo.elpd_loo, report.loo.se_elpd_loo, report.loo.p_loo, report.loo.max_pareto_k
    ));
    out.push_str(&format!(
        "TPR {:.1}%, TNR {:.1}%\n",
        report.log_odds.positives.rate_percent, report.log_odds.negatives.rate_percent
    ));
    if !report.issues.is_empty() {
        out.push_str(&format!(
            "issues: {}\n",
            report.issues.iter().map(|i| i.to_string()).join("; ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayes::fit::fit;
    use crate::bayes::spec::ModelSpec;
    use crate::lakes::frame::{Categorical, Column, LakeFrame};
    use ndarray::Array1;
    use tempfile::tempdir;

    fn fitted() -> (FittedModel, NutsConfig) {
        let n = 30;
        let x: Array1<f64> = (0..n).map(|i| (i as f64 - 15.0) / 8.0).collect();
        let y: Array1<f64> = (0..n).map(|i| if i % 4 == 0 || i > 22 { 1.0 } else { 0.0 }).collect();
        let labels: Vec<Option<&str>> = (0..n).map(|i| Some(["low", "high"][i % 2])).collect();
        let frame = LakeFrame::new((0..n).map(|i| format!("G{i:03}")).collect())
            .with_column("glof", Column::Numeric(y))
            .unwrap()
            .with_column("x", Column::Numeric(x))
            .unwrap()
            .with_column("band", Column::Categorical(Categorical::from_labels(labels)))
            .unwrap();
        let spec = ModelSpec::new("toy", "glof").with_predictor("x").with_group("band");
        let config = NutsConfig {
            chains: 2,
            warmup: 100,
            iterations: 200,
            target_accept: 0.9,
            ..NutsConfig::default()
        };
        (fit(&spec, &frame, &config).unwrap(), config)
    }

    #[test]
    fn report_is_complete_and_written() {
        let (fitted, config) = fitted();
        let outputs = ModelOutputs::build(&fitted, &config).unwrap();
        let report = &outputs.report;
        assert_eq!(report.rows.fitted, 30);
        assert_eq!(report.fixed_effects.len(), 2);
        assert_eq!(report.group_effects.len(), 1);
        assert_eq!(report.group_effects[0].ordered.len(), 3);
        assert_eq!(report.priors.len(), 3);
        assert_eq!(report.convergence.parameters.len(), 5);
        assert_eq!(outputs.predictions.len(), 30);
        assert_eq!(
            report.log_odds.positives.rows + report.log_odds.negatives.rows,
            30
        );

        let dir = tempdir().unwrap();
        outputs.write(dir.path()).unwrap();
        let toml_text = fs::read_to_string(dir.path().join("toy.toml")).unwrap();
        assert!(toml_text.contains("model = \"toy\""));
        assert!(toml_text.contains("b_Intercept"));
        let tsv = fs::read_to_string(dir.path().join("toy_predictions.tsv")).unwrap();
        let mut lines = tsv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "glims_id\tglof\tpredicted_probability\tlog_odds_ratio\tpareto_k"
        );
        assert!(lines.next().unwrap().starts_with("G000\t1\t"));
        assert!(render_summary(report).contains("== toy =="));
    }
}
