//! The end-to-end run: load, correct, prepare, fit the selected models in
//! parallel, summarize and write.
//!
//! Preparation errors abort the run before any sampling starts. A model that
//! cannot be fitted is logged and reported without stopping the others.

use crate::bayes::fit::{FitError, fit_with_progress};
use crate::bayes::hmc::NutsConfig;
use crate::bayes::progress::SamplingProgressObserver;
use crate::bayes::report::{ModelOutputs, ReportError};
use crate::bayes::spec::Hypothesis;
use crate::config::{ConfigError, PipelineConfig};
use crate::lakes::corrections::{CorrectionOutcome, apply_corrections};
use crate::lakes::data::{DataError, load_and_merge, read_table};
use crate::lakes::frame::{Column, LakeFrame};
use crate::lakes::prepare::{PreparationSummary, prepare_dataset};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Failed to write the prepared dataset: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The merged, corrected and derived table every model reads from.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub frame: Arc<LakeFrame>,
    pub summary: PreparationSummary,
    pub corrections: Vec<CorrectionOutcome>,
}

/// Loads both input tables and runs every preparation step.
pub fn prepare(config: &PipelineConfig) -> Result<PreparedData, PipelineError> {
    let separator = config.inputs.separator_byte()?;
    let lakes = read_table(&config.inputs.lakes, separator)?;
    let climate = read_table(&config.inputs.climate, separator)?;
    let merged = load_and_merge(&lakes, &climate, &config.schema)?;
    let (corrected, corrections) = apply_corrections(&merged, &config.corrections)?;
    let (frame, summary) = prepare_dataset(&corrected)?;
    Ok(PreparedData {
        frame: Arc::new(frame),
        summary,
        corrections,
    })
}

/// Writes every column of `frame` as a tab-separated table. Missing values
/// are empty cells.
pub fn write_frame(frame: &LakeFrame, path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let names: Vec<&str> = frame.column_names().collect();
    let mut header = vec!["glims_id"];
    header.extend(names.iter().copied());
    writer.write_record(&header)?;

    let columns: Vec<&Column> = names.iter().filter_map(|name| frame.column(name)).collect();
    for (row, id) in frame.ids().iter().enumerate() {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(id.clone());
        for column in &columns {
            record.push(match column {
                Column::Numeric(values) if values[row].is_finite() => values[row].to_string(),
                Column::Numeric(_) => String::new(),
                Column::Categorical(factor) => factor.label(row).unwrap_or_default().to_string(),
            });
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    log::info!("Wrote {} prepared rows to '{}'", frame.height(), path.display());
    Ok(())
}

/// Outcome of one model of a run.
#[derive(Debug)]
pub struct ModelRun {
    pub hypothesis: Hypothesis,
    pub outcome: Result<ModelOutputs, FitError>,
}

/// Fits and summarizes each hypothesis concurrently over the shared frame.
/// Results come back in the order of `hypotheses`.
pub fn fit_models(
    frame: &Arc<LakeFrame>,
    hypotheses: &[Hypothesis],
    mcmc: &NutsConfig,
    observer: &dyn SamplingProgressObserver,
) -> Vec<ModelRun> {
    hypotheses
        .par_iter()
        .map(|&hypothesis| {
            let spec = hypothesis.spec();
            let frame = Arc::clone(frame);
            let outcome = fit_with_progress(&spec, &frame, mcmc, observer)
                .and_then(|fitted| ModelOutputs::build(&fitted, mcmc));
            if let Err(e) = &outcome {
                log::error!("[{}] model could not be fitted: {}", hypothesis, e);
            }
            ModelRun {
                hypothesis,
                outcome,
            }
        })
        .collect()
}

/// Runs the whole pipeline and writes every successful model's outputs.
pub fn run(
    config: &PipelineConfig,
    observer: &dyn SamplingProgressObserver,
) -> Result<Vec<ModelRun>, PipelineError> {
    let hypotheses = config.hypotheses()?;
    config
        .mcmc
        .validate()
        .map_err(|e| ConfigError::InvalidMcmc(e.to_string()))?;
    let prepared = prepare(config)?;

    let out_dir = &config.output.directory;
    fs::create_dir_all(out_dir)?;
    config.save(&out_dir.join("run_config.toml"))?;

    let runs = fit_models(&prepared.frame, &hypotheses, &config.mcmc, observer);
    for model in &runs {
        if let Ok(outputs) = &model.outcome {
            outputs.write(out_dir)?;
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lakes::frame::Categorical;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn prepared_frame_is_written_with_empty_missing_cells() {
        let frame = LakeFrame::new(vec!["A".into(), "B".into()])
            .with_column("x", Column::Numeric(array![1.5, f64::NAN]))
            .unwrap()
            .with_column(
                "g",
                Column::Categorical(Categorical::from_labels(vec![None, Some("hi")])),
            )
            .unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("prepared.tsv");
        write_frame(&frame, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["glims_id\tx\tg", "A\t1.5\t", "B\t\thi"]);
    }
}
