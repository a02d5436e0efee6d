//! Turning a `ModelSpec` and the prepared `LakeFrame` into model matrices.
//!
//! Rows are selected in two steps: the model's row filter, then the
//! missingness filter over every column the model references. A row missing
//! any of them is dropped from this model only; it is never imputed.

use crate::bayes::fit::FitError;
use crate::bayes::spec::ModelSpec;
use crate::lakes::data::DataError;
use crate::lakes::frame::{Column, LakeFrame};
use ndarray::{Array1, Array2};

/// The levels of one grouping factor that a model was trained on.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLevels {
    pub factor: String,
    pub levels: Vec<String>,
}

/// Fixed-effect matrix and group memberships for a set of rows.
#[derive(Debug, Clone)]
pub struct Design {
    pub ids: Vec<String>,
    /// Row indices into the source frame.
    pub rows: Vec<usize>,
    /// Shape `[n_rows, n_predictors]`, no intercept column.
    pub x: Array2<f64>,
    /// Per factor, per row: index into the trained levels, `None` for a level
    /// the model never saw.
    pub group_codes: Vec<Vec<Option<usize>>>,
}

impl Design {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Design for arbitrary rows of `frame`, aligned with trained levels.
    ///
    /// Rows need every predictor and every grouping label; labels the model
    /// was not trained on map to `None` and contribute no offset.
    pub fn for_frame(
        spec: &ModelSpec,
        frame: &LakeFrame,
        groups: &[GroupLevels],
    ) -> Result<Self, FitError> {
        let mut needed: Vec<&str> = spec.predictors().iter().map(String::as_str).collect();
        needed.extend(spec.groups().iter().map(String::as_str));
        let rows = frame.complete_rows(&needed).map_err(FitError::from)?;
        internal::build_design(spec, frame, rows, groups)
    }
}

/// Everything the sampler needs for one model.
#[derive(Debug, Clone)]
pub struct ModelData {
    pub design: Design,
    pub y: Array1<f64>,
    pub groups: Vec<GroupLevels>,
    /// Per factor, per row: trained level index.
    pub codes: Vec<Vec<usize>>,
    /// Rows of the frame before any filtering.
    pub rows_available: usize,
    /// Rows left after the model's row filter, before the missingness filter.
    pub rows_after_filter: usize,
}

impl ModelData {
    pub fn from_frame(spec: &ModelSpec, frame: &LakeFrame) -> Result<Self, FitError> {
        internal::validate_columns(spec, frame)?;

        let filtered = spec.row_filter().select(frame).map_err(FitError::from)?;
        let complete = frame
            .complete_rows(&spec.required_columns())
            .map_err(FitError::from)?;
        let mut keep = vec![false; frame.height()];
        for &row in &complete {
            keep[row] = true;
        }
        let rows: Vec<usize> = filtered.iter().copied().filter(|&r| keep[r]).collect();

        log::info!(
            "[{}] {} lakes, {} after row filter, {} with complete {}",
            spec.name(),
            frame.height(),
            filtered.len(),
            rows.len(),
            spec.required_columns().join(", ")
        );
        if rows.is_empty() {
            return Err(FitError::EmptyDataset {
                model: spec.name().to_string(),
                rows_available: frame.height(),
                rows_after_filter: filtered.len(),
            });
        }

        let response = frame.numeric(spec.response()).map_err(FitError::from)?;
        let y: Array1<f64> = rows.iter().map(|&r| response[r]).collect();
        if let Some(&bad) = y.iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(FitError::NonBinaryResponse {
                column: spec.response().to_string(),
                value: bad,
            });
        }

        let groups = internal::trained_levels(spec, frame, &rows)?;
        let design = internal::build_design(spec, frame, rows, &groups)?;
        let codes = design
            .group_codes
            .iter()
            .map(|codes| codes.iter().map(|c| c.unwrap_or(0)).collect())
            .collect();

        Ok(Self {
            design,
            y,
            groups,
            codes,
            rows_available: frame.height(),
            rows_after_filter: filtered.len(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.y.len()
    }

    /// Observed fraction of positive outcomes.
    pub fn base_rate(&self) -> f64 {
        self.y.mean().unwrap_or(f64::NAN)
    }
}

mod internal {
    use super::*;

    pub(super) fn validate_columns(spec: &ModelSpec, frame: &LakeFrame) -> Result<(), FitError> {
        let numeric = std::iter::once(spec.response()).chain(spec.predictors().iter().map(String::as_str));
        for name in numeric {
            match frame.column(name) {
                Some(Column::Numeric(_)) => {}
                Some(_) => {
                    return Err(FitError::WrongColumnType {
                        column: name.to_string(),
                        expected: "numeric",
                    });
                }
                None => return Err(FitError::Data(DataError::ColumnNotFound(name.to_string()))),
            }
        }
        for name in spec.groups() {
            match frame.column(name) {
                Some(Column::Categorical(_)) => {}
                Some(_) => {
                    return Err(FitError::WrongColumnType {
                        column: name.clone(),
                        expected: "categorical",
                    });
                }
                None => return Err(FitError::Data(DataError::ColumnNotFound(name.clone()))),
            }
        }
        let mut seen = Vec::new();
        for name in spec.predictors().iter().chain(spec.groups()) {
            if seen.contains(&name) {
                return Err(FitError::InvalidConfig(format!(
                    "column '{name}' appears more than once in model '{}'",
                    spec.name()
                )));
            }
            seen.push(name);
        }
        Ok(())
    }

    /// Levels present in the training rows, in the factor's own level order.
    pub(super) fn trained_levels(
        spec: &ModelSpec,
        frame: &LakeFrame,
        rows: &[usize],
    ) -> Result<Vec<GroupLevels>, FitError> {
        spec.groups()
            .iter()
            .map(|name| {
                let factor = frame.categorical(name).map_err(FitError::from)?;
                let mut present = vec![false; factor.levels().len()];
                for &row in rows {
                    if let Some(code) = factor.code(row) {
                        present[code] = true;
                    }
                }
                let levels = factor
                    .levels()
                    .iter()
                    .zip(&present)
                    .filter(|(_, p)| **p)
                    .map(|(l, _)| l.clone())
                    .collect();
                Ok(GroupLevels {
                    factor: name.clone(),
                    levels,
                })
            })
            .collect()
    }

    pub(super) fn build_design(
        spec: &ModelSpec,
        frame: &LakeFrame,
        rows: Vec<usize>,
        groups: &[GroupLevels],
    ) -> Result<Design, FitError> {
        let n = rows.len();
        let p = spec.predictors().len();
        let mut x = Array2::<f64>::zeros((n, p));
        for (j, name) in spec.predictors().iter().enumerate() {
            let column = frame.numeric(name).map_err(FitError::from)?;
            for (i, &row) in rows.iter().enumerate() {
                x[[i, j]] = column[row];
            }
        }

        let mut group_codes = Vec::with_capacity(groups.len());
        for trained in groups {
            let factor = frame.categorical(&trained.factor).map_err(FitError::from)?;
            let codes = rows
                .iter()
                .map(|&row| {
                    factor
                        .label(row)
                        .and_then(|label| trained.levels.iter().position(|l| l == label))
                })
                .collect();
            group_codes.push(codes);
        }

        Ok(Design {
            ids: rows.iter().map(|&r| frame.ids()[r].clone()).collect(),
            rows,
            x,
            group_codes,
        })
    }
}
