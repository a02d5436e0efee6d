//! Named, single-record corrections of known data-entry anomalies.
//!
//! A correction addresses one cell of the merged table by row and column and
//! is applied explicitly, with a log line per correction. When the correction
//! carries the identifier of the lake it was written for and that row now holds
//! another lake, the correction is skipped with a warning.

use crate::lakes::data::{DataError, columns};
use crate::lakes::frame::{Column, LakeFrame};
use serde::{Deserialize, Serialize};

/// Row of the merged reference table whose region label was entered wrongly.
///
/// Zero-based position in the inner join of the inventory and the GLOF table,
/// in inventory order, before any row filter.
pub const REGION_LABEL_FIX_ROW: usize = 1544;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordCorrection {
    pub name: String,
    /// Zero-based row of the merged table (lake inventory order).
    pub row: usize,
    pub column: String,
    /// Replacement value; parsed as a number for numeric columns.
    pub value: String,
    /// GLIMS id the row must hold for the correction to apply.
    #[serde(default)]
    pub expected_id: Option<String>,
}

/// The corrections the reference dataset needs.
///
/// The input tables do not record which lake row 1544 is, so the default
/// carries no `expected_id`; set it in the `corrections` section of the config
/// to guard the edit.
pub fn default_corrections() -> Vec<RecordCorrection> {
    vec![RecordCorrection {
        name: "region-label-row-1544".to_string(),
        row: REGION_LABEL_FIX_ROW,
        column: columns::REGION.to_string(),
        value: "Central Himalaya".to_string(),
        expected_id: None,
    }]
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionOutcome {
    Applied {
        name: String,
        id: String,
        previous: String,
    },
    /// The table is shorter than the addressed row.
    Skipped { name: String, height: usize },
    /// The addressed row holds a different lake than the correction names.
    IdMismatch {
        name: String,
        expected: String,
        found: String,
    },
}

/// Applies every correction in order and returns the corrected frame.
pub fn apply_corrections(
    frame: &LakeFrame,
    corrections: &[RecordCorrection],
) -> Result<(LakeFrame, Vec<CorrectionOutcome>), DataError> {
    let mut current = frame.clone();
    let mut outcomes = Vec::with_capacity(corrections.len());
    for correction in corrections {
        let (next, outcome) = apply_one(&current, correction)?;
        match &outcome {
            CorrectionOutcome::Applied { name, id, previous } => log::info!(
                "Correction '{}': set {} of lake {} (row {}) from '{}' to '{}'",
                name,
                correction.column,
                id,
                correction.row,
                previous,
                correction.value
            ),
            CorrectionOutcome::Skipped { name, height } => log::warn!(
                "Correction '{}' skipped: row {} is beyond the {} merged rows",
                name,
                correction.row,
                height
            ),
            CorrectionOutcome::IdMismatch {
                name,
                expected,
                found,
            } => log::warn!(
                "Correction '{}' skipped: row {} holds lake {}, not {}",
                name,
                correction.row,
                found,
                expected
            ),
        }
        if correction.expected_id.is_none() {
            if let CorrectionOutcome::Applied { id, .. } = &outcome {
                log::warn!(
                    "Correction '{}' has no expected lake id; applied to {} by row position only",
                    correction.name,
                    id
                );
            }
        }
        current = next;
        outcomes.push(outcome);
    }
    Ok((current, outcomes))
}

fn apply_one(
    frame: &LakeFrame,
    correction: &RecordCorrection,
) -> Result<(LakeFrame, CorrectionOutcome), DataError> {
    let invalid = |reason: String| DataError::InvalidCorrection {
        name: correction.name.clone(),
        reason,
    };
    if correction.row >= frame.height() {
        return Ok((
            frame.clone(),
            CorrectionOutcome::Skipped {
                name: correction.name.clone(),
                height: frame.height(),
            },
        ));
    }
    let id = frame.ids()[correction.row].clone();
    if let Some(expected) = &correction.expected_id {
        if expected != &id {
            return Ok((
                frame.clone(),
                CorrectionOutcome::IdMismatch {
                    name: correction.name.clone(),
                    expected: expected.clone(),
                    found: id,
                },
            ));
        }
    }

    let column = frame
        .column(&correction.column)
        .ok_or_else(|| DataError::ColumnNotFound(correction.column.clone()))?;
    let (replacement, previous) = match column {
        Column::Categorical(factor) => (
            Column::Categorical(factor.relabel(correction.row, &correction.value)),
            factor.label(correction.row).unwrap_or("<missing>").to_string(),
        ),
        Column::Numeric(values) => {
            let parsed: f64 = correction
                .value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("'{}' is not a number", correction.value)))?;
            let mut updated = values.clone();
            updated[correction.row] = parsed;
            (Column::Numeric(updated), values[correction.row].to_string())
        }
    };
    let corrected = frame.replace_column(&correction.column, replacement)?;
    Ok((
        corrected,
        CorrectionOutcome::Applied {
            name: correction.name.clone(),
            id,
            previous,
        },
    ))
}
