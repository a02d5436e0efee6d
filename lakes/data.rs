//! # Lake Table Loading and Merging
//!
//! This module is the exclusive entry point for the two raw lake tables: the
//! lake inventory (identifier, region, elevation, areas at the three census
//! years, GLOF history, mass balance) and the climate table (precipitation
//! climatologies). Both are read with the `polars` CSV reader, validated
//! against the configured `LakeSchema`, and merged with inner-join semantics
//! into a `LakeFrame` whose column names are the canonical names in
//! [`columns`], regardless of how the raw files spell them.
//!
//! - Strict join: the identifier must exist in both tables and be unique in
//!   each; a lake missing from either table is dropped.
//! - Stable order: merged rows keep the order of the lake inventory, so record
//!   corrections addressed by row stay meaningful.
//! - Missing values are kept as NaN (numeric) or `None` (labels). Which rows a
//!   model can use is decided per model, never here.

use crate::lakes::frame::{Categorical, Column, LakeFrame};
use ahash::{AHashMap, AHashSet};
use ndarray::Array1;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Canonical column names of the merged lake table.
pub mod columns {
    pub const REGION: &str = "region";
    pub const MIN_ELEVATION: &str = "min_elevation";
    pub const CATCHMENT_AREA: &str = "catchment_area";
    pub const AREA_1990: &str = "area_1990";
    pub const AREA_2005: &str = "area_2005";
    pub const AREA_2018: &str = "area_2018";
    pub const GLOF: &str = "glof";
    pub const GLOF_YEAR: &str = "glof_year";
    pub const MASS_BALANCE: &str = "mass_balance";
    pub const SUMMER_PRECIPITATION: &str = "summer_precipitation";
    pub const ANNUAL_PRECIPITATION: &str = "annual_precipitation";
}

/// A comprehensive error type for all data loading, merging and derivation failures.
/// Every variant is fatal: the pipeline never fits a model on invalid input.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in either input table. Please check the [schema] section of the configuration."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("The join key '{key}' is not present in the {table} table.")]
    JoinKeyMissing { table: &'static str, key: String },
    #[error(
        "Joining the lake table ({primary_rows} rows) with the climate table ({secondary_rows} rows) produced zero rows. Do the identifiers use the same format?"
    )]
    EmptyJoin {
        primary_rows: usize,
        secondary_rows: usize,
    },
    #[error("The identifier '{id}' appears more than once in the {table} table.")]
    DuplicateIdentifier { table: &'static str, id: String },
    #[error("Quantile bucketing of '{column}' asked for {buckets} buckets but {labels} labels were supplied.")]
    LabelCountMismatch {
        column: String,
        buckets: usize,
        labels: usize,
    },
    #[error(
        "Column '{column}' has too few distinct values to form {buckets} quantile buckets (duplicate cut points)."
    )]
    NotEnoughDistinctValues { column: String, buckets: usize },
    #[error("Column '{column}' has {found} rows but the table has {expected}.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("A column named '{0}' already exists in the table.")]
    DuplicateColumn(String),
    #[error("Record correction '{name}' is invalid: {reason}")]
    InvalidCorrection { name: String, reason: String },
}

/// Raw column names of the two input tables.
///
/// Only the quantity each column represents is fixed; the spelling in the
/// source files is configurable. Every field defaults to the canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LakeSchema {
    /// Identifier column of the lake inventory (GLIMS ID).
    pub primary_key: String,
    /// Identifier column of the climate table.
    pub secondary_key: String,
    pub region: String,
    pub min_elevation: String,
    pub catchment_area: String,
    pub area_1990: String,
    pub area_2005: String,
    pub area_2018: String,
    pub glof: String,
    pub glof_year: String,
    pub mass_balance: String,
    pub summer_precipitation: String,
    pub annual_precipitation: String,
}

impl Default for LakeSchema {
    fn default() -> Self {
        Self {
            primary_key: "glims_id".to_string(),
            secondary_key: "glims_id".to_string(),
            region: columns::REGION.to_string(),
            min_elevation: columns::MIN_ELEVATION.to_string(),
            catchment_area: columns::CATCHMENT_AREA.to_string(),
            area_1990: columns::AREA_1990.to_string(),
            area_2005: columns::AREA_2005.to_string(),
            area_2018: columns::AREA_2018.to_string(),
            glof: columns::GLOF.to_string(),
            glof_year: columns::GLOF_YEAR.to_string(),
            mass_balance: columns::MASS_BALANCE.to_string(),
            summer_precipitation: columns::SUMMER_PRECIPITATION.to_string(),
            annual_precipitation: columns::ANNUAL_PRECIPITATION.to_string(),
        }
    }
}

impl LakeSchema {
    /// (canonical name, raw name) pairs for every numeric quantity.
    fn numeric_fields(&self) -> [(&'static str, &str); 10] {
        [
            (columns::MIN_ELEVATION, &self.min_elevation),
            (columns::CATCHMENT_AREA, &self.catchment_area),
            (columns::AREA_1990, &self.area_1990),
            (columns::AREA_2005, &self.area_2005),
            (columns::AREA_2018, &self.area_2018),
            (columns::GLOF, &self.glof),
            (columns::GLOF_YEAR, &self.glof_year),
            (columns::MASS_BALANCE, &self.mass_balance),
            (columns::SUMMER_PRECIPITATION, &self.summer_precipitation),
            (columns::ANNUAL_PRECIPITATION, &self.annual_precipitation),
        ]
    }
}

/// Reads one delimited table with a header row.
pub fn read_table(path: &Path, separator: u8) -> Result<DataFrame, DataError> {
    log::info!("Loading table from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;
    log::info!(
        "Loaded {} rows and {} columns from '{}'",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(df)
}

/// Inner-joins the lake inventory (`primary`) with the climate table
/// (`secondary`) on the schema's join keys and returns the merged table under
/// canonical column names.
///
/// Each required quantity is looked up in the lake inventory first and in the
/// climate table second, so either file may carry any column.
pub fn load_and_merge(
    primary: &DataFrame,
    secondary: &DataFrame,
    schema: &LakeSchema,
) -> Result<LakeFrame, DataError> {
    let primary_ids = internal::extract_ids(primary, &schema.primary_key, "lake")?;
    let secondary_ids = internal::extract_ids(secondary, &schema.secondary_key, "climate")?;

    let mut secondary_index: AHashMap<&str, usize> = AHashMap::with_capacity(secondary_ids.len());
    for (row, id) in secondary_ids.iter().enumerate() {
        if let Some(id) = id {
            if secondary_index.insert(id.as_str(), row).is_some() {
                return Err(DataError::DuplicateIdentifier {
                    table: "climate",
                    id: id.clone(),
                });
            }
        }
    }

    let mut seen: AHashSet<&str> = AHashSet::with_capacity(primary_ids.len());
    let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(primary_ids.len());
    for (row, id) in primary_ids.iter().enumerate() {
        let Some(id) = id else { continue };
        if !seen.insert(id.as_str()) {
            return Err(DataError::DuplicateIdentifier {
                table: "lake",
                id: id.clone(),
            });
        }
        if let Some(&other) = secondary_index.get(id.as_str()) {
            pairs.push((row, other));
        }
    }

    if pairs.is_empty() {
        return Err(DataError::EmptyJoin {
            primary_rows: primary.height(),
            secondary_rows: secondary.height(),
        });
    }
    log::info!(
        "Inner join kept {} of {} lakes ({} climate records)",
        pairs.len(),
        primary.height(),
        secondary.height()
    );

    let ids: Vec<String> = pairs
        .iter()
        .filter_map(|&(row, _)| primary_ids[row].clone())
        .collect();
    let mut frame = LakeFrame::new(ids);

    let excluded = [schema.primary_key.as_str(), schema.secondary_key.as_str()];
    for (canonical, raw) in schema.numeric_fields() {
        let values = match internal::locate(primary, secondary, raw, &excluded)? {
            internal::Side::Primary => {
                let all = internal::extract_numeric(primary, raw)?;
                pairs.iter().map(|&(row, _)| all[row]).collect::<Vec<_>>()
            }
            internal::Side::Secondary => {
                let all = internal::extract_numeric(secondary, raw)?;
                pairs.iter().map(|&(_, row)| all[row]).collect::<Vec<_>>()
            }
        };
        frame = frame.with_column(canonical, Column::Numeric(Array1::from_vec(values)))?;
    }

    let labels = match internal::locate(primary, secondary, &schema.region, &excluded)? {
        internal::Side::Primary => {
            let all = internal::extract_labels(primary, &schema.region)?;
            pairs
                .iter()
                .map(|&(row, _)| all[row].clone())
                .collect::<Vec<_>>()
        }
        internal::Side::Secondary => {
            let all = internal::extract_labels(secondary, &schema.region)?;
            pairs
                .iter()
                .map(|&(_, row)| all[row].clone())
                .collect::<Vec<_>>()
        }
    };
    frame = frame.with_column(
        columns::REGION,
        Column::Categorical(Categorical::from_labels(labels)),
    )?;

    Ok(frame)
}

mod internal {
    use super::*;

    pub(super) enum Side {
        Primary,
        Secondary,
    }

    fn has_column(df: &DataFrame, name: &str) -> bool {
        df.get_column_names().iter().any(|c| c.as_str() == name)
    }

    pub(super) fn locate(
        primary: &DataFrame,
        secondary: &DataFrame,
        name: &str,
        excluded: &[&str],
    ) -> Result<Side, DataError> {
        if has_column(primary, name) {
            Ok(Side::Primary)
        } else if has_column(secondary, name) && !excluded.contains(&name) {
            Ok(Side::Secondary)
        } else {
            Err(DataError::ColumnNotFound(name.to_string()))
        }
    }

    pub(super) fn extract_ids(
        df: &DataFrame,
        key: &str,
        table: &'static str,
    ) -> Result<Vec<Option<String>>, DataError> {
        if !has_column(df, key) {
            return Err(DataError::JoinKeyMissing {
                table,
                key: key.to_string(),
            });
        }
        let ids = extract_labels(df, key)?;
        Ok(ids
            .into_iter()
            .map(|id| id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
            .collect())
    }

    pub(super) fn extract_labels(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let series = df.column(column_name)?;
        let casted = series.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|value| {
                value
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect();
        Ok(values)
    }

    /// Numeric extraction that keeps missing entries as NaN. A cast that turns
    /// present values into nulls means the column holds text.
    pub(super) fn extract_numeric(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let casted = series.cast(&DataType::Float64)?;
        if casted.null_count() > series.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let values = casted
            .f64()?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        Ok(values)
    }
}
