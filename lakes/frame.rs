//! The immutable lake table shared by every model.
//!
//! A `LakeFrame` is never modified in place: adding, replacing or selecting
//! columns and rows returns a new frame. Columns are reference counted, so a
//! derived frame shares every column it did not change with its parent and a
//! prepared frame can be handed to concurrently fitted models without copies.

use crate::lakes::data::DataError;
use ndarray::Array1;
use std::cmp::Ordering;
use std::sync::Arc;

/// A categorical column: an ordered level set plus one optional code per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Categorical {
    levels: Vec<String>,
    codes: Vec<Option<usize>>,
}

impl Categorical {
    /// Builds a nominal factor. Levels are the distinct labels in natural
    /// sort order, so "Region 2" precedes "Region 10".
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let labels: Vec<Option<String>> = labels
            .into_iter()
            .map(|l| l.map(|s| s.as_ref().to_string()))
            .collect();
        let mut levels: Vec<String> = labels.iter().flatten().cloned().collect();
        levels.sort_by(|a, b| natord::compare(a, b));
        levels.dedup();
        let codes = labels
            .iter()
            .map(|l| {
                l.as_ref()
                    .and_then(|s| levels.iter().position(|level| level == s))
            })
            .collect();
        Self { levels, codes }
    }

    /// Builds an ordinal factor from explicit levels and codes.
    ///
    /// # Panics
    /// Panics if a code does not index into `levels`.
    pub fn with_levels(levels: Vec<String>, codes: Vec<Option<usize>>) -> Self {
        assert!(
            codes.iter().flatten().all(|&c| c < levels.len()),
            "categorical code out of range"
        );
        Self { levels, codes }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn codes(&self) -> &[Option<usize>] {
        &self.codes
    }

    pub fn code(&self, row: usize) -> Option<usize> {
        self.codes[row]
    }

    pub fn label(&self, row: usize) -> Option<&str> {
        self.codes[row].map(|c| self.levels[c].as_str())
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Returns a copy with one row relabelled, adding the level if it is new.
    pub fn relabel(&self, row: usize, label: &str) -> Self {
        let mut levels = self.levels.clone();
        let code = match levels.iter().position(|l| l == label) {
            Some(code) => code,
            None => {
                levels.push(label.to_string());
                levels.len() - 1
            }
        };
        let mut codes = self.codes.clone();
        codes[row] = Some(code);
        Self { levels, codes }
    }

    fn take(&self, rows: &[usize]) -> Self {
        Self {
            levels: self.levels.clone(),
            codes: rows.iter().map(|&r| self.codes[r]).collect(),
        }
    }
}

/// One column of a `LakeFrame`. Missing numeric values are NaN.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Array1<f64>),
    Categorical(Categorical),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Categorical(factor) => factor.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Numeric(values) => !values[row].is_finite(),
            Column::Categorical(factor) => factor.code(row).is_none(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Numeric(_) => "numeric",
            Column::Categorical(_) => "categorical",
        }
    }

    fn take(&self, rows: &[usize]) -> Self {
        match self {
            Column::Numeric(values) => Column::Numeric(rows.iter().map(|&r| values[r]).collect()),
            Column::Categorical(factor) => Column::Categorical(factor.take(rows)),
        }
    }
}

#[derive(Debug, Clone)]
struct NamedColumn {
    name: String,
    values: Arc<Column>,
}

/// An immutable table of lakes keyed by identifier.
#[derive(Debug, Clone)]
pub struct LakeFrame {
    ids: Arc<[String]>,
    columns: Vec<NamedColumn>,
}

impl LakeFrame {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids: ids.into(),
            columns: Vec::new(),
        }
    }

    pub fn height(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.values.as_ref())
    }

    pub fn numeric(&self, name: &str) -> Result<&Array1<f64>, DataError> {
        match self.column(name) {
            Some(Column::Numeric(values)) => Ok(values),
            Some(other) => Err(DataError::ColumnWrongType {
                column_name: name.to_string(),
                expected_type: "numeric",
                found_type: other.type_name().to_string(),
            }),
            None => Err(DataError::ColumnNotFound(name.to_string())),
        }
    }

    pub fn categorical(&self, name: &str) -> Result<&Categorical, DataError> {
        match self.column(name) {
            Some(Column::Categorical(factor)) => Ok(factor),
            Some(other) => Err(DataError::ColumnWrongType {
                column_name: name.to_string(),
                expected_type: "categorical",
                found_type: other.type_name().to_string(),
            }),
            None => Err(DataError::ColumnNotFound(name.to_string())),
        }
    }

    /// Returns a new frame with one more column.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, DataError> {
        if self.column(name).is_some() {
            return Err(DataError::DuplicateColumn(name.to_string()));
        }
        self.check_length(name, &column)?;
        let mut columns = self.columns.clone();
        columns.push(NamedColumn {
            name: name.to_string(),
            values: Arc::new(column),
        });
        Ok(Self {
            ids: Arc::clone(&self.ids),
            columns,
        })
    }

    /// Returns a new frame in which an existing column is swapped for `column`.
    pub fn replace_column(&self, name: &str, column: Column) -> Result<Self, DataError> {
        self.check_length(name, &column)?;
        let position = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        let mut columns = self.columns.clone();
        columns[position].values = Arc::new(column);
        Ok(Self {
            ids: Arc::clone(&self.ids),
            columns,
        })
    }

    /// Selects rows by index, in the given order.
    pub fn take(&self, rows: &[usize]) -> Self {
        let ids: Vec<String> = rows.iter().map(|&r| self.ids[r].clone()).collect();
        Self {
            ids: ids.into(),
            columns: self
                .columns
                .iter()
                .map(|c| NamedColumn {
                    name: c.name.clone(),
                    values: Arc::new(c.values.take(rows)),
                })
                .collect(),
        }
    }

    /// Indices of the rows with a value in every named column.
    pub fn complete_rows(&self, names: &[&str]) -> Result<Vec<usize>, DataError> {
        let selected = names
            .iter()
            .map(|name| {
                self.column(name)
                    .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.height())
            .filter(|&row| selected.iter().all(|c| !c.is_missing(row)))
            .collect())
    }

    /// Row index of a lake identifier.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|candidate| candidate == id)
    }

    fn check_length(&self, name: &str, column: &Column) -> Result<(), DataError> {
        match column.len().cmp(&self.height()) {
            Ordering::Equal => Ok(()),
            _ => Err(DataError::LengthMismatch {
                column: name.to_string(),
                expected: self.height(),
                found: column.len(),
            }),
        }
    }
}
