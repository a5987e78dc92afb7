//! Tabular dataset model supplied by the ingestion pipeline.
//!
//! A [`Dataset`] is immutable once built. Every cleaning helper returns new
//! owned values (jointly aligned, missing values dropped) instead of editing
//! the columns in place, so one dataset can back any number of steps.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::AnalysisError;

/// Errors raised while building a dataset from external input.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Column '{column}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Column '{column}' row {row}: {message}")]
    InvalidValue {
        column: String,
        row: usize,
        message: String,
    },
}

/// Inferred or declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Numeric,
    Categorical,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Numeric => "numeric",
            ColumnType::Categorical => "categorical",
        }
    }
}

/// A single column; `None` marks a missing value.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl Column {
    /// Numeric column from plain values (NaN becomes missing).
    pub fn numeric(values: impl IntoIterator<Item = f64>) -> Self {
        Column::Numeric(
            values
                .into_iter()
                .map(|v| if v.is_finite() { Some(v) } else { None })
                .collect(),
        )
    }

    /// Categorical column from plain labels.
    pub fn categorical<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Column::Categorical(values.into_iter().map(|v| Some(v.into())).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::Numeric(_) => ColumnType::Numeric,
            Column::Categorical(_) => ColumnType::Categorical,
        }
    }

    /// Row value rendered as a category label.
    pub fn label(&self, row: usize) -> Option<String> {
        match self {
            Column::Numeric(v) => v.get(row).copied().flatten().map(format_label),
            Column::Categorical(v) => v.get(row).cloned().flatten(),
        }
    }

    /// Row value as a number. Categorical cells are parsed when possible.
    pub fn number(&self, row: usize) -> Option<f64> {
        match self {
            Column::Numeric(v) => v.get(row).copied().flatten(),
            Column::Categorical(v) => v
                .get(row)
                .and_then(|s| s.as_deref())
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|x| x.is_finite()),
        }
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(v) => Column::Numeric(rows.iter().map(|&r| v[r]).collect()),
            Column::Categorical(v) => {
                Column::Categorical(rows.iter().map(|&r| v[r].clone()).collect())
            }
        }
    }
}

/// Render a numeric category code without a trailing `.0`.
pub fn format_label(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Order labels numerically when both parse as numbers, else lexically.
pub fn compare_labels(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Numeric samples split by a grouping column, in label order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedSamples {
    pub groups: Vec<(String, Vec<f64>)>,
}

impl GroupedSamples {
    pub fn labels(&self) -> Vec<String> {
        self.groups.iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn samples(&self) -> Vec<&[f64]> {
        self.groups.iter().map(|(_, s)| s.as_slice()).collect()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Within-subject samples: `samples[j][i]` is subject `i` at level `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedSamples {
    pub labels: Vec<String>,
    pub samples: Vec<Vec<f64>>,
    /// Subjects without a value at every level.
    pub dropped_subjects: usize,
}

impl PairedSamples {
    pub fn n_subjects(&self) -> usize {
        self.samples.first().map(Vec::len).unwrap_or(0)
    }
}

/// Immutable tabular dataset keyed by a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDataset", into = "RawDataset")]
pub struct Dataset {
    id: String,
    columns: BTreeMap<String, Column>,
    n_rows: usize,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            columns: BTreeMap::new(),
            n_rows: 0,
        }
    }

    /// Return a new dataset with `column` added under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::LengthMismatch`] if the column length differs
    /// from the existing columns.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: Column,
    ) -> Result<Self, DatasetError> {
        let name = name.into();
        if !self.columns.is_empty() && column.len() != self.n_rows {
            return Err(DatasetError::LengthMismatch {
                column: name,
                expected: self.n_rows,
                actual: column.len(),
            });
        }
        self.n_rows = column.len();
        self.columns.insert(name, column);
        Ok(self)
    }

    /// Parse a dataset from its JSON form.
    pub fn from_json_str(json: &str) -> Result<Self, DatasetError> {
        let raw: RawDataset = serde_json::from_str(json)?;
        Dataset::try_from(raw)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// Column name to type metadata.
    pub fn types(&self) -> BTreeMap<String, ColumnType> {
        self.columns
            .iter()
            .map(|(name, col)| (name.clone(), col.column_type()))
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Result<&Column, AnalysisError> {
        self.columns
            .get(name)
            .ok_or_else(|| AnalysisError::ColumnNotFound(name.to_string()))
    }

    pub fn column_type(&self, name: &str) -> Result<ColumnType, AnalysisError> {
        Ok(self.column(name)?.column_type())
    }

    /// Borrow a numeric column.
    pub fn numeric(&self, name: &str) -> Result<&[Option<f64>], AnalysisError> {
        match self.column(name)? {
            Column::Numeric(v) => Ok(v),
            Column::Categorical(_) => Err(AnalysisError::IncompatibleColumn {
                column: name.to_string(),
                expected: ColumnType::Numeric.as_str().to_string(),
                actual: ColumnType::Categorical.as_str().to_string(),
            }),
        }
    }

    /// Non-missing values of a numeric column.
    pub fn clean_numeric(&self, name: &str) -> Result<Vec<f64>, AnalysisError> {
        Ok(self.numeric(name)?.iter().flatten().copied().collect())
    }

    /// Sorted distinct non-missing labels of any column.
    pub fn distinct_labels(&self, name: &str) -> Result<Vec<String>, AnalysisError> {
        let column = self.column(name)?;
        let mut labels: Vec<String> = (0..self.n_rows).filter_map(|r| column.label(r)).collect();
        labels.sort_by(|a, b| compare_labels(a, b));
        labels.dedup();
        Ok(labels)
    }

    /// Row indices where every listed column is present.
    pub fn complete_rows(&self, names: &[&str]) -> Result<Vec<usize>, AnalysisError> {
        let columns = names
            .iter()
            .map(|n| self.column(n))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.n_rows)
            .filter(|&r| {
                columns.iter().all(|c| match c {
                    Column::Numeric(v) => v[r].is_some(),
                    Column::Categorical(v) => v[r].is_some(),
                })
            })
            .collect())
    }

    /// Jointly complete `(x, y)` pairs of two numeric columns.
    pub fn numeric_pairs(&self, x: &str, y: &str) -> Result<(Vec<f64>, Vec<f64>), AnalysisError> {
        let xs = self.numeric(x)?;
        let ys = self.numeric(y)?;
        Ok(xs
            .iter()
            .zip(ys)
            .filter_map(|(a, b)| Some(((*a)?, (*b)?)))
            .unzip())
    }

    /// Numeric `target` split by the labels of `group`, missing rows dropped.
    pub fn grouped_numeric(
        &self,
        target: &str,
        group: &str,
    ) -> Result<GroupedSamples, AnalysisError> {
        let values = self.numeric(target)?;
        let groups = self.column(group)?;
        let mut map: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (row, value) in values.iter().enumerate() {
            if let (Some(v), Some(label)) = (value, groups.label(row)) {
                map.entry(label).or_default().push(*v);
            }
        }
        let mut groups: Vec<(String, Vec<f64>)> = map.into_iter().collect();
        groups.sort_by(|a, b| compare_labels(&a.0, &b.0));
        Ok(GroupedSamples { groups })
    }

    /// Jointly complete label pairs of two columns.
    pub fn category_pairs(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Vec<(String, String)>, AnalysisError> {
        let ca = self.column(a)?;
        let cb = self.column(b)?;
        Ok((0..self.n_rows)
            .filter_map(|r| Some((ca.label(r)?, cb.label(r)?)))
            .collect())
    }

    /// Align `target` values across the labels of `group` for a
    /// within-subject design.
    ///
    /// With a `subject` column, subjects missing any level are dropped and
    /// counted. Without one, each level's values are paired in row order and
    /// all levels must have the same length.
    ///
    /// # Errors
    ///
    /// Returns [`AnalysisError::UnequalPairedGroups`] when row-order slices
    /// differ in length.
    pub fn paired_numeric(
        &self,
        target: &str,
        group: &str,
        subject: Option<&str>,
    ) -> Result<PairedSamples, AnalysisError> {
        let Some(subject) = subject else {
            let grouped = self.grouped_numeric(target, group)?;
            let lengths: Vec<usize> = grouped.groups.iter().map(|(_, s)| s.len()).collect();
            if lengths.windows(2).any(|w| w[0] != w[1]) {
                let detail = grouped
                    .groups
                    .iter()
                    .map(|(l, s)| format!("{} has {}", l, s.len()))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(AnalysisError::UnequalPairedGroups(detail));
            }
            let (labels, samples) = grouped.groups.into_iter().unzip();
            return Ok(PairedSamples {
                labels,
                samples,
                dropped_subjects: 0,
            });
        };

        let values = self.numeric(target)?;
        let groups = self.column(group)?;
        let subjects = self.column(subject)?;
        let labels = self.distinct_labels(group)?;
        let mut by_subject: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for (row, value) in values.iter().enumerate() {
            if let (Some(v), Some(g), Some(s)) = (value, groups.label(row), subjects.label(row)) {
                let cells = by_subject.entry(s.clone()).or_insert_with(|| {
                    order.push(s);
                    BTreeMap::new()
                });
                cells.entry(g).or_insert(*v);
            }
        }
        let mut samples = vec![Vec::new(); labels.len()];
        let mut dropped_subjects = 0;
        for s in &order {
            let cells = &by_subject[s];
            if labels.iter().all(|l| cells.contains_key(l)) {
                for (i, l) in labels.iter().enumerate() {
                    samples[i].push(cells[l]);
                }
            } else {
                dropped_subjects += 1;
            }
        }
        Ok(PairedSamples {
            labels,
            samples,
            dropped_subjects,
        })
    }

    /// A new dataset containing only `rows`, in the given order.
    pub fn select_rows(&self, id: impl Into<String>, rows: &[usize]) -> Dataset {
        Dataset {
            id: id.into(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col.select(rows)))
                .collect(),
            n_rows: rows.len(),
        }
    }

    /// Partition rows by the labels of `column`, one new dataset per label.
    pub fn split_by(&self, column: &str) -> Result<Vec<(String, Dataset)>, AnalysisError> {
        let col = self.column(column)?;
        let mut parts: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for row in 0..self.n_rows {
            if let Some(label) = col.label(row) {
                parts.entry(label).or_default().push(row);
            }
        }
        let mut parts: Vec<(String, Vec<usize>)> = parts.into_iter().collect();
        parts.sort_by(|a, b| compare_labels(&a.0, &b.0));
        Ok(parts
            .into_iter()
            .map(|(label, rows)| {
                let id = format!("{}[{}={}]", self.id, column, label);
                (label, self.select_rows(id, &rows))
            })
            .collect())
    }
}

/// Wire form of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDataset {
    id: String,
    columns: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    types: BTreeMap<String, ColumnType>,
}

impl TryFrom<RawDataset> for Dataset {
    type Error = DatasetError;

    fn try_from(raw: RawDataset) -> Result<Self, Self::Error> {
        let mut dataset = Dataset::new(raw.id);
        for (name, values) in raw.columns {
            let declared = raw.types.get(&name).copied();
            let column = parse_column(&name, &values, declared)?;
            dataset = dataset.with_column(name, column)?;
        }
        Ok(dataset)
    }
}

impl From<Dataset> for RawDataset {
    fn from(dataset: Dataset) -> Self {
        let columns = dataset
            .columns
            .into_iter()
            .map(|(name, col)| {
                let values = match col {
                    Column::Numeric(v) => v
                        .into_iter()
                        .map(|x| x.map(Value::from).unwrap_or(Value::Null))
                        .collect(),
                    Column::Categorical(v) => v
                        .into_iter()
                        .map(|x| x.map(Value::String).unwrap_or(Value::Null))
                        .collect(),
                };
                (name, values)
            })
            .collect();
        RawDataset {
            id: dataset.id,
            columns,
            types: BTreeMap::new(),
        }
    }
}

fn parse_column(
    name: &str,
    values: &[Value],
    declared: Option<ColumnType>,
) -> Result<Column, DatasetError> {
    let all_numeric = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Number(_)));
    let column_type = declared.unwrap_or(if all_numeric {
        ColumnType::Numeric
    } else {
        ColumnType::Categorical
    });

    match column_type {
        ColumnType::Numeric => {
            let mut out = Vec::with_capacity(values.len());
            for (row, value) in values.iter().enumerate() {
                let parsed = match value {
                    Value::Null => None,
                    Value::Number(n) => n.as_f64().filter(|x| x.is_finite()),
                    Value::String(s) if s.trim().is_empty() => None,
                    Value::String(s) => Some(s.trim().parse::<f64>().map_err(|_| {
                        DatasetError::InvalidValue {
                            column: name.to_string(),
                            row,
                            message: format!("'{}' is not a number", s),
                        }
                    })?),
                    other => {
                        return Err(DatasetError::InvalidValue {
                            column: name.to_string(),
                            row,
                            message: format!("unsupported value {}", other),
                        })
                    }
                };
                out.push(parsed);
            }
            Ok(Column::Numeric(out))
        }
        ColumnType::Categorical => Ok(Column::Categorical(
            values
                .iter()
                .map(|value| match value {
                    Value::Null => None,
                    Value::String(s) if s.is_empty() => None,
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => n.as_f64().map(format_label),
                    Value::Bool(b) => Some(b.to_string()),
                    other => Some(other.to_string()),
                })
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new("ds")
            .with_column(
                "score",
                Column::Numeric(vec![Some(1.0), Some(2.0), None, Some(4.0), Some(5.0)]),
            )
            .unwrap()
            .with_column(
                "arm",
                Column::Categorical(vec![
                    Some("b".into()),
                    Some("a".into()),
                    Some("a".into()),
                    None,
                    Some("b".into()),
                ]),
            )
            .unwrap()
    }

    #[test]
    fn test_length_mismatch() {
        let result = Dataset::new("ds")
            .with_column("a", Column::numeric([1.0, 2.0]))
            .unwrap()
            .with_column("b", Column::numeric([1.0]));
        assert!(matches!(result, Err(DatasetError::LengthMismatch { .. })));
    }

    #[test]
    fn test_paired_numeric_by_subject() {
        let ds = Dataset::new("long")
            .with_column("y", Column::numeric([1.0, 2.0, 3.0, 4.0, 5.0]))
            .unwrap()
            .with_column("t", Column::categorical(["pre", "post", "post", "pre", "pre"]))
            .unwrap()
            .with_column("id", Column::categorical(["s1", "s1", "s2", "s2", "s3"]))
            .unwrap();
        let paired = ds.paired_numeric("y", "t", Some("id")).unwrap();
        assert_eq!(paired.labels, vec!["post", "pre"]);
        assert_eq!(paired.samples, vec![vec![2.0, 3.0], vec![1.0, 4.0]]);
        assert_eq!(paired.dropped_subjects, 1);
        assert_eq!(paired.n_subjects(), 2);
    }

    #[test]
    fn test_paired_numeric_row_order_requires_equal_lengths() {
        let err = sample().paired_numeric("score", "arm", None).unwrap_err();
        assert!(matches!(err, AnalysisError::UnequalPairedGroups(_)));
    }

    #[test]
    fn test_grouped_numeric_drops_missing() {
        let grouped = sample().grouped_numeric("score", "arm").unwrap();
        assert_eq!(grouped.labels(), vec!["a", "b"]);
        assert_eq!(grouped.groups[0].1, vec![2.0]);
        assert_eq!(grouped.groups[1].1, vec![1.0, 5.0]);
    }

    #[test]
    fn test_numeric_on_categorical_is_incompatible() {
        let err = sample().numeric("arm").unwrap_err();
        assert!(matches!(err, AnalysisError::IncompatibleColumn { .. }));
        let err = sample().numeric("nope").unwrap_err();
        assert_eq!(err, AnalysisError::ColumnNotFound("nope".into()));
    }

    #[test]
    fn test_labels_sort_numerically() {
        let ds = Dataset::new("ds")
            .with_column("g", Column::numeric([10.0, 2.0, 1.0, 2.0]))
            .unwrap();
        assert_eq!(ds.distinct_labels("g").unwrap(), vec!["1", "2", "10"]);
    }

    #[test]
    fn test_from_json_infers_types() {
        let json = r#"{
            "id": "trial",
            "columns": {
                "value": [1.5, 2, null, 4],
                "arm": ["x", "y", "x", null],
                "dose": [1, 2, 1, 2]
            },
            "types": {"dose": "categorical"}
        }"#;
        let ds = Dataset::from_json_str(json).unwrap();
        assert_eq!(ds.id(), "trial");
        assert_eq!(ds.n_rows(), 4);
        assert_eq!(ds.column_type("value").unwrap(), ColumnType::Numeric);
        assert_eq!(ds.column_type("arm").unwrap(), ColumnType::Categorical);
        assert_eq!(ds.column_type("dose").unwrap(), ColumnType::Categorical);
        assert_eq!(ds.column("dose").unwrap().label(1), Some("2".to_string()));
    }

    #[test]
    fn test_split_by_returns_new_datasets() {
        let ds = sample();
        let parts = ds.split_by("arm").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "a");
        assert_eq!(parts[0].1.n_rows(), 2);
        assert_eq!(parts[1].1.n_rows(), 2);
        // The source is untouched.
        assert_eq!(ds.n_rows(), 5);
    }

    #[test]
    fn test_numeric_pairs_are_jointly_complete() {
        let ds = Dataset::new("ds")
            .with_column("x", Column::Numeric(vec![Some(1.0), None, Some(3.0)]))
            .unwrap()
            .with_column("y", Column::Numeric(vec![Some(2.0), Some(5.0), None]))
            .unwrap();
        let (x, y) = ds.numeric_pairs("x", "y").unwrap();
        assert_eq!(x, vec![1.0]);
        assert_eq!(y, vec![2.0]);
    }
}
