//! In-memory tables
//!
//! A `Table` is a row-oriented set of cells with ordered, named columns. Every
//! pipeline stage consumes a table and returns a new one, so the column layout
//! and row order seen by the next stage are always explicit.
//!
//! Column names are normalized on load (trimmed, lowercased, whitespace runs
//! replaced by `_`) so that `"Start Time"` and `"start_time"` resolve to the
//! same column.

use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::PipelineError;

/// Output format for timestamp cells
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Text values treated as missing when a CSV is loaded
const NULL_MARKERS: &[&str] = &["", "nan", "NaN", "NA", "N/A", "null", "NULL", "None", "NaT"];

/// A single cell
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Time(NaiveDateTime),
}

impl Value {
    /// Infer a typed value from a raw CSV field
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if NULL_MARKERS.contains(&trimmed) {
            return Value::Null;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Value::Number(n),
            _ => Value::Text(raw.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the cell; text is parsed, anything else is `None`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the cell the way it is written to CSV
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Time(t) => t.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Time(_) => 0,
            Value::Number(_) => 1,
            Value::Text(_) => 2,
            Value::Null => 3,
        }
    }

    /// Total order used for sorting: nulls last, then by type, then by value
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Text(s) => s.hash(state),
            // -0.0 and 0.0 compare equal, so they must hash equal
            Value::Number(n) => (if *n == 0.0 { 0.0f64 } else { *n }).to_bits().hash(state),
            Value::Time(t) => t.hash(state),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(t: NaiveDateTime) -> Self {
        Value::Time(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Normalize a header into a lowercase, underscore-separated column name
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Row-oriented table with ordered column names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table with the given columns
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Fail with `MissingColumns` listing every absent name
    pub fn require_columns(&self, table: &str, names: &[String]) -> Result<(), PipelineError> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !self.has_column(n))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MissingColumns {
                table: table.to_string(),
                columns: missing,
            })
        }
    }

    /// Append a row, padding or truncating it to the column count
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Iterate one column's cells in row order
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = &Value> + '_> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |r| &r[idx]))
    }

    /// Numeric view of a column (non-numeric cells become `None`)
    pub fn numeric_column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        self.column(name).map(|it| it.map(Value::as_f64).collect())
    }

    /// Set a column's values, appending the column if it does not exist
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    /// Apply `f` to every cell of a column in place
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> bool
    where
        F: FnMut(&Value) -> Value,
    {
        let Some(idx) = self.column_index(name) else {
            return false;
        };
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
        true
    }

    /// Keep rows for which `keep` returns true; returns the number dropped
    pub fn retain_rows<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&[Value]) -> bool,
    {
        let before = self.rows.len();
        self.rows.retain(|r| keep(r));
        before - self.rows.len()
    }

    /// Drop rows that have a null in any of the given (present) columns
    pub fn drop_nulls(&mut self, columns: &[String]) -> usize {
        let indices: Vec<usize> = columns.iter().filter_map(|c| self.column_index(c)).collect();
        self.retain_rows(|row| indices.iter().all(|&i| !row[i].is_null()))
    }

    /// Drop exact full-row duplicates, keeping the first occurrence
    pub fn dedup_rows(&mut self) -> usize {
        let mut seen: HashSet<Vec<Value>> = HashSet::with_capacity(self.rows.len());
        self.retain_rows(|row| seen.insert(row.to_vec()))
    }

    /// Stable sort by the given columns (absent columns are ignored)
    pub fn sort_by_columns(&mut self, columns: &[&str]) {
        let indices: Vec<usize> = columns.iter().filter_map(|c| self.column_index(c)).collect();
        if indices.is_empty() {
            return;
        }
        self.rows.sort_by(|a, b| {
            indices
                .iter()
                .map(|&i| a[i].sort_cmp(&b[i]))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }

    /// Read a CSV stream with a header row
    pub fn read_csv<R: Read>(reader: R) -> Result<Table, PipelineError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let mut columns: Vec<String> = Vec::new();
        for header in csv_reader.headers()?.iter() {
            let base = normalize_column_name(header);
            let mut name = base.clone();
            let mut n = 1;
            while columns.contains(&name) {
                name = format!("{base}.{n}");
                n += 1;
            }
            columns.push(name);
        }

        let mut table = Table::new(columns);
        for record in csv_reader.records() {
            let record = record?;
            table.push_row(record.iter().map(Value::infer).collect());
        }
        Ok(table)
    }

    /// Write the table as CSV with a header row
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), PipelineError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for row in &self.rows {
            csv_writer.write_record(row.iter().map(Value::render))?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn read_csv_path(path: impl AsRef<Path>) -> Result<Table, PipelineError> {
        let path = path.as_ref();
        log::debug!("Reading {}", path.display());
        let file = File::open(path)?;
        Self::read_csv(file)
    }

    pub fn write_csv_path(&self, path: impl AsRef<Path>) -> Result<(), PipelineError> {
        let path = path.as_ref();
        log::debug!("Writing {} rows to {}", self.len(), path.display());
        let file = File::create(path)?;
        self.write_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_read_csv_normalizes_headers_and_infers_types() {
        let csv = "Start Time , Rat Minutes,note\n30/12/2017 18:37,1.5,hello\n,NaN,\n";
        let table = Table::read_csv(csv.as_bytes()).unwrap();

        assert_eq!(table.columns(), &["start_time", "rat_minutes", "note"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0, "rat_minutes"), Some(&Value::Number(1.5)));
        assert_eq!(table.get(0, "note"), Some(&Value::Text("hello".into())));
        assert!(table.get(1, "start_time").unwrap().is_null());
        assert!(table.get(1, "rat_minutes").unwrap().is_null());
    }

    #[test]
    fn test_duplicate_headers_get_suffix() {
        let table = Table::read_csv("a,A,a\n1,2,3\n".as_bytes()).unwrap();
        assert_eq!(table.columns(), &["a", "a.1", "a.2"]);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let table = Table::read_csv("a,b,c\n1\n".as_bytes()).unwrap();
        assert_eq!(table.rows()[0].len(), 3);
        assert!(table.get(0, "c").unwrap().is_null());
    }

    #[test]
    fn test_write_csv_renders_values() {
        let mut table = Table::new(["t", "n", "s"]);
        table.push_row(vec![at(9, 30).into(), Value::Number(2.0), Value::Null]);

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "t,n,s\n2018-01-01 09:30:00,2,\n"
        );
    }

    #[test]
    fn test_subsecond_times_survive_csv_roundtrip() {
        use crate::datetime::{parse_value, DateOrder};

        let t = NaiveDate::from_ymd_opt(2018, 1, 1)
            .unwrap()
            .and_hms_milli_opt(9, 29, 59, 250)
            .unwrap();
        let mut table = Table::new(["t"]);
        table.push_row(vec![t.into()]);

        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out.clone()).unwrap(), "t\n2018-01-01 09:29:59.250\n");

        let reloaded = Table::read_csv(out.as_slice()).unwrap();
        assert_eq!(parse_value(reloaded.get(0, "t").unwrap(), DateOrder::DayFirst), Some(t));
    }

    #[test]
    fn test_dedup_and_drop_nulls() {
        let mut table = Table::new(["a", "b"]);
        table.push_row(vec![Value::Number(1.0), "x".into()]);
        table.push_row(vec![Value::Number(1.0), "x".into()]);
        table.push_row(vec![Value::Null, "y".into()]);
        table.push_row(vec![Value::Number(-0.0), "z".into()]);
        table.push_row(vec![Value::Number(0.0), "z".into()]);

        assert_eq!(table.dedup_rows(), 2);
        assert_eq!(table.drop_nulls(&["a".to_string(), "missing".to_string()]), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_sort_puts_nulls_last() {
        let mut table = Table::new(["t", "n"]);
        table.push_row(vec![at(10, 0).into(), Value::Number(1.0)]);
        table.push_row(vec![Value::Null, Value::Number(2.0)]);
        table.push_row(vec![at(9, 0).into(), Value::Number(3.0)]);
        table.push_row(vec![at(9, 0).into(), Value::Null]);
        table.push_row(vec![at(9, 0).into(), Value::Number(0.5)]);

        table.sort_by_columns(&["t", "n"]);

        let order: Vec<Option<f64>> = table.column("n").unwrap().map(Value::as_f64).collect();
        assert_eq!(order, vec![Some(0.5), Some(3.0), None, Some(1.0), Some(2.0)]);
    }

    #[test]
    fn test_require_columns_lists_all_missing() {
        let table = Table::new(["a"]);
        let err = table
            .require_columns("events", &["a".into(), "b".into(), "c".into()])
            .unwrap_err();
        match err {
            PipelineError::MissingColumns { table, columns } => {
                assert_eq!(table, "events");
                assert_eq!(columns, vec!["b".to_string(), "c".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_set_column_appends_or_replaces() {
        let mut table = Table::new(["a"]);
        table.push_row(vec![Value::Number(1.0)]);
        table.set_column("b", vec![Value::Number(2.0)]);
        table.set_column("a", vec![Value::Number(5.0)]);

        assert_eq!(table.columns(), &["a", "b"]);
        assert_eq!(table.get(0, "a"), Some(&Value::Number(5.0)));
    }
}
