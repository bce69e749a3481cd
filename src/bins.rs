//! Bin construction
//!
//! Turns a bin-side table with a parsed `bin_start` column into half-open
//! intervals `[bin_start, bin_end)`.

use chrono::Duration;
use serde::Serialize;

use crate::datetime::{parse_value, DateOrder};
use crate::error::PipelineError;
use crate::table::{Table, Value};

pub const BIN_START: &str = "bin_start";
pub const BIN_END: &str = "bin_end";

/// Explicit bin-end column names, in preference order
pub const BIN_END_ALIASES: &[&str] = &["bin_end", "end_time", "end", "stop", "finish"];

/// What the bin builder did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BinSummary {
    /// Alias the explicit ends were read from, if any
    pub end_column: Option<String>,
    pub explicit_ends: usize,
    pub defaulted_ends: usize,
    /// Bins dropped because their end was not after their start
    pub invalid_dropped: usize,
}

/// Ensures every bin has an end
#[derive(Debug, Clone)]
pub struct BinBuilder {
    bin_length: Duration,
    order: DateOrder,
}

impl BinBuilder {
    pub fn new(bin_length: Duration, order: DateOrder) -> Self {
        Self { bin_length, order }
    }

    /// Fill `bin_end` for every row with a `bin_start`
    ///
    /// The first end alias present in the table is used when it parses to at
    /// least one value; rows where it is null fall back to
    /// `bin_start + bin_length`. Rows whose end is not after their start are
    /// removed.
    pub fn build(&self, mut table: Table) -> Result<(Table, BinSummary), PipelineError> {
        table.require_columns("bins", &[BIN_START.to_string()])?;

        let mut summary = BinSummary::default();

        let explicit: Option<(String, Vec<Option<_>>)> = BIN_END_ALIASES
            .iter()
            .find(|alias| table.has_column(alias))
            .and_then(|alias| {
                let parsed: Vec<Option<_>> = table
                    .column(alias)?
                    .map(|v| parse_value(v, self.order))
                    .collect();
                if parsed.iter().any(Option::is_some) {
                    Some((alias.to_string(), parsed))
                } else {
                    log::warn!("bins: end column '{alias}' has no parseable values, using default length");
                    None
                }
            });

        let starts: Vec<Option<_>> = table
            .column(BIN_START)
            .map(|it| it.map(Value::as_time).collect())
            .unwrap_or_default();

        let ends: Vec<Value> = match &explicit {
            Some((alias, parsed)) => {
                summary.end_column = Some(alias.clone());
                starts
                    .iter()
                    .zip(parsed)
                    .map(|(start, end)| match (start, end) {
                        (_, Some(end)) => {
                            summary.explicit_ends += 1;
                            Value::Time(*end)
                        }
                        (Some(start), None) => {
                            summary.defaulted_ends += 1;
                            Value::Time(*start + self.bin_length)
                        }
                        (None, None) => Value::Null,
                    })
                    .collect()
            }
            None => starts
                .iter()
                .map(|start| match start {
                    Some(start) => {
                        summary.defaulted_ends += 1;
                        Value::Time(*start + self.bin_length)
                    }
                    None => Value::Null,
                })
                .collect(),
        };

        table.set_column(BIN_END, ends);

        let start_idx = table.column_index(BIN_START);
        let end_idx = table.column_index(BIN_END);
        if let (Some(s), Some(e)) = (start_idx, end_idx) {
            summary.invalid_dropped = table.retain_rows(|row| match (row[s].as_time(), row[e].as_time()) {
                (Some(start), Some(end)) => end > start,
                _ => true,
            });
        }

        if summary.invalid_dropped > 0 {
            log::warn!("bins: dropped {} bins ending at or before their start", summary.invalid_dropped);
        }
        log::info!(
            "bins: {} explicit ends, {} defaulted to {} minutes",
            summary.explicit_ends,
            summary.defaulted_ends,
            self.bin_length.num_minutes()
        );

        Ok((table, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 1, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn builder() -> BinBuilder {
        BinBuilder::new(Duration::minutes(30), DateOrder::DayFirst)
    }

    #[test]
    fn test_default_length_applied_without_end_column() {
        let mut table = Table::new([BIN_START, "rat_minutes"]);
        table.push_row(vec![at(9, 0).into(), Value::Number(1.0)]);
        table.push_row(vec![at(9, 30).into(), Value::Number(0.0)]);

        let (table, summary) = builder().build(table).unwrap();

        assert_eq!(table.get(0, BIN_END), Some(&Value::Time(at(9, 30))));
        assert_eq!(table.get(1, BIN_END), Some(&Value::Time(at(10, 0))));
        assert_eq!(summary.defaulted_ends, 2);
        assert_eq!(summary.end_column, None);
    }

    #[test]
    fn test_explicit_end_with_per_row_fallback() {
        let mut table = Table::new([BIN_START, "end_time"]);
        table.push_row(vec![at(9, 0).into(), "03/01/2018 09:20".into()]);
        table.push_row(vec![at(9, 30).into(), Value::Null]);

        let (table, summary) = builder().build(table).unwrap();

        assert_eq!(table.get(0, BIN_END), Some(&Value::Time(at(9, 20))));
        assert_eq!(table.get(1, BIN_END), Some(&Value::Time(at(10, 0))));
        assert_eq!(summary.end_column.as_deref(), Some("end_time"));
        assert_eq!(summary.explicit_ends, 1);
        assert_eq!(summary.defaulted_ends, 1);
    }

    #[test]
    fn test_unparseable_end_column_uses_default() {
        let mut table = Table::new([BIN_START, "stop"]);
        table.push_row(vec![at(9, 0).into(), "never".into()]);

        let (table, summary) = builder().build(table).unwrap();
        assert_eq!(table.get(0, BIN_END), Some(&Value::Time(at(9, 30))));
        assert_eq!(summary.end_column, None);
    }

    #[test]
    fn test_inverted_bins_dropped() {
        let mut table = Table::new([BIN_START, BIN_END]);
        table.push_row(vec![at(9, 0).into(), at(8, 0).into()]);
        table.push_row(vec![at(9, 30).into(), at(10, 0).into()]);

        let (table, summary) = builder().build(table).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(summary.invalid_dropped, 1);
    }

    #[test]
    fn test_missing_bin_start_is_an_error() {
        let table = Table::new(["time"]);
        assert!(matches!(
            builder().build(table),
            Err(PipelineError::MissingColumns { .. })
        ));
    }
}
