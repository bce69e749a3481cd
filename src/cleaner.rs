//! Row cleaning
//!
//! A fixed sequence of table-wide passes over the merged table:
//! 1. Parse the key time columns and fill missing bin ends
//! 2. Drop exact duplicate rows
//! 3. Drop rows with nulls in required columns
//! 4. Coerce numeric-looking columns (failed cells become null)
//! 5. Drop rows whose required columns became null
//! 6. Clip numeric columns at zero
//! 7. Fill categorical nulls with a placeholder
//! 8. Drop duplicates introduced by steps 4-7
//! 9. Derive `rat_present`
//! 10. Sort by bin start, then event time
//!
//! Only a missing required column is fatal; every other pass is skipped when
//! its columns are absent. Every drop, clip and fill is counted in the
//! returned `CleanSummary`. Running the cleaner on its own output is a no-op.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::bins::{BIN_END, BIN_START};
use crate::config::PipelineConfig;
use crate::datetime::{parse_value, DateOrder};
use crate::error::PipelineError;
use crate::matcher::EVENT_TIME;
use crate::table::{Table, Value};

pub const RAT_PRESENT: &str = "rat_present";

const TIME_COLUMNS: &[&str] = &[BIN_START, BIN_END, EVENT_TIME];

/// Definition of the `rat_present` flag
///
/// The two rules agree whenever every counter is a non-negative number. They
/// differ on nulls: `AnyPositive` treats a null counter as "no activity",
/// `AllZeroAbsent` only reports absence when every counter is exactly zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceRule {
    /// 1 iff any counter is > 0
    #[default]
    AnyPositive,
    /// 0 iff every counter is exactly 0
    AllZeroAbsent,
}

impl PresenceRule {
    pub fn evaluate(&self, counters: &[Option<f64>]) -> bool {
        match self {
            PresenceRule::AnyPositive => counters.iter().any(|c| c.is_some_and(|v| v > 0.0)),
            PresenceRule::AllZeroAbsent => !counters.iter().all(|c| *c == Some(0.0)),
        }
    }
}

/// Counts of everything the cleaner changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanSummary {
    pub rows_in: usize,
    pub bin_ends_filled: usize,
    pub duplicates_removed: usize,
    pub required_null_dropped: usize,
    /// Non-null cells that failed numeric coercion
    pub coercion_failures: usize,
    pub invalid_numeric_dropped: usize,
    pub values_clipped: usize,
    pub placeholders_filled: usize,
    pub normalized_duplicates_removed: usize,
    pub coerced_columns: Vec<String>,
    pub rat_present: Option<usize>,
    pub rat_absent: Option<usize>,
    pub rows_out: usize,
}

impl CleanSummary {
    /// True when the pass changed nothing
    pub fn is_noop(&self) -> bool {
        self.bin_ends_filled == 0
            && self.duplicates_removed == 0
            && self.required_null_dropped == 0
            && self.coercion_failures == 0
            && self.invalid_numeric_dropped == 0
            && self.values_clipped == 0
            && self.placeholders_filled == 0
            && self.normalized_duplicates_removed == 0
            && self.rows_in == self.rows_out
    }
}

/// Deterministic cleaning passes over a merged table
#[derive(Debug, Clone)]
pub struct RowCleaner {
    order: DateOrder,
    bin_length: Duration,
    required: Vec<String>,
    numeric_columns: Vec<String>,
    numeric_keywords: Vec<String>,
    presence_columns: Vec<String>,
    presence_rule: PresenceRule,
    categorical_columns: Vec<String>,
    placeholder: String,
}

impl RowCleaner {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            order: config.date_order,
            bin_length: config.bin_length(),
            required: config.required_columns.clone(),
            numeric_columns: config.numeric_columns.clone(),
            numeric_keywords: config.numeric_keywords.clone(),
            presence_columns: config.presence_columns.clone(),
            presence_rule: config.presence_rule,
            categorical_columns: config.categorical_columns.clone(),
            placeholder: config.categorical_placeholder.clone(),
        }
    }

    /// Columns to coerce: the explicit list plus keyword matches
    fn numeric_targets(&self, table: &Table) -> Vec<String> {
        table
            .columns()
            .iter()
            .filter(|c| !TIME_COLUMNS.contains(&c.as_str()) && c.as_str() != RAT_PRESENT)
            .filter(|c| {
                self.numeric_columns.iter().any(|n| n == *c)
                    || self.numeric_keywords.iter().any(|k| c.contains(k.as_str()))
            })
            .cloned()
            .collect()
    }

    pub fn clean(&self, mut table: Table) -> Result<(Table, CleanSummary), PipelineError> {
        table.require_columns("merged", &self.required)?;

        let mut summary = CleanSummary {
            rows_in: table.len(),
            ..Default::default()
        };

        for column in TIME_COLUMNS {
            table.map_column(column, |v| Value::from(parse_value(v, self.order)));
        }
        if let (Some(s), Some(e)) = (table.column_index(BIN_START), table.column_index(BIN_END)) {
            let filled: Vec<Value> = table
                .rows()
                .iter()
                .map(|row| match (row[s].as_time(), row[e].as_time()) {
                    (Some(start), None) => {
                        summary.bin_ends_filled += 1;
                        Value::Time(start + self.bin_length)
                    }
                    _ => row[e].clone(),
                })
                .collect();
            table.set_column(BIN_END, filled);
        }

        summary.duplicates_removed = table.dedup_rows();
        log::info!("clean: dropped {} duplicate rows", summary.duplicates_removed);

        summary.required_null_dropped = table.drop_nulls(&self.required);
        log::info!(
            "clean: dropped {} rows with nulls in [{}]",
            summary.required_null_dropped,
            self.required.join(", ")
        );

        let targets = self.numeric_targets(&table);
        for column in &targets {
            table.map_column(column, |v| match v {
                Value::Null => Value::Null,
                other => match other.as_f64() {
                    Some(n) => Value::Number(n),
                    None => {
                        summary.coercion_failures += 1;
                        Value::Null
                    }
                },
            });
        }
        if summary.coercion_failures > 0 {
            log::warn!("clean: {} cells failed numeric coercion", summary.coercion_failures);
        }

        summary.invalid_numeric_dropped = table.drop_nulls(&self.required);
        log::info!(
            "clean: dropped {} rows with invalid numeric values",
            summary.invalid_numeric_dropped
        );

        for column in &targets {
            table.map_column(column, |v| match v {
                Value::Number(n) if *n < 0.0 => {
                    summary.values_clipped += 1;
                    Value::Number(0.0)
                }
                other => other.clone(),
            });
        }
        if summary.values_clipped > 0 {
            log::info!("clean: clipped {} negative values to 0", summary.values_clipped);
        }

        for column in &self.categorical_columns {
            table.map_column(column, |v| {
                if v.is_null() {
                    summary.placeholders_filled += 1;
                    Value::Text(self.placeholder.clone())
                } else {
                    v.clone()
                }
            });
        }

        summary.normalized_duplicates_removed = table.dedup_rows();
        summary.coerced_columns = targets;

        let counters: Vec<usize> = self
            .presence_columns
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        if counters.is_empty() {
            log::warn!("clean: no rat-activity counters present, skipping {RAT_PRESENT}");
        } else {
            let flags: Vec<Value> = table
                .rows()
                .iter()
                .map(|row| {
                    let values: Vec<Option<f64>> = counters.iter().map(|&i| row[i].as_f64()).collect();
                    let present = self.presence_rule.evaluate(&values);
                    Value::Number(if present { 1.0 } else { 0.0 })
                })
                .collect();
            let present = flags.iter().filter(|v| v.as_f64() == Some(1.0)).count();
            summary.rat_present = Some(present);
            summary.rat_absent = Some(flags.len() - present);
            table.set_column(RAT_PRESENT, flags);
        }

        table.sort_by_columns(&[BIN_START, EVENT_TIME]);
        summary.rows_out = table.len();
        log::info!("clean: {} rows in, {} rows out", summary.rows_in, summary.rows_out);

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

    fn cleaner() -> RowCleaner {
        RowCleaner::new(&PipelineConfig::default())
    }

    fn merged() -> Table {
        let mut table = Table::new([
            BIN_START,
            BIN_END,
            EVENT_TIME,
            "rat_minutes",
            "rat_arrival_number",
            "bat_landing_to_food",
            "habit",
        ]);
        let rows: Vec<Vec<Value>> = vec![
            vec![at(9, 30).into(), at(10, 0).into(), at(9, 40).into(), Value::Number(0.0), Value::Number(0.0), Value::Number(4.0), "fast".into()],
            vec![at(9, 0).into(), at(9, 30).into(), at(9, 10).into(), Value::Number(1.5), Value::Number(1.0), Value::Number(-3.0), Value::Null],
            // duplicate of the first row
            vec![at(9, 30).into(), at(10, 0).into(), at(9, 40).into(), Value::Number(0.0), Value::Number(0.0), Value::Number(4.0), "fast".into()],
            // required null
            vec![at(9, 0).into(), at(9, 30).into(), at(9, 20).into(), Value::Null, Value::Number(1.0), Value::Number(2.0), "slow".into()],
            // not a number
            vec![at(9, 0).into(), at(9, 30).into(), at(9, 25).into(), "lots".into(), Value::Number(1.0), Value::Number(2.0), "slow".into()],
            // text timestamps as read back from CSV, bin_end missing
            vec!["2018-01-03 10:00:00".into(), Value::Null, "2018-01-03 10:05:00".into(), "2".into(), "0".into(), Value::Number(1.0), "slow".into()],
        ];
        for row in rows {
            table.push_row(row);
        }
        table
    }

    #[test]
    fn test_clean_counts_every_step() {
        let (table, summary) = cleaner().clean(merged()).unwrap();

        assert_eq!(summary.rows_in, 6);
        assert_eq!(summary.bin_ends_filled, 1);
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(summary.required_null_dropped, 1);
        assert_eq!(summary.coercion_failures, 1);
        assert_eq!(summary.invalid_numeric_dropped, 1);
        assert_eq!(summary.values_clipped, 1);
        assert_eq!(summary.placeholders_filled, 1);
        assert_eq!(summary.rows_out, 3);
        assert_eq!(summary.rat_present, Some(2));
        assert_eq!(summary.rat_absent, Some(1));

        let starts: Vec<Option<NaiveDateTime>> =
            table.column(BIN_START).unwrap().map(Value::as_time).collect();
        assert_eq!(starts, vec![Some(at(9, 0)), Some(at(9, 30)), Some(at(10, 0))]);
        assert_eq!(table.get(0, "bat_landing_to_food"), Some(&Value::Number(0.0)));
        assert_eq!(table.get(0, "habit"), Some(&Value::Text("unknown".into())));
        assert_eq!(table.get(2, BIN_END), Some(&Value::Time(at(10, 30))));
        assert_eq!(table.get(2, "rat_minutes"), Some(&Value::Number(2.0)));
    }

    #[test]
    fn test_clean_is_idempotent() {
        let (once, _) = cleaner().clean(merged()).unwrap();
        let (twice, summary) = cleaner().clean(once.clone()).unwrap();

        assert_eq!(twice, once);
        assert!(summary.is_noop());
    }

    #[test]
    fn test_clipping_that_creates_duplicates_is_still_idempotent() {
        let mut table = Table::new([BIN_START, "rat_minutes", "rat_arrival_number"]);
        table.push_row(vec![at(9, 0).into(), Value::Number(-1.0), Value::Number(0.0)]);
        table.push_row(vec![at(9, 0).into(), Value::Number(0.0), Value::Number(0.0)]);

        let (once, summary) = cleaner().clean(table).unwrap();
        assert_eq!(summary.normalized_duplicates_removed, 1);
        assert_eq!(once.len(), 1);

        let (_, again) = cleaner().clean(once).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn test_missing_required_columns_is_fatal() {
        let table = Table::new([BIN_START, "rat_minutes"]);
        match cleaner().clean(table).unwrap_err() {
            PipelineError::MissingColumns { columns, .. } => {
                assert_eq!(columns, vec!["rat_arrival_number".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_optional_steps_skip_absent_columns() {
        let config = PipelineConfig {
            required_columns: vec![],
            ..Default::default()
        };
        let mut table = Table::new(["note"]);
        table.push_row(vec!["a".into()]);

        let (out, summary) = RowCleaner::new(&config).clean(table).unwrap();
        assert_eq!(out.columns(), &["note"]);
        assert_eq!(summary.rat_present, None);
        assert!(summary.coerced_columns.is_empty());
    }

    #[test]
    fn test_presence_rules_agree_on_non_negative_values() {
        let samples = [0.0, 0.5, 1.0, 3.0, 12.0];
        for &minutes in &samples {
            for &arrivals in &samples {
                let counters = [Some(minutes), Some(arrivals)];
                assert_eq!(
                    PresenceRule::AnyPositive.evaluate(&counters),
                    PresenceRule::AllZeroAbsent.evaluate(&counters),
                    "rules disagree for ({minutes}, {arrivals})"
                );
            }
        }
    }

    #[test]
    fn test_presence_rules_differ_on_nulls() {
        let counters = [None, Some(0.0)];
        assert!(!PresenceRule::AnyPositive.evaluate(&counters));
        assert!(PresenceRule::AllZeroAbsent.evaluate(&counters));

        let both_null = [None, None];
        assert!(!PresenceRule::AnyPositive.evaluate(&both_null));
        assert!(PresenceRule::AllZeroAbsent.evaluate(&both_null));
    }
}
