//! Feature derivation
//!
//! This module derives the analysis variables from the cleaned table:
//! - Season labels from the month code
//! - Hesitation delay, food-risk ratio, food change rate
//! - Bat-to-rat ratio and the rat presence flag
//! - Moon illumination from the observation time
//! - Air quality index and visibility from a daily pollution table
//!
//! Each derivation is skipped (and reported) when its inputs are missing.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;

use crate::bins::BIN_START;
use crate::cleaner::{PresenceRule, RAT_PRESENT};
use crate::config::PipelineConfig;
use crate::datetime::{parse_value, DateOrder};
use crate::error::PipelineError;
use crate::matcher::EVENT_TIME;
use crate::table::{Table, Value};

/// Month columns checked for the season label, in order
pub const MONTH_COLUMNS: &[&str] = &["month", "month_x", "month_y"];

/// Observation-time columns, in order of preference per row
pub const TIME_SOURCES: &[&str] = &[EVENT_TIME, BIN_START];

/// Mean length of the synodic month in days
pub const SYNODIC_MONTH_DAYS: f64 = 29.530588853;

/// Result of a feature pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub derived: Vec<String>,
    pub skipped: Vec<String>,
    /// Rows whose month code is neither winter nor spring
    pub season_dropped: usize,
    /// Rows kept with an empty season because every month column is null
    pub season_missing_month: usize,
    /// Rows without a daily air-quality record
    pub air_quality_unmatched: usize,
    /// Rows dropped for missing pm2.5/pm10
    pub air_quality_dropped: usize,
    pub rows_out: usize,
}

impl FeatureSummary {
    fn mark_derived(&mut self, name: &str) {
        log::debug!("features: derived {name}");
        self.derived.push(name.to_string());
    }

    fn mark_skipped(&mut self, name: &str, missing: &[&str]) {
        log::warn!("features: skipping {name}, missing {}", missing.join(" / "));
        self.skipped.push(name.to_string());
    }
}

/// Season code for the study's month numbering (0 = December ... 5 = May)
pub fn season_for_month(month: f64) -> Option<u8> {
    match month as i64 {
        _ if month.fract() != 0.0 => None,
        0..=2 => Some(0),
        3..=5 => Some(1),
        _ => None,
    }
}

/// Illuminated fraction of the moon, in percent with two decimals
pub fn moon_illumination(at: NaiveDateTime) -> f64 {
    let reference = NaiveDate::from_ymd_opt(2000, 1, 6)
        .and_then(|d| d.and_hms_opt(18, 14, 0))
        .unwrap_or_default();
    let days = (at - reference).num_seconds() as f64 / 86_400.0;
    let phase = days.rem_euclid(SYNODIC_MONTH_DAYS);
    let fraction = (1.0 - (2.0 * std::f64::consts::PI * phase / SYNODIC_MONTH_DAYS).cos()) / 2.0;
    (fraction * 10_000.0).round() / 100.0
}

/// Indices of the given columns that exist, in the given order
fn present_columns(table: &Table, names: &[&str]) -> Vec<usize> {
    names.iter().filter_map(|c| table.column_index(c)).collect()
}

/// First cell among `indices` that `read` accepts
fn first_non_null<T>(row: &[Value], indices: &[usize], read: impl Fn(&Value) -> Option<T>) -> Option<T> {
    indices.iter().find_map(|&i| read(&row[i]))
}

fn find_pm25(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| c.contains("pm25") || c.contains("pm2.5"))
        .cloned()
}

fn find_pm10(columns: &[String]) -> Option<String> {
    columns.iter().find(|c| c.contains("pm10")).cloned()
}

/// Computes secondary variables on a cleaned table
#[derive(Debug, Clone)]
pub struct FeatureDeriver {
    order: DateOrder,
    presence_columns: Vec<String>,
    presence_rule: PresenceRule,
}

impl FeatureDeriver {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            order: config.date_order,
            presence_columns: config.presence_columns.clone(),
            presence_rule: config.presence_rule,
        }
    }

    /// Derive every feature whose inputs are present
    pub fn derive(
        &self,
        mut table: Table,
        air_quality: Option<&Table>,
    ) -> Result<(Table, FeatureSummary), PipelineError> {
        let mut summary = FeatureSummary::default();

        self.derive_season(&mut table, &mut summary);
        self.derive_hesitation(&mut table, &mut summary);
        self.derive_food(&mut table, &mut summary);
        self.derive_presence(&mut table, &mut summary);
        self.derive_moon(&mut table, &mut summary);
        if let Some(air) = air_quality {
            self.join_air_quality(&mut table, air, &mut summary)?;
        }
        self.derive_air_quality(&mut table, &mut summary);
        self.derive_bat_to_rat(&mut table, &mut summary);

        summary.rows_out = table.len();
        log::info!(
            "features: derived [{}], {} rows out",
            summary.derived.join(", "),
            summary.rows_out
        );
        Ok((table, summary))
    }

    fn derive_season(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let indices = present_columns(table, MONTH_COLUMNS);
        if indices.is_empty() {
            summary.mark_skipped("season", MONTH_COLUMNS);
            return;
        }
        let month_of = |row: &[Value]| first_non_null(row, &indices, Value::as_f64);

        summary.season_missing_month = table
            .rows()
            .iter()
            .filter(|row| month_of(row.as_slice()).is_none())
            .count();
        summary.season_dropped = table.retain_rows(|row| {
            month_of(row).map_or(true, |m| season_for_month(m).is_some())
        });
        if summary.season_dropped > 0 {
            log::info!(
                "features: dropped {} rows outside winter/spring",
                summary.season_dropped
            );
        }
        if summary.season_missing_month > 0 {
            log::warn!(
                "features: {} rows have no month, season left empty",
                summary.season_missing_month
            );
        }

        let seasons: Vec<Option<u8>> = table
            .rows()
            .iter()
            .map(|row| month_of(row.as_slice()).and_then(season_for_month))
            .collect();
        table.set_column(
            "season",
            seasons.iter().map(|s| Value::from(s.map(f64::from))).collect(),
        );
        table.set_column(
            "season_name",
            seasons
                .iter()
                .map(|s| match s {
                    Some(0) => Value::from("Winter"),
                    Some(_) => Value::from("Spring"),
                    None => Value::Null,
                })
                .collect(),
        );
        summary.mark_derived("season");
    }

    fn derive_hesitation(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let inputs = ["bat_landing_to_food", "seconds_after_rat_arrival"];
        let (Some(landing), Some(after)) = (
            table.numeric_column(inputs[0]),
            table.numeric_column(inputs[1]),
        ) else {
            summary.mark_skipped("total_hesitation_delay", &inputs);
            return;
        };

        let delay = landing
            .iter()
            .zip(&after)
            .map(|(a, b)| Value::Number(a.unwrap_or(0.0) + b.unwrap_or(0.0)))
            .collect();
        table.set_column("total_hesitation_delay", delay);
        summary.mark_derived("total_hesitation_delay");
    }

    fn derive_food(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let Some(food) = table.numeric_column("food_availability") else {
            summary.mark_skipped("food_risk_ratio", &["food_availability"]);
            summary.mark_skipped("food_change_rate", &["food_availability"]);
            return;
        };

        let present: Vec<f64> = food.iter().flatten().copied().collect();
        let mean = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };
        let food: Vec<f64> = food.iter().map(|f| f.unwrap_or(mean)).collect();

        match table.numeric_column("rat_minutes") {
            Some(minutes) => {
                let ratio = food
                    .iter()
                    .zip(&minutes)
                    .map(|(f, m)| Value::Number(f / (m.unwrap_or(0.0) + 1.0)))
                    .collect();
                table.set_column("food_risk_ratio", ratio);
                summary.mark_derived("food_risk_ratio");
            }
            None => summary.mark_skipped("food_risk_ratio", &["rat_minutes"]),
        }

        let change = food
            .iter()
            .enumerate()
            .map(|(i, f)| Value::Number(if i == 0 { 0.0 } else { f - food[i - 1] }))
            .collect();
        table.set_column("food_change_rate", change);
        summary.mark_derived("food_change_rate");
    }

    fn derive_presence(&self, table: &mut Table, summary: &mut FeatureSummary) {
        if table.has_column(RAT_PRESENT) {
            return;
        }
        let counters: Vec<Vec<Option<f64>>> = self
            .presence_columns
            .iter()
            .filter_map(|c| table.numeric_column(c))
            .collect();
        if counters.is_empty() {
            let names: Vec<&str> = self.presence_columns.iter().map(String::as_str).collect();
            summary.mark_skipped(RAT_PRESENT, &names);
            return;
        }

        let flags = (0..table.len())
            .map(|r| {
                let row: Vec<Option<f64>> = counters.iter().map(|c| c[r]).collect();
                Value::Number(if self.presence_rule.evaluate(&row) { 1.0 } else { 0.0 })
            })
            .collect();
        table.set_column(RAT_PRESENT, flags);
        summary.mark_derived(RAT_PRESENT);
    }

    fn derive_moon(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let Some(times) = self.row_times(table) else {
            summary.mark_skipped("moon_illumination", TIME_SOURCES);
            return;
        };

        let values: Vec<Value> = times
            .into_iter()
            .map(|t| Value::from(t.map(moon_illumination)))
            .collect();
        table.set_column("moon_illumination", values);
        summary.mark_derived("moon_illumination");
    }

    /// Per-row observation time: the event time, or the bin start where the
    /// row has no event
    fn row_times(&self, table: &Table) -> Option<Vec<Option<NaiveDateTime>>> {
        let indices = present_columns(table, TIME_SOURCES);
        if indices.is_empty() {
            return None;
        }
        let order = self.order;
        Some(
            table
                .rows()
                .iter()
                .map(|row| first_non_null(row, &indices, |v| parse_value(v, order)))
                .collect(),
        )
    }

    /// Left-join a daily air-quality table on the calendar date of each row
    fn join_air_quality(
        &self,
        table: &mut Table,
        air: &Table,
        summary: &mut FeatureSummary,
    ) -> Result<(), PipelineError> {
        air.require_columns("air_quality", &["date".to_string()])?;
        let pm_columns: Vec<String> = [find_pm25(air.columns()), find_pm10(air.columns())]
            .into_iter()
            .flatten()
            .collect();
        if pm_columns.len() < 2 {
            return Err(PipelineError::MissingColumns {
                table: "air_quality".to_string(),
                columns: vec!["pm25".to_string(), "pm10".to_string()],
            });
        }

        let Some(date_idx) = air.column_index("date") else {
            return Ok(());
        };
        let pm_idx: Vec<usize> = pm_columns.iter().filter_map(|c| air.column_index(c)).collect();

        let mut by_date: HashMap<NaiveDate, Vec<Value>> = HashMap::new();
        for row in air.rows() {
            let Some(date) = parse_value(&row[date_idx], self.order).map(|d| d.date()) else {
                continue;
            };
            by_date
                .entry(date)
                .or_insert_with(|| pm_idx.iter().map(|&i| row[i].clone()).collect());
        }

        let Some(times) = self.row_times(table) else {
            log::warn!("features: no timestamp column to join air quality on");
            return Ok(());
        };
        let dates: Vec<Option<NaiveDate>> = times.iter().map(|t| t.map(|t| t.date())).collect();

        for (k, name) in pm_columns.iter().enumerate() {
            let values: Vec<Value> = dates
                .iter()
                .map(|d| {
                    d.and_then(|d| by_date.get(&d))
                        .map(|pm| pm[k].clone())
                        .unwrap_or(Value::Null)
                })
                .collect();
            table.set_column(name, values);
        }
        summary.air_quality_unmatched = dates
            .iter()
            .filter(|d| d.map_or(true, |d| !by_date.contains_key(&d)))
            .count();
        log::info!(
            "features: {} rows without a daily air-quality record",
            summary.air_quality_unmatched
        );
        Ok(())
    }

    fn derive_air_quality(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let (Some(pm25), Some(pm10)) = (find_pm25(table.columns()), find_pm10(table.columns())) else {
            summary.mark_skipped("air_quality_index", &["pm25", "pm10"]);
            return;
        };

        for column in [&pm25, &pm10] {
            table.map_column(column, |v| Value::from(v.as_f64()));
        }
        summary.air_quality_dropped = table.drop_nulls(&[pm25.clone(), pm10.clone()]);
        if summary.air_quality_dropped > 0 {
            log::info!(
                "features: dropped {} rows with missing pm2.5/pm10",
                summary.air_quality_dropped
            );
        }

        let (Some(a), Some(b)) = (table.numeric_column(&pm25), table.numeric_column(&pm10)) else {
            return;
        };
        let index: Vec<f64> = a
            .iter()
            .zip(&b)
            .map(|(a, b)| (a.unwrap_or(0.0) + b.unwrap_or(0.0)) / 2.0)
            .collect();
        table.set_column("visibility", index.iter().map(|i| Value::Number(100.0 - i)).collect());
        table.set_column("air_quality_index", index.into_iter().map(Value::Number).collect());
        summary.mark_derived("air_quality_index");
        summary.mark_derived("visibility");
    }

    fn derive_bat_to_rat(&self, table: &mut Table, summary: &mut FeatureSummary) {
        let inputs = ["bat_landing_number", "rat_arrival_number"];
        let (Some(bats), Some(rats)) = (
            table.numeric_column(inputs[0]),
            table.numeric_column(inputs[1]),
        ) else {
            summary.mark_skipped("bat_to_rat_ratio", &inputs);
            return;
        };

        let ratio = bats
            .iter()
            .zip(&rats)
            .map(|(b, r)| Value::Number(b.unwrap_or(0.0) / (r.unwrap_or(0.0) + 1.0)))
            .collect();
        table.set_column("bat_to_rat_ratio", ratio);
        summary.mark_derived("bat_to_rat_ratio");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 1, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn deriver() -> FeatureDeriver {
        FeatureDeriver::new(&PipelineConfig::default())
    }

    fn cleaned() -> Table {
        let mut table = Table::new([
            BIN_START,
            EVENT_TIME,
            "month_x",
            "bat_landing_to_food",
            "seconds_after_rat_arrival",
            "food_availability",
            "rat_minutes",
            "rat_arrival_number",
            "bat_landing_number",
        ]);
        let n = Value::Number;
        table.push_row(vec![at(3, 19).into(), at(3, 19).into(), n(1.0), n(4.0), n(10.0), n(3.0), n(0.0), n(0.0), n(20.0)]);
        table.push_row(vec![at(3, 20).into(), at(3, 20).into(), n(6.0), n(1.0), n(1.0), n(2.0), n(1.0), n(1.0), n(5.0)]);
        table.push_row(vec![at(4, 19).into(), at(4, 19).into(), n(4.0), n(2.0), Value::Null, Value::Null, n(3.0), n(3.0), n(8.0)]);
        table.push_row(vec![at(5, 19).into(), at(5, 19).into(), n(0.0), n(0.0), n(5.0), n(1.0), n(0.0), n(1.0), n(2.0)]);
        table
    }

    fn numbers(table: &Table, column: &str) -> Vec<Option<f64>> {
        table.numeric_column(column).unwrap()
    }

    #[test]
    fn test_season_drops_out_of_range_months() {
        let (table, summary) = deriver().derive(cleaned(), None).unwrap();

        assert_eq!(summary.season_dropped, 1);
        assert_eq!(numbers(&table, "season"), vec![Some(0.0), Some(1.0), Some(0.0)]);
        assert_eq!(table.get(1, "season_name"), Some(&Value::Text("Spring".into())));
    }

    #[test]
    fn test_empty_bins_fall_back_to_bin_side_columns() {
        let mut table = Table::new([BIN_START, EVENT_TIME, "month_x", "month_y"]);
        table.push_row(vec![at(3, 19).into(), at(3, 19).into(), Value::Number(1.0), Value::Number(1.0)]);
        // bins without events carry nulls on the event side
        table.push_row(vec![at(3, 20).into(), Value::Null, Value::Null, Value::Number(4.0)]);
        table.push_row(vec![at(3, 21).into(), Value::Null, Value::Null, Value::Null]);
        table.push_row(vec![at(3, 22).into(), Value::Null, Value::Null, Value::Number(6.0)]);

        let mut air = Table::new(["date", "pm25", "pm10"]);
        air.push_row(vec!["2018-01-03".into(), Value::Number(10.0), Value::Number(30.0)]);

        let (table, summary) = deriver().derive(table, Some(&air)).unwrap();

        assert_eq!(summary.season_dropped, 1);
        assert_eq!(summary.season_missing_month, 1);
        assert_eq!(summary.air_quality_unmatched, 0);
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.numeric_column("season").unwrap(),
            vec![Some(0.0), Some(1.0), None]
        );
        let expected: Vec<Option<f64>> = [at(3, 19), at(3, 20), at(3, 21)]
            .into_iter()
            .map(|t| Some(moon_illumination(t)))
            .collect();
        assert_eq!(table.numeric_column("moon_illumination").unwrap(), expected);
        assert_eq!(numbers(&table, "air_quality_index"), vec![Some(20.0); 3]);
    }

    #[test]
    fn test_engineered_ratios() {
        let (table, _) = deriver().derive(cleaned(), None).unwrap();

        assert_eq!(
            numbers(&table, "total_hesitation_delay"),
            vec![Some(14.0), Some(2.0), Some(5.0)]
        );
        // food mean over the remaining rows is (3 + 1) / 2 = 2
        assert_eq!(
            numbers(&table, "food_risk_ratio"),
            vec![Some(3.0), Some(0.5), Some(1.0)]
        );
        assert_eq!(
            numbers(&table, "food_change_rate"),
            vec![Some(0.0), Some(-1.0), Some(-1.0)]
        );
        assert_eq!(
            numbers(&table, "bat_to_rat_ratio"),
            vec![Some(20.0), Some(2.0), Some(1.0)]
        );
        assert_eq!(numbers(&table, RAT_PRESENT), vec![Some(0.0), Some(1.0), Some(1.0)]);
    }

    #[test]
    fn test_missing_inputs_are_skipped() {
        let mut table = Table::new([BIN_START]);
        table.push_row(vec![at(3, 19).into()]);

        let (table, summary) = deriver().derive(table, None).unwrap();
        assert!(summary.skipped.contains(&"season".to_string()));
        assert!(summary.skipped.contains(&"total_hesitation_delay".to_string()));
        assert!(summary.skipped.contains(&"bat_to_rat_ratio".to_string()));
        assert_eq!(summary.derived, vec!["moon_illumination".to_string()]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_moon_illumination_cycle() {
        let new_moon = NaiveDate::from_ymd_opt(2000, 1, 6)
            .unwrap()
            .and_hms_opt(18, 14, 0)
            .unwrap();
        assert_eq!(moon_illumination(new_moon), 0.0);

        let half = chrono::Duration::seconds((SYNODIC_MONTH_DAYS / 2.0 * 86_400.0) as i64);
        assert!(moon_illumination(new_moon + half) > 99.99);

        let quarter = chrono::Duration::seconds((SYNODIC_MONTH_DAYS / 4.0 * 86_400.0) as i64);
        assert!((moon_illumination(new_moon + quarter) - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_air_quality_join_and_index() {
        let mut air = Table::new(["date", "pm25", "pm10", "o3"]);
        air.push_row(vec!["2018/1/3".into(), Value::Number(40.0), Value::Number(20.0), Value::Number(1.0)]);
        air.push_row(vec!["2018/1/4".into(), Value::Null, Value::Number(20.0), Value::Number(1.0)]);

        let (table, summary) = deriver().derive(cleaned(), Some(&air)).unwrap();

        // Jan 4 has no pm2.5 and Jan 5 has no record at all
        assert_eq!(summary.air_quality_unmatched, 1);
        assert_eq!(summary.air_quality_dropped, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(numbers(&table, "air_quality_index"), vec![Some(30.0)]);
        assert_eq!(numbers(&table, "visibility"), vec![Some(70.0)]);
        assert!(!table.has_column("o3"));
    }

    #[test]
    fn test_air_quality_without_pm_columns_is_an_error() {
        let air = Table::new(["date", "no2"]);
        assert!(matches!(
            deriver().derive(cleaned(), Some(&air)),
            Err(PipelineError::MissingColumns { .. })
        ));
    }

    #[test]
    fn test_season_codes() {
        assert_eq!(season_for_month(0.0), Some(0));
        assert_eq!(season_for_month(2.0), Some(0));
        assert_eq!(season_for_month(3.0), Some(1));
        assert_eq!(season_for_month(5.0), Some(1));
        assert_eq!(season_for_month(6.0), None);
        assert_eq!(season_for_month(2.5), None);
        assert_eq!(season_for_month(-1.0), None);
    }
}
