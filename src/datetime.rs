//! Datetime normalization
//!
//! Raw observation tables carry their timestamps under varying column names
//! and in varying layouts (ISO, `dd/mm/yyyy HH:MM`, separate date and time
//! columns). The normalizer resolves a single timestamp column by trying an
//! ordered list of strategies until one yields at least one parsed value.
//!
//! Individual cells that fail to parse become `None`; dropping those rows is
//! the caller's decision.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::table::{Table, Value};

/// How to read ambiguous numeric dates such as `03/04/2018`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrder {
    #[default]
    DayFirst,
    MonthFirst,
}

/// Event-side timestamp columns, in preference order
pub const EVENT_TIME_COLUMNS: &[&str] = &["start_time", "datetime", "timestamp", "time"];

/// Bin-side timestamp columns, in preference order
pub const BIN_TIME_COLUMNS: &[&str] = &["timestamp", "bin_start", "datetime", "start_time", "time"];

/// Date column names tried when combining a date and a time column
pub const DATE_COLUMNS: &[&str] = &["date", "day"];

/// Time column names tried when combining a date and a time column
pub const TIME_COLUMNS: &[&str] = &["time", "start_time", "timestamp", "datetime"];

const TIME_FORMATS: &[&str] = &[
    "%H:%M:%S%.f",
    "%H:%M:%S",
    "%H:%M",
    "%I:%M:%S %p",
    "%I:%M:%S%p",
    "%I:%M %p",
    "%I:%M%p",
];

const NAMED_MONTH_FORMATS: &[&str] = &[
    "%d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%B %d %Y",
];

/// Parse one timestamp string
///
/// Year-first dates are unambiguous; for `a/b/year` layouts `order` decides
/// which field is the day, falling back to the other reading when the
/// preferred one is not a valid calendar date. A bare date parses as midnight.
/// A bare time of day (no date) does not parse.
pub fn parse_datetime(raw: &str, order: DateOrder) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }

    let split_at = trimmed
        .find(|c: char| c.is_whitespace() || c == 'T')
        .unwrap_or(trimmed.len());
    let (date_part, rest) = trimmed.split_at(split_at);
    let rest = rest.trim_start_matches('T').trim();

    if let Some(date) = parse_date_token(date_part, order) {
        if rest.is_empty() {
            return date.and_hms_opt(0, 0, 0);
        }
        return parse_time_token(rest).map(|time| date.and_time(time));
    }

    NAMED_MONTH_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(trimmed, fmt)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(trimmed, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    })
}

fn parse_date_token(token: &str, order: DateOrder) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split(['/', '-', '.']).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    let nums: Vec<u32> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    if nums.len() != 3 {
        return None;
    }

    if parts[0].len() == 4 {
        return NaiveDate::from_ymd_opt(nums[0] as i32, nums[1], nums[2]);
    }

    let year = match parts[2].len() {
        4 => nums[2] as i32,
        // Same pivot as chrono's %y: 00-69 -> 20xx, 70-99 -> 19xx
        1 | 2 if nums[2] < 70 => 2000 + nums[2] as i32,
        1 | 2 => 1900 + nums[2] as i32,
        _ => return None,
    };

    let (first, second) = (nums[0], nums[1]);
    let (day_first, month_first) = (
        NaiveDate::from_ymd_opt(year, second, first),
        NaiveDate::from_ymd_opt(year, first, second),
    );
    match order {
        DateOrder::DayFirst => day_first.or(month_first),
        DateOrder::MonthFirst => month_first.or(day_first),
    }
}

fn parse_time_token(token: &str) -> Option<NaiveTime> {
    let upper = token.to_uppercase();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&upper, fmt).ok())
}

/// Parse a cell, whatever its type
pub fn parse_value(value: &Value, order: DateOrder) -> Option<NaiveDateTime> {
    match value {
        Value::Null => None,
        Value::Time(t) => Some(*t),
        Value::Text(s) => parse_datetime(s, order),
        Value::Number(_) => parse_datetime(&value.render(), order),
    }
}

/// One way of deriving a timestamp column from a table
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampStrategy {
    /// Parse a single named column
    Column(String),
    /// Concatenate the first present date column with the first present time column
    DateTimePair {
        date_columns: Vec<String>,
        time_columns: Vec<String>,
    },
    /// Scan every text-bearing column in table order
    AnyTextColumn,
}

impl TimestampStrategy {
    /// Human-readable label used in logs and errors
    pub fn describe(&self) -> String {
        match self {
            TimestampStrategy::Column(name) => name.clone(),
            TimestampStrategy::DateTimePair {
                date_columns,
                time_columns,
            } => format!("[{}] + [{}]", date_columns.join("|"), time_columns.join("|")),
            TimestampStrategy::AnyTextColumn => "any text column".to_string(),
        }
    }

    /// Apply the strategy; `None` unless at least one cell parsed
    pub fn apply(&self, table: &Table, order: DateOrder) -> Option<ResolvedTimestamps> {
        match self {
            TimestampStrategy::Column(name) => parse_column(table, name, order),
            TimestampStrategy::DateTimePair {
                date_columns,
                time_columns,
            } => {
                let date_col = date_columns.iter().find(|c| table.has_column(c))?;
                let time_col = time_columns.iter().find(|c| table.has_column(c))?;
                let dates: Vec<&Value> = table.column(date_col)?.collect();
                let times: Vec<&Value> = table.column(time_col)?.collect();

                let values: Vec<Option<NaiveDateTime>> = dates
                    .iter()
                    .zip(times.iter())
                    .map(|(d, t)| {
                        if d.is_null() || t.is_null() {
                            return None;
                        }
                        let combined = format!("{} {}", d.render().trim(), t.render().trim());
                        parse_datetime(&combined, order)
                    })
                    .collect();

                ResolvedTimestamps::accept(format!("{date_col} + {time_col}"), values)
            }
            TimestampStrategy::AnyTextColumn => table
                .columns()
                .iter()
                .filter(|name| {
                    table
                        .column(name)
                        .is_some_and(|mut cells| cells.any(|v| matches!(v, Value::Text(_))))
                })
                .find_map(|name| parse_column(table, name, order)),
        }
    }
}

fn parse_column(table: &Table, name: &str, order: DateOrder) -> Option<ResolvedTimestamps> {
    let values = table.column(name)?.map(|v| parse_value(v, order)).collect();
    ResolvedTimestamps::accept(name.to_string(), values)
}

/// A parsed timestamp column and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTimestamps {
    /// Column (or column pair) the values were parsed from
    pub source: String,
    /// One entry per table row
    pub values: Vec<Option<NaiveDateTime>>,
}

impl ResolvedTimestamps {
    fn accept(source: String, values: Vec<Option<NaiveDateTime>>) -> Option<Self> {
        values
            .iter()
            .any(Option::is_some)
            .then_some(Self { source, values })
    }

    /// Number of rows that failed to parse
    pub fn unparsed(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values.into_iter().map(Value::from).collect()
    }
}

/// Resolves a timestamp column by trying strategies in order
#[derive(Debug, Clone)]
pub struct DatetimeNormalizer {
    order: DateOrder,
    strategies: Vec<TimestampStrategy>,
}

impl DatetimeNormalizer {
    /// Build the standard strategy chain for the given preferred columns:
    /// each preferred column, then date + time concatenation, then any text column
    pub fn new(order: DateOrder, preferred: &[&str]) -> Self {
        let mut strategies: Vec<TimestampStrategy> = preferred
            .iter()
            .map(|c| TimestampStrategy::Column(c.to_string()))
            .collect();
        strategies.push(TimestampStrategy::DateTimePair {
            date_columns: DATE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            time_columns: TIME_COLUMNS.iter().map(|c| c.to_string()).collect(),
        });
        strategies.push(TimestampStrategy::AnyTextColumn);
        Self { order, strategies }
    }

    /// Normalizer for point-in-time event tables
    pub fn for_events(order: DateOrder) -> Self {
        Self::new(order, EVENT_TIME_COLUMNS)
    }

    /// Normalizer for bin-start columns
    pub fn for_bins(order: DateOrder) -> Self {
        Self::new(order, BIN_TIME_COLUMNS)
    }

    /// Use an explicit strategy chain
    pub fn with_strategies(order: DateOrder, strategies: Vec<TimestampStrategy>) -> Self {
        Self { order, strategies }
    }

    pub fn strategies(&self) -> &[TimestampStrategy] {
        &self.strategies
    }

    /// Resolve the timestamp column or fail with `DatetimeNotFound`
    pub fn resolve(&self, table: &Table, table_name: &str) -> Result<ResolvedTimestamps, PipelineError> {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            if let Some(resolved) = strategy.apply(table, self.order) {
                if idx >= self.strategies.len().saturating_sub(2) {
                    log::warn!(
                        "{table_name}: no preferred timestamp column, fell back to {}",
                        resolved.source
                    );
                }
                log::info!(
                    "{table_name}: timestamps from '{}' ({} of {} rows unparsed)",
                    resolved.source,
                    resolved.unparsed(),
                    resolved.values.len()
                );
                return Ok(resolved);
            }
        }

        Err(PipelineError::DatetimeNotFound {
            table: table_name.to_string(),
            tried: self.strategies.iter().map(TimestampStrategy::describe).collect(),
        })
    }
}
