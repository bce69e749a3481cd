//! Run configuration
//!
//! Every tunable of a pipeline run lives here and is passed explicitly to the
//! stage that needs it. A config can be loaded from JSON; omitted fields take
//! their defaults.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cleaner::PresenceRule;
use crate::datetime::DateOrder;
use crate::error::PipelineError;
use crate::matcher::JoinMode;

/// Default bin length in minutes
pub const DEFAULT_BIN_MINUTES: i64 = 30;

/// Configuration for a full merge / clean / engineer run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Day/month disambiguation used for every parsed date in the run
    pub date_order: DateOrder,
    /// Bin length used when a bin has no explicit end
    pub bin_minutes: i64,
    /// Maximum distance between an event and the bin start it is matched to
    pub lookback_minutes: i64,
    /// Which side of the join is preserved
    pub join_mode: JoinMode,
    /// Columns that must exist and be non-null after cleaning
    pub required_columns: Vec<String>,
    /// Columns always coerced to numbers
    pub numeric_columns: Vec<String>,
    /// Substrings that mark a column as numeric
    pub numeric_keywords: Vec<String>,
    /// Rat-activity counters feeding the `rat_present` flag
    pub presence_columns: Vec<String>,
    pub presence_rule: PresenceRule,
    /// Categorical columns whose nulls are filled with `categorical_placeholder`
    pub categorical_columns: Vec<String>,
    pub categorical_placeholder: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            date_order: DateOrder::DayFirst,
            bin_minutes: DEFAULT_BIN_MINUTES,
            lookback_minutes: DEFAULT_BIN_MINUTES,
            join_mode: JoinMode::EventAnchored,
            required_columns: strings(&["bin_start", "rat_minutes", "rat_arrival_number"]),
            numeric_columns: strings(&[
                "rat_minutes",
                "rat_arrival_number",
                "rat_landing_number",
                "rat_number",
                "rat_count",
                "bat_landing_to_food",
                "bat_landing_number",
                "seconds_after_rat_arrival",
                "food_availability",
                "risk",
                "reward",
            ]),
            numeric_keywords: strings(&["minute", "count", "number", "risk", "reward", "seconds", "food"]),
            presence_columns: strings(&["rat_minutes", "rat_arrival_number"]),
            presence_rule: PresenceRule::AnyPositive,
            categorical_columns: strings(&["habit"]),
            categorical_placeholder: "unknown".to_string(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PipelineConfig {
    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.bin_minutes <= 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "bin_minutes must be positive, got {}",
                self.bin_minutes
            )));
        }
        if self.lookback_minutes <= 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "lookback_minutes must be positive, got {}",
                self.lookback_minutes
            )));
        }
        if self.presence_columns.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "presence_columns must name at least one counter".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bin_length(&self) -> Duration {
        Duration::minutes(self.bin_minutes)
    }

    pub fn lookback(&self) -> Duration {
        Duration::minutes(self.lookback_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.bin_minutes, 30);
        assert_eq!(config.lookback(), Duration::minutes(30));
        assert_eq!(config.date_order, DateOrder::DayFirst);
        assert_eq!(config.join_mode, JoinMode::EventAnchored);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"date_order": "month_first", "join_mode": "bin_anchored", "bin_minutes": 60}"#,
        )
        .unwrap();

        assert_eq!(config.date_order, DateOrder::MonthFirst);
        assert_eq!(config.join_mode, JoinMode::BinAnchored);
        assert_eq!(config.bin_minutes, 60);
        assert_eq!(config.lookback_minutes, 30);
        assert_eq!(config.required_columns, PipelineConfig::default().required_columns);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = PipelineConfig {
            presence_rule: PresenceRule::AllZeroAbsent,
            ..Default::default()
        };
        let parsed = PipelineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_json(r#"{"bin_minutes": 0}"#),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json(r#"{"lookback_minutes": -5}"#),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json("not json"),
            Err(PipelineError::Json(_))
        ));
    }
}
