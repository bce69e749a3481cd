//! Descriptive statistics over the engineered table

use serde::Serialize;

use crate::error::PipelineError;
use crate::table::Table;

/// Summary of one numeric sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Describe {
    pub n: usize,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation; absent below two observations
    pub sd: Option<f64>,
    pub q25: f64,
    pub q75: f64,
    pub iqr: f64,
    pub min: f64,
    pub max: f64,
}

/// A column described separately for flag == 0 and flag == 1
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSplit {
    pub value_column: String,
    pub group_column: String,
    pub absent: Describe,
    pub present: Describe,
}

/// Linear-interpolated percentile of sorted data
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Describe a sample, ignoring NaN. Returns `None` for an empty sample.
pub fn describe(values: &[f64]) -> Option<Describe> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let sd = (n > 1).then(|| {
        let ss: f64 = sorted.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    });
    let q25 = percentile(&sorted, 0.25);
    let q75 = percentile(&sorted, 0.75);

    Some(Describe {
        n,
        mean,
        median: percentile(&sorted, 0.5),
        sd,
        q25,
        q75,
        iqr: q75 - q25,
        min: sorted[0],
        max: sorted[n - 1],
    })
}

/// Describe `value_column` over the rows where `group_column == group_value`
pub fn describe_where(
    table: &Table,
    value_column: &str,
    group_column: &str,
    group_value: f64,
) -> Result<Describe, PipelineError> {
    table.require_columns("stats", &[value_column.to_string(), group_column.to_string()])?;
    let (Some(values), Some(groups)) = (
        table.numeric_column(value_column),
        table.numeric_column(group_column),
    ) else {
        return Err(PipelineError::NoDataAfterFilter(format!(
            "{group_column} == {group_value}"
        )));
    };

    let sample: Vec<f64> = values
        .iter()
        .zip(&groups)
        .filter(|(_, g)| **g == Some(group_value))
        .filter_map(|(v, _)| *v)
        .collect();

    describe(&sample).ok_or_else(|| {
        log::warn!("stats: no {value_column} values where {group_column} == {group_value}");
        PipelineError::NoDataAfterFilter(format!("{group_column} == {group_value}"))
    })
}

/// Describe `value_column` for both levels of a 0/1 flag
pub fn group_split(
    table: &Table,
    value_column: &str,
    group_column: &str,
) -> Result<GroupSplit, PipelineError> {
    Ok(GroupSplit {
        value_column: value_column.to_string(),
        group_column: group_column.to_string(),
        absent: describe_where(table, value_column, group_column, 0.0)?,
        present: describe_where(table, value_column, group_column, 1.0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn sample_table() -> Table {
        let mut table = Table::new(["rat_present", "bat_landing_to_food"]);
        for (flag, delay) in [(0.0, 2.0), (0.0, 4.0), (1.0, 10.0), (1.0, 20.0), (1.0, 30.0)] {
            table.push_row(vec![Value::Number(flag), Value::Number(delay)]);
        }
        table.push_row(vec![Value::Number(1.0), Value::Null]);
        table
    }

    #[test]
    fn test_describe_basic() {
        let d = describe(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(d.n, 4);
        assert!((d.mean - 2.5).abs() < 1e-9);
        assert!((d.median - 2.5).abs() < 1e-9);
        assert!((d.q25 - 1.75).abs() < 1e-9);
        assert!((d.q75 - 3.25).abs() < 1e-9);
        assert!((d.iqr - 1.5).abs() < 1e-9);
        assert!((d.sd.unwrap() - 1.290_994).abs() < 1e-6);
        assert_eq!(d.min, 1.0);
        assert_eq!(d.max, 4.0);
    }

    #[test]
    fn test_describe_edge_cases() {
        assert!(describe(&[]).is_none());
        assert!(describe(&[f64::NAN]).is_none());

        let single = describe(&[7.0]).unwrap();
        assert_eq!(single.sd, None);
        assert_eq!(single.median, 7.0);
        assert_eq!(single.iqr, 0.0);
    }

    #[test]
    fn test_group_split() {
        let split = group_split(&sample_table(), "bat_landing_to_food", "rat_present").unwrap();
        assert_eq!(split.absent.n, 2);
        assert!((split.absent.mean - 3.0).abs() < 1e-9);
        assert_eq!(split.present.n, 3);
        assert!((split.present.median - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_group_is_an_error() {
        let mut table = Table::new(["rat_present", "bat_landing_to_food"]);
        table.push_row(vec![Value::Number(0.0), Value::Number(1.0)]);

        match describe_where(&table, "bat_landing_to_food", "rat_present", 1.0) {
            Err(PipelineError::NoDataAfterFilter(filter)) => assert_eq!(filter, "rat_present == 1"),
            other => panic!("expected NoDataAfterFilter, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_column_is_an_error() {
        assert!(matches!(
            describe_where(&sample_table(), "risk", "rat_present", 1.0),
            Err(PipelineError::MissingColumns { .. })
        ));
    }
}
