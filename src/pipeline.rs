//! Pipeline orchestration
//!
//! This module provides the public API for batbin.
//! It runs the stages in order: timestamp normalization → bin construction →
//! event-to-bin matching → row cleaning → feature derivation.

use serde::Serialize;
use std::path::Path;

use crate::bins::{BinBuilder, BinSummary, BIN_START};
use crate::cleaner::{CleanSummary, RowCleaner};
use crate::config::PipelineConfig;
use crate::datetime::DatetimeNormalizer;
use crate::error::PipelineError;
use crate::features::{FeatureDeriver, FeatureSummary};
use crate::matcher::{BinMatcher, MatchSummary, EVENT_TIME};
use crate::table::Table;

/// What the merge stage did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    /// Column (or column pair) the event timestamps were read from
    pub event_timestamp_source: String,
    pub bin_timestamp_source: String,
    /// Event rows dropped because their timestamp did not parse
    pub unparsed_events: usize,
    /// Bin rows dropped because their start did not parse
    pub unparsed_bins: usize,
    pub bins: BinSummary,
    pub matching: MatchSummary,
}

/// Per-stage summaries of a full run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub merge: MergeReport,
    pub clean: CleanSummary,
    pub features: FeatureSummary,
    pub rows_out: usize,
}

/// Attach a parsed timestamp column and drop rows where it is null
fn stamp(
    normalizer: &DatetimeNormalizer,
    mut table: Table,
    table_name: &str,
    column: &str,
) -> Result<(Table, String, usize), PipelineError> {
    let resolved = normalizer.resolve(&table, table_name)?;
    let source = resolved.source.clone();
    table.set_column(column, resolved.into_values());

    let Some(idx) = table.column_index(column) else {
        return Ok((table, source, 0));
    };
    let dropped = table.retain_rows(|row| !row[idx].is_null());
    if dropped > 0 {
        log::info!("{table_name}: dropped {dropped} rows with unparseable timestamps");
    }
    Ok((table, source, dropped))
}

/// Runs the merge / clean / engineer stages with one configuration
#[derive(Debug, Clone)]
pub struct BinPipeline {
    config: PipelineConfig,
    events: DatetimeNormalizer,
    bins: DatetimeNormalizer,
    builder: BinBuilder,
    matcher: BinMatcher,
    cleaner: RowCleaner,
    deriver: FeatureDeriver,
}

impl Default for BinPipeline {
    fn default() -> Self {
        Self::from_valid(PipelineConfig::default())
    }
}

impl BinPipeline {
    /// Create a pipeline after validating the configuration
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    fn from_valid(config: PipelineConfig) -> Self {
        Self {
            events: DatetimeNormalizer::for_events(config.date_order),
            bins: DatetimeNormalizer::for_bins(config.date_order),
            builder: BinBuilder::new(config.bin_length(), config.date_order),
            matcher: BinMatcher::new(config.lookback(), config.join_mode),
            cleaner: RowCleaner::new(&config),
            deriver: FeatureDeriver::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Normalize both tables, build bins and join events to them
    pub fn merge(&self, events: &Table, bins: &Table) -> Result<(Table, MergeReport), PipelineError> {
        let (events, event_source, unparsed_events) =
            stamp(&self.events, events.clone(), "events", EVENT_TIME)?;
        let (bins, bin_source, unparsed_bins) = stamp(&self.bins, bins.clone(), "bins", BIN_START)?;

        let (bins, bin_summary) = self.builder.build(bins)?;
        let (merged, matching) = self.matcher.join(&events, &bins)?;

        log::info!(
            "merge: {} of {} events matched, {} rows out",
            matching.matched,
            matching.events_in,
            matching.rows_out
        );
        if merged.is_empty() {
            log::warn!("merge: no rows in the merged table");
        }

        Ok((
            merged,
            MergeReport {
                event_timestamp_source: event_source,
                bin_timestamp_source: bin_source,
                unparsed_events,
                unparsed_bins,
                bins: bin_summary,
                matching,
            },
        ))
    }

    pub fn clean(&self, table: Table) -> Result<(Table, CleanSummary), PipelineError> {
        self.cleaner.clean(table)
    }

    pub fn engineer(
        &self,
        table: Table,
        air_quality: Option<&Table>,
    ) -> Result<(Table, FeatureSummary), PipelineError> {
        self.deriver.derive(table, air_quality)
    }

    /// Merge, clean and engineer in one pass
    pub fn run(
        &self,
        events: &Table,
        bins: &Table,
        air_quality: Option<&Table>,
    ) -> Result<(Table, RunReport), PipelineError> {
        let (merged, merge) = self.merge(events, bins)?;
        let (cleaned, clean) = self.clean(merged)?;
        let (engineered, features) = self.engineer(cleaned, air_quality)?;

        let report = RunReport {
            merge,
            clean,
            features,
            rows_out: engineered.len(),
        };
        Ok((engineered, report))
    }

    /// Run from CSV files and write the engineered table
    pub fn run_paths(
        &self,
        events: impl AsRef<Path>,
        bins: impl AsRef<Path>,
        air_quality: Option<&Path>,
        output: impl AsRef<Path>,
    ) -> Result<RunReport, PipelineError> {
        let events = Table::read_csv_path(events)?;
        let bins = Table::read_csv_path(bins)?;
        let air_quality = air_quality.map(Table::read_csv_path).transpose()?;

        let (table, report) = self.run(&events, &bins, air_quality.as_ref())?;
        table.write_csv_path(output)?;
        Ok(report)
    }
}
