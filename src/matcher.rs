//! Event-to-bin matching
//!
//! Each event is paired with the bin whose start is the latest one at or
//! before the event time, provided that start lies within the lookback window.
//! The candidate is then accepted only if the event falls before the bin end.
//! Both sides are sorted once and matched in a single forward sweep, so the
//! join is O(N log N + M log M).
//!
//! Output layout: `bin_start`, `bin_end`, the event time column, then the
//! remaining event columns, then the remaining bin columns. Payload columns
//! present on both sides are suffixed `_x` (event) and `_y` (bin).

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::bins::{BIN_END, BIN_START};
use crate::error::PipelineError;
use crate::table::{Table, Value};

/// Column holding the parsed event timestamp
pub const EVENT_TIME: &str = "start_time_parsed";

/// Which side of the join is preserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// One row per matched event; unmatched events and empty bins are dropped
    #[default]
    EventAnchored,
    /// Every bin appears; a bin with several events is repeated once per event
    BinAnchored,
}

/// Match statistics for one join
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchSummary {
    pub events_in: usize,
    pub bins_in: usize,
    pub matched: usize,
    /// Events without a timestamp
    pub events_without_time: usize,
    /// Events earlier than every bin start
    pub no_preceding_bin: usize,
    /// Events further than the lookback window from the nearest preceding bin start
    pub beyond_lookback: usize,
    /// Events inside the lookback window but at or after the candidate's end
    pub in_gap: usize,
    pub bins_without_events: usize,
    pub rows_out: usize,
}

impl MatchSummary {
    pub fn unmatched(&self) -> usize {
        self.events_without_time + self.no_preceding_bin + self.beyond_lookback + self.in_gap
    }
}

/// Why an event did not match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Miss {
    NoPrecedingBin,
    BeyondLookback,
    InGap,
}

/// Backward as-of matcher with a lookback ceiling and containment check
#[derive(Debug, Clone)]
pub struct BinMatcher {
    lookback: Duration,
    mode: JoinMode,
}

impl BinMatcher {
    pub fn new(lookback: Duration, mode: JoinMode) -> Self {
        Self { lookback, mode }
    }

    pub fn mode(&self) -> JoinMode {
        self.mode
    }

    /// For every event time, the index of its bin (or the reason it has none)
    ///
    /// `bins` must be sorted by start. Among bins sharing a start the last one
    /// wins, as with a backward as-of merge.
    fn assign(
        &self,
        events: &[(usize, NaiveDateTime)],
        bins: &[(usize, NaiveDateTime, NaiveDateTime)],
    ) -> Vec<Result<usize, Miss>> {
        let mut out = Vec::with_capacity(events.len());
        let mut next = 0;

        for &(_, t) in events {
            while next < bins.len() && bins[next].1 <= t {
                next += 1;
            }
            let verdict = match next.checked_sub(1).map(|i| (i, &bins[i])) {
                None => Err(Miss::NoPrecedingBin),
                Some((_, &(_, start, _))) if t - start > self.lookback => Err(Miss::BeyondLookback),
                Some((_, &(_, _, end))) if t >= end => Err(Miss::InGap),
                Some((i, _)) => Ok(i),
            };
            out.push(verdict);
        }
        out
    }

    /// Join events to bins
    ///
    /// `events` must carry a `start_time_parsed` column, `bins` a `bin_start`
    /// and `bin_end` column, all holding timestamps (rows where they are null
    /// never match).
    pub fn join(&self, events: &Table, bins: &Table) -> Result<(Table, MatchSummary), PipelineError> {
        events.require_columns("events", &[EVENT_TIME.to_string()])?;
        bins.require_columns("bins", &[BIN_START.to_string(), BIN_END.to_string()])?;

        let mut summary = MatchSummary {
            events_in: events.len(),
            bins_in: bins.len(),
            ..Default::default()
        };

        let mut event_times: Vec<(usize, NaiveDateTime)> = Vec::with_capacity(events.len());
        for (idx, value) in events.column(EVENT_TIME).into_iter().flatten().enumerate() {
            match value.as_time() {
                Some(t) => event_times.push((idx, t)),
                None => summary.events_without_time += 1,
            }
        }
        event_times.sort_by_key(|&(idx, t)| (t, idx));

        let starts: Vec<Option<NaiveDateTime>> = bins
            .column(BIN_START)
            .into_iter()
            .flatten()
            .map(Value::as_time)
            .collect();
        let ends: Vec<Option<NaiveDateTime>> = bins
            .column(BIN_END)
            .into_iter()
            .flatten()
            .map(Value::as_time)
            .collect();
        let mut sorted_bins: Vec<(usize, NaiveDateTime, NaiveDateTime)> = starts
            .iter()
            .zip(&ends)
            .enumerate()
            .filter_map(|(idx, (s, e))| Some((idx, (*s)?, (*e)?)))
            .collect();
        sorted_bins.sort_by_key(|&(idx, start, _)| (start, idx));

        let verdicts = self.assign(&event_times, &sorted_bins);

        // Matched (sorted-bin position, event row, event time), in event-time order
        let mut pairs: Vec<(usize, usize, NaiveDateTime)> = Vec::new();
        for (&(event_row, t), verdict) in event_times.iter().zip(&verdicts) {
            match verdict {
                Ok(bin_pos) => pairs.push((*bin_pos, event_row, t)),
                Err(Miss::NoPrecedingBin) => summary.no_preceding_bin += 1,
                Err(Miss::BeyondLookback) => summary.beyond_lookback += 1,
                Err(Miss::InGap) => summary.in_gap += 1,
            }
        }
        summary.matched = pairs.len();
        pairs.sort_by_key(|&(bin_pos, _, t)| (bin_pos, t));

        let layout = JoinLayout::new(events, bins);
        let mut out = Table::new(layout.columns.clone());

        match self.mode {
            JoinMode::EventAnchored => {
                for &(bin_pos, event_row, _) in &pairs {
                    out.push_row(layout.row(events, Some(event_row), bins, sorted_bins[bin_pos].0));
                }
            }
            JoinMode::BinAnchored => {
                let mut cursor = 0;
                for (bin_pos, &(bin_row, _, _)) in sorted_bins.iter().enumerate() {
                    let mut any = false;
                    while cursor < pairs.len() && pairs[cursor].0 == bin_pos {
                        out.push_row(layout.row(events, Some(pairs[cursor].1), bins, bin_row));
                        cursor += 1;
                        any = true;
                    }
                    if !any {
                        summary.bins_without_events += 1;
                        out.push_row(layout.row(events, None, bins, bin_row));
                    }
                }
                // Bins with a null start or end cannot be ordered; keep them last
                for (bin_row, (s, e)) in starts.iter().zip(&ends).enumerate() {
                    if s.is_none() || e.is_none() {
                        summary.bins_without_events += 1;
                        out.push_row(layout.row(events, None, bins, bin_row));
                    }
                }
            }
        }

        if self.mode == JoinMode::EventAnchored {
            let used: std::collections::HashSet<usize> = pairs.iter().map(|p| p.0).collect();
            summary.bins_without_events = bins.len() - used.len();
        }
        summary.rows_out = out.len();

        log::info!(
            "match: {} / {} events matched ({} beyond lookback, {} in gaps, {} before first bin, {} without time)",
            summary.matched,
            summary.events_in,
            summary.beyond_lookback,
            summary.in_gap,
            summary.no_preceding_bin,
            summary.events_without_time
        );
        if summary.matched < summary.events_in {
            log::warn!(
                "match: {} events fell outside the bin range or more than {} minutes after a bin start",
                summary.unmatched(),
                self.lookback.num_minutes()
            );
        }

        Ok((out, summary))
    }
}

/// Source of one output column
#[derive(Debug, Clone, Copy)]
enum Source {
    Event(usize),
    Bin(usize),
}

/// Column plan shared by every output row
struct JoinLayout {
    columns: Vec<String>,
    sources: Vec<Source>,
}

impl JoinLayout {
    fn new(events: &Table, bins: &Table) -> Self {
        let keys = [BIN_START, BIN_END, EVENT_TIME];
        let is_key = |c: &String| keys.contains(&c.as_str());

        let event_payload: Vec<(usize, &String)> = events
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_str() != EVENT_TIME)
            .collect();
        let bin_payload: Vec<(usize, &String)> = bins
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| !is_key(*c))
            .collect();

        let clashes = |name: &String| {
            is_key(name) || bin_payload.iter().any(|(_, b)| *b == name)
        };

        let mut columns: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let mut sources = vec![
            Source::Bin(bins.column_index(BIN_START).unwrap_or_default()),
            Source::Bin(bins.column_index(BIN_END).unwrap_or_default()),
            Source::Event(events.column_index(EVENT_TIME).unwrap_or_default()),
        ];

        for &(idx, name) in &event_payload {
            columns.push(if clashes(name) { format!("{name}_x") } else { name.clone() });
            sources.push(Source::Event(idx));
        }
        for &(idx, name) in &bin_payload {
            let clash = event_payload.iter().any(|(_, e)| *e == name);
            columns.push(if clash { format!("{name}_y") } else { name.clone() });
            sources.push(Source::Bin(idx));
        }

        Self { columns, sources }
    }

    fn row(&self, events: &Table, event_row: Option<usize>, bins: &Table, bin_row: usize) -> Vec<Value> {
        let event = event_row.map(|r| &events.rows()[r]);
        let bin = &bins.rows()[bin_row];
        self.sources
            .iter()
            .map(|source| match source {
                Source::Event(i) => event.map(|e| e[*i].clone()).unwrap_or(Value::Null),
                Source::Bin(i) => bin[*i].clone(),
            })
            .collect()
    }
}
