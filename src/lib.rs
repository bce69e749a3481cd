//! batbin - Time-bin ETL for bat/rat foraging observations
//!
//! batbin turns two raw observation tables into one analysis-ready table
//! through a deterministic pipeline: timestamp normalization → bin construction
//! → event-to-bin as-of matching → row cleaning → feature derivation.
//!
//! Every stage returns a structured summary alongside its table so that
//! dropped, clipped and filled rows are always accounted for.
//!
//! ```ignore
//! use batbin::{BinPipeline, PipelineConfig, Table};
//!
//! let pipeline = BinPipeline::new(PipelineConfig::default())?;
//! let events = Table::read_csv_path("dataset1.csv")?;
//! let bins = Table::read_csv_path("dataset2.csv")?;
//! let (table, report) = pipeline.run(&events, &bins, None)?;
//! ```

pub mod bins;
pub mod cleaner;
pub mod config;
pub mod datetime;
pub mod error;
pub mod features;
pub mod matcher;
pub mod pipeline;
pub mod stats;
pub mod table;

pub use bins::{BinBuilder, BinSummary};
pub use cleaner::{CleanSummary, PresenceRule, RowCleaner};
pub use config::PipelineConfig;
pub use datetime::{DateOrder, DatetimeNormalizer, TimestampStrategy};
pub use error::PipelineError;
pub use features::{FeatureDeriver, FeatureSummary};
pub use matcher::{BinMatcher, JoinMode, MatchSummary};
pub use pipeline::{BinPipeline, MergeReport, RunReport};
pub use table::{Table, Value};

/// batbin version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
