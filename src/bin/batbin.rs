//! batbin CLI - Command-line interface for the bat/rat time-bin pipeline
//!
//! Commands:
//! - merge: Join an event table to a bin table
//! - clean: Clean a merged table
//! - engineer: Derive features on a cleaned table
//! - run: Merge, clean and engineer in one pass
//! - summarize: Describe a column split by a 0/1 flag
//! - config: Print the effective configuration

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use batbin::pipeline::MergeReport;
use batbin::stats::{group_split, Describe, GroupSplit};
use batbin::{
    BinPipeline, CleanSummary, DateOrder, FeatureSummary, JoinMode, PipelineConfig,
    PipelineError, RunReport, Table, VERSION,
};

/// batbin - Time-bin ETL for bat/rat foraging observations
#[derive(Parser)]
#[command(name = "batbin")]
#[command(version = VERSION)]
#[command(about = "Join, clean and engineer time-binned bat/rat observations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join an event table to a bin table
    Merge {
        /// Event-side CSV (one row per observation)
        #[arg(short, long)]
        events: PathBuf,

        /// Bin-side CSV (one row per time bin)
        #[arg(short, long)]
        bins: PathBuf,

        /// Output CSV path
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Clean a merged table
    Clean {
        /// Merged CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV path
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Derive features on a cleaned table
    Engineer {
        /// Cleaned CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Output CSV path
        #[arg(short, long)]
        output: PathBuf,

        /// Daily air-quality CSV (date, pm25, pm10)
        #[arg(long)]
        air_quality: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Merge, clean and engineer in one pass
    Run {
        #[arg(short, long)]
        events: PathBuf,

        #[arg(short, long)]
        bins: PathBuf,

        /// Output CSV path
        #[arg(short, long)]
        output: PathBuf,

        /// Daily air-quality CSV (date, pm25, pm10)
        #[arg(long)]
        air_quality: Option<PathBuf>,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Describe a numeric column for flag == 0 and flag == 1
    Summarize {
        /// Engineered CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Column to describe
        #[arg(short, long)]
        column: String,

        /// 0/1 grouping column
        #[arg(short, long, default_value = "rat_present")]
        group: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        options: RunOptions,
    },
}

#[derive(Args)]
struct RunOptions {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read ambiguous a/b/yyyy dates as month/day
    #[arg(long)]
    month_first: bool,

    /// Bin length in minutes when a bin has no explicit end
    #[arg(long)]
    bin_minutes: Option<i64>,

    /// Maximum minutes between a bin start and a matched event
    #[arg(long)]
    lookback_minutes: Option<i64>,

    /// Keep every bin, including bins without events
    #[arg(long)]
    keep_all_bins: bool,

    /// Print the report as JSON even on a terminal
    #[arg(long)]
    report_json: bool,
}

impl RunOptions {
    fn load_config(&self) -> Result<PipelineConfig, BatbinCliError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_path(path)?,
            None => PipelineConfig::default(),
        };
        if self.month_first {
            config.date_order = DateOrder::MonthFirst;
        }
        if let Some(minutes) = self.bin_minutes {
            config.bin_minutes = minutes;
        }
        if let Some(minutes) = self.lookback_minutes {
            config.lookback_minutes = minutes;
        }
        if self.keep_all_bins {
            config.join_mode = JoinMode::BinAnchored;
        }
        config.validate()?;
        Ok(config)
    }

    fn pipeline(&self) -> Result<BinPipeline, BatbinCliError> {
        Ok(BinPipeline::new(self.load_config()?)?)
    }

    /// JSON when asked for, or when stdout is piped
    fn json_report(&self) -> bool {
        self.report_json || !atty::is(atty::Stream::Stdout)
    }
}

fn main() -> ExitCode {
    pretty_env_logger::init_custom_env("BATBIN_LOG");
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), BatbinCliError> {
    match cli.command {
        Commands::Merge {
            events,
            bins,
            output,
            options,
        } => cmd_merge(&events, &bins, &output, &options),

        Commands::Clean {
            input,
            output,
            options,
        } => cmd_clean(&input, &output, &options),

        Commands::Engineer {
            input,
            output,
            air_quality,
            options,
        } => cmd_engineer(&input, &output, air_quality.as_deref(), &options),

        Commands::Run {
            events,
            bins,
            output,
            air_quality,
            options,
        } => cmd_run(&events, &bins, air_quality.as_deref(), &output, &options),

        Commands::Summarize {
            input,
            column,
            group,
            json,
        } => cmd_summarize(&input, &column, &group, json),

        Commands::Config { options } => {
            let config = options.load_config()?;
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn cmd_merge(events: &Path, bins: &Path, output: &Path, options: &RunOptions) -> Result<(), BatbinCliError> {
    let pipeline = options.pipeline()?;
    let events = Table::read_csv_path(events)?;
    let bins = Table::read_csv_path(bins)?;

    let (table, report) = pipeline.merge(&events, &bins)?;
    if table.is_empty() {
        return Err(BatbinCliError::EmptyOutput("merge"));
    }
    table.write_csv_path(output)?;

    emit(&report, options.json_report(), |out| print_merge(out, &report))
}

fn cmd_clean(input: &Path, output: &Path, options: &RunOptions) -> Result<(), BatbinCliError> {
    let pipeline = options.pipeline()?;
    let (table, summary) = pipeline.clean(Table::read_csv_path(input)?)?;
    table.write_csv_path(output)?;

    emit(&summary, options.json_report(), |out| print_clean(out, &summary))
}

fn cmd_engineer(
    input: &Path,
    output: &Path,
    air_quality: Option<&Path>,
    options: &RunOptions,
) -> Result<(), BatbinCliError> {
    let pipeline = options.pipeline()?;
    let table = Table::read_csv_path(input)?;
    let air = air_quality.map(Table::read_csv_path).transpose()?;

    let (table, summary) = pipeline.engineer(table, air.as_ref())?;
    table.write_csv_path(output)?;

    emit(&summary, options.json_report(), |out| print_features(out, &summary))
}

fn cmd_run(
    events: &Path,
    bins: &Path,
    air_quality: Option<&Path>,
    output: &Path,
    options: &RunOptions,
) -> Result<(), BatbinCliError> {
    let pipeline = options.pipeline()?;
    let events = Table::read_csv_path(events)?;
    let bins = Table::read_csv_path(bins)?;
    let air = air_quality.map(Table::read_csv_path).transpose()?;

    let (table, report) = pipeline.run(&events, &bins, air.as_ref())?;
    if table.is_empty() {
        return Err(BatbinCliError::EmptyOutput("run"));
    }
    table.write_csv_path(output)?;

    emit(&report, options.json_report(), |out| print_run(out, &report))
}

fn cmd_summarize(input: &Path, column: &str, group: &str, json: bool) -> Result<(), BatbinCliError> {
    let table = Table::read_csv_path(input)?;
    let split = group_split(&table, column, group)?;

    emit(&split, json || !atty::is(atty::Stream::Stdout), |out| print_split(out, &split))
}

/// Write a report as JSON or through the human-readable printer
fn emit<T, F>(report: &T, json: bool, human: F) -> Result<(), BatbinCliError>
where
    T: Serialize,
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let out: &mut dyn Write = &mut lock;
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
    } else {
        human(out)?;
    }
    out.flush()?;
    Ok(())
}

fn print_merge(out: &mut dyn Write, report: &MergeReport) -> io::Result<()> {
    let m = &report.matching;
    writeln!(out, "Merge")?;
    writeln!(
        out,
        "  timestamps       events from '{}', bins from '{}'",
        report.event_timestamp_source, report.bin_timestamp_source
    )?;
    writeln!(
        out,
        "  unparsed         {} events, {} bins",
        report.unparsed_events, report.unparsed_bins
    )?;
    writeln!(
        out,
        "  bin ends         {} explicit, {} defaulted, {} invalid dropped",
        report.bins.explicit_ends, report.bins.defaulted_ends, report.bins.invalid_dropped
    )?;
    writeln!(out, "  matched          {} of {} events", m.matched, m.events_in)?;
    writeln!(
        out,
        "  unmatched        {} before first bin, {} beyond lookback, {} in gaps",
        m.no_preceding_bin, m.beyond_lookback, m.in_gap
    )?;
    writeln!(out, "  empty bins       {}", m.bins_without_events)?;
    writeln!(out, "  rows out         {}", m.rows_out)
}

fn print_clean(out: &mut dyn Write, s: &CleanSummary) -> io::Result<()> {
    writeln!(out, "Clean")?;
    writeln!(out, "  rows in          {}", s.rows_in)?;
    writeln!(out, "  duplicates       {}", s.duplicates_removed + s.normalized_duplicates_removed)?;
    writeln!(out, "  null required    {}", s.required_null_dropped)?;
    writeln!(
        out,
        "  invalid numbers  {} cells, {} rows dropped",
        s.coercion_failures, s.invalid_numeric_dropped
    )?;
    writeln!(out, "  clipped          {}", s.values_clipped)?;
    writeln!(out, "  placeholders     {}", s.placeholders_filled)?;
    if let (Some(present), Some(absent)) = (s.rat_present, s.rat_absent) {
        writeln!(out, "  rat_present      {present} present, {absent} absent")?;
    }
    writeln!(out, "  rows out         {}", s.rows_out)
}

fn print_features(out: &mut dyn Write, s: &FeatureSummary) -> io::Result<()> {
    writeln!(out, "Features")?;
    writeln!(out, "  derived          {}", s.derived.join(", "))?;
    if !s.skipped.is_empty() {
        writeln!(out, "  skipped          {}", s.skipped.join(", "))?;
    }
    writeln!(
        out,
        "  season           {} dropped, {} without month",
        s.season_dropped, s.season_missing_month
    )?;
    if s.air_quality_unmatched > 0 || s.air_quality_dropped > 0 {
        writeln!(
            out,
            "  air quality      {} rows without a record, {} dropped",
            s.air_quality_unmatched, s.air_quality_dropped
        )?;
    }
    writeln!(out, "  rows out         {}", s.rows_out)
}

fn print_run(out: &mut dyn Write, report: &RunReport) -> io::Result<()> {
    print_merge(out, &report.merge)?;
    print_clean(out, &report.clean)?;
    print_features(out, &report.features)
}

fn print_describe(out: &mut dyn Write, label: &str, d: &Describe) -> io::Result<()> {
    let sd = d.sd.map(|sd| format!("{sd:.3}")).unwrap_or_else(|| "-".to_string());
    writeln!(
        out,
        "  {label:<8} n={:<5} mean={:.3} sd={sd} median={:.3} iqr={:.3} [{:.3}, {:.3}]",
        d.n, d.mean, d.median, d.iqr, d.min, d.max
    )
}

fn print_split(out: &mut dyn Write, split: &GroupSplit) -> io::Result<()> {
    writeln!(out, "{} by {}", split.value_column, split.group_column)?;
    print_describe(out, "0", &split.absent)?;
    print_describe(out, "1", &split.present)
}

// Error handling

#[derive(Debug)]
enum BatbinCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
    EmptyOutput(&'static str),
}

impl From<io::Error> for BatbinCliError {
    fn from(e: io::Error) -> Self {
        BatbinCliError::Io(e)
    }
}

impl From<PipelineError> for BatbinCliError {
    fn from(e: PipelineError) -> Self {
        BatbinCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for BatbinCliError {
    fn from(e: serde_json::Error) -> Self {
        BatbinCliError::Json(e)
    }
}

#[derive(Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(code: &str, message: String, hint: Option<&str>) -> Self {
        CliError {
            code: code.to_string(),
            message,
            hint: hint.map(str::to_string),
        }
    }
}

impl From<BatbinCliError> for CliError {
    fn from(e: BatbinCliError) -> Self {
        match e {
            BatbinCliError::Io(e) => {
                CliError::new("IO_ERROR", e.to_string(), Some("Check file paths and permissions"))
            }
            BatbinCliError::Json(e) => CliError::new("JSON_ERROR", e.to_string(), None),
            BatbinCliError::EmptyOutput(stage) => CliError::new(
                "EMPTY_OUTPUT",
                format!("{stage} produced no rows"),
                Some("Check the date order and the lookback window"),
            ),
            BatbinCliError::Pipeline(e) => {
                let message = e.to_string();
                match e {
                    PipelineError::DatetimeNotFound { .. } => CliError::new(
                        "DATETIME_NOT_FOUND",
                        message,
                        Some("Add a start_time / timestamp column or try --month-first"),
                    ),
                    PipelineError::MissingColumns { .. } => CliError::new(
                        "MISSING_COLUMNS",
                        message,
                        Some("Column names are matched after lowercasing and replacing spaces with '_'"),
                    ),
                    PipelineError::NoDataAfterFilter(_) => CliError::new(
                        "NO_DATA_AFTER_FILTER",
                        message,
                        Some("The grouping column has no rows for one of its levels"),
                    ),
                    PipelineError::InvalidConfig(_) => CliError::new(
                        "INVALID_CONFIG",
                        message,
                        Some("Run 'batbin config' to see the defaults"),
                    ),
                    PipelineError::Csv(_) => {
                        CliError::new("CSV_ERROR", message, Some("Check that the input is comma-separated with a header row"))
                    }
                    PipelineError::Io(_) => {
                        CliError::new("IO_ERROR", message, Some("Check file paths and permissions"))
                    }
                    PipelineError::Json(_) => {
                        CliError::new("JSON_ERROR", message, Some("Check the configuration file syntax"))
                    }
                }
            }
        }
    }
}
