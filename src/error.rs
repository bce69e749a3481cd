//! Error types for batbin

use thiserror::Error;

/// Errors that abort a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No datetime column could be parsed in {table} (tried: {})", tried.join(", "))]
    DatetimeNotFound { table: String, tried: Vec<String> },

    #[error("Missing required column(s) in {table}: {}", columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },

    #[error("No data left after filter: {0}")]
    NoDataAfterFilter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
