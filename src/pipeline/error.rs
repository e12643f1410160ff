//! Error taxonomy for the pipeline
//!
//! Component errors (`FetchError`, `WarehouseError`, `StoreError`) are
//! wrapped by `PipelineError`, which names the step and item that failed.

use polars::error::PolarsError;
use thiserror::Error;

/// Errors raised while retrieving or decoding a source
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("content could not be parsed as a table: {0}")]
    Parse(#[from] PolarsError),

    #[error("spreadsheet could not be read: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("archive could not be read: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("content is not tabular: {0}")]
    NotTabular(String),
}

/// Errors raised by a warehouse backend
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("quota or rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("job {job_id} failed: {message}")]
    Job { job_id: String, message: String },

    #[error("payload rejected: {0}")]
    Payload(String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("frame conversion failed: {0}")]
    Frame(#[from] PolarsError),
}

/// Errors raised by the SQLite-backed stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("frame conversion failed: {0}")]
    Frame(#[from] PolarsError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("table {0} has no columns")]
    EmptySchema(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to retrieve {location}: {source}")]
    Retrieval {
        location: String,
        #[source]
        source: FetchError,
    },

    #[error("failed to normalize {table}: {source}")]
    Normalization {
        table: String,
        #[source]
        source: PolarsError,
    },

    #[error("failed to write warehouse table {destination}: {source}")]
    WarehouseWrite {
        destination: String,
        #[source]
        source: WarehouseError,
    },

    #[error("datamart query {datamart} failed: {source}")]
    QueryExecution {
        datamart: String,
        #[source]
        source: WarehouseError,
    },

    #[error("failed to write local table {table}: {source}")]
    LocalWrite {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
