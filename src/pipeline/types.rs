//! Core data types for the pipeline
//! Pure data structures with no behavior

use bytes::Bytes;
use polars::prelude::DataFrame;
use uuid::Uuid;

/// Raw source content, tagged by the format it will be parsed as
#[derive(Debug, Clone)]
pub enum RawData {
    Csv(Bytes),
    Parquet(Bytes),
    Spreadsheet(Bytes),
    Archive(Bytes),
}

impl RawData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawData::Csv(bytes)
            | RawData::Parquet(bytes)
            | RawData::Spreadsheet(bytes)
            | RawData::Archive(bytes) => bytes,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            RawData::Csv(_) => "csv",
            RawData::Parquet(_) => "parquet",
            RawData::Spreadsheet(_) => "xlsx",
            RawData::Archive(_) => "zip",
        }
    }
}

/// A configured dataset location: a URL (direct or short link) or a local path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub location: String,
}

impl SourceDescriptor {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl std::fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.location)
    }
}

/// Output of the acquirer: the table plus the name derived from where it resolved to
#[derive(Debug, Clone)]
pub struct AcquiredTable {
    pub logical_name: String,
    pub resolved_location: String,
    pub frame: DataFrame,
}

/// Fully qualified warehouse table, `{schema}.{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub schema: String,
    pub name: String,
}

impl Destination {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Result of one replace-load into the warehouse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub destination: Destination,
    pub rows: usize,
    pub columns: usize,
}

impl std::fmt::Display for LoadStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} rows, {} columns",
            self.destination, self.rows, self.columns
        )
    }
}

/// Result of one datamart materialization into the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeStats {
    pub datamart: String,
    pub rows: usize,
    pub columns: usize,
}

impl std::fmt::Display for MaterializeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} rows, {} columns",
            self.datamart, self.rows, self.columns
        )
    }
}

/// What the run does when a source or datamart fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// First failure aborts the whole run
    #[default]
    FailFast,
    /// Log the failure, record it in the report, and move on
    Isolate,
}

/// Step of the run a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    Normalize,
    Load,
    BuildDatamart,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Acquire => write!(f, "acquire"),
            Stage::Normalize => write!(f, "normalize"),
            Stage::Load => write!(f, "load"),
            Stage::BuildDatamart => write!(f, "build_datamart"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: Stage,
    pub item: String,
    pub message: String,
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.stage, self.item, self.message)
    }
}

/// Summary of one pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub loaded: Vec<LoadStats>,
    pub datamarts: Vec<MaterializeStats>,
    pub failures: Vec<StageFailure>,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            loaded: Vec::new(),
            datamarts: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "run {}: sources loaded: {}, datamarts built: {}, failures: {}",
            self.run_id,
            self.loaded.len(),
            self.datamarts.len(),
            self.failures.len()
        )
    }
}
