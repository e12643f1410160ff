//! Run configuration loaded from environment variables

use crate::pipeline::datamart::QueryContext;
use crate::pipeline::orchestrator::RunPlan;
use crate::pipeline::queries::{default_datamarts, SqlDialect};
use crate::pipeline::types::{FailurePolicy, SourceDescriptor};
use crate::pipeline::warehouse::BigQueryConfig;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SOURCE_URLS: &[&str] = &[
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/donations_facility.csv",
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/donations_state.csv",
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/newdonors_facility.csv",
    "https://raw.githubusercontent.com/MoH-Malaysia/data-darah-public/main/newdonors_state.csv",
    "https://dub.sh/ds-data-granular",
];

pub const DEFAULT_DATE_COLUMNS: &[&str] = &["date", "visit_date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseBackend {
    BigQuery,
    /// Local SQLite warehouse for dry runs
    Sqlite,
}

impl FromStr for WarehouseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bigquery" | "bq" => Ok(WarehouseBackend::BigQuery),
            "sqlite" => Ok(WarehouseBackend::Sqlite),
            other => bail!("unknown warehouse backend: {}", other),
        }
    }
}

impl WarehouseBackend {
    pub fn dialect(self) -> SqlDialect {
        match self {
            WarehouseBackend::BigQuery => SqlDialect::BigQuery,
            WarehouseBackend::Sqlite => SqlDialect::Sqlite,
        }
    }
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: WarehouseBackend,
    /// Required for the BigQuery backend
    pub project_id: Option<String>,
    pub access_token: Option<String>,
    pub schema: String,
    pub location: Option<String>,
    pub warehouse_sqlite_path: PathBuf,
    pub local_store_path: PathBuf,
    pub log_dir: PathBuf,
    pub sources: Vec<SourceDescriptor>,
    pub date_columns: Vec<String>,
    pub isolate_failures: bool,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let backend = match var("WAREHOUSE_BACKEND") {
            Some(value) => value.parse().context("WAREHOUSE_BACKEND must be bigquery or sqlite")?,
            None => WarehouseBackend::BigQuery,
        };

        let config = Config {
            backend,
            project_id: var("GCP_PROJECT_ID"),
            access_token: var("GCP_ACCESS_TOKEN"),
            schema: var("BQ_SCHEMA").unwrap_or_else(|| "blood_donation_pipeline_v2".to_string()),
            location: var("BQ_LOCATION"),

            warehouse_sqlite_path: var("WAREHOUSE_SQLITE_PATH")
                .unwrap_or_else(|| "warehouse/blood_donation_warehouse.sqlite".to_string())
                .into(),

            local_store_path: var("LOCAL_STORE_PATH")
                .unwrap_or_else(|| "store/blood_donation_pipeline.sqlite".to_string())
                .into(),

            log_dir: var("LOG_DIR").unwrap_or_else(|| "logs".to_string()).into(),

            sources: match var("SOURCE_URLS") {
                Some(value) => split_list(&value).map(SourceDescriptor::new).collect(),
                None => DEFAULT_SOURCE_URLS
                    .iter()
                    .copied()
                    .map(SourceDescriptor::new)
                    .collect(),
            },

            date_columns: match var("DATE_COLUMNS") {
                Some(value) => split_list(&value).map(str::to_string).collect(),
                None => DEFAULT_DATE_COLUMNS.iter().map(|s| s.to_string()).collect(),
            },

            isolate_failures: match var("ISOLATE_FAILURES") {
                Some(value) => parse_bool(&value).context("ISOLATE_FAILURES must be true or false")?,
                None => false,
            },

            http_timeout: Duration::from_secs(match var("HTTP_TIMEOUT_SECS") {
                Some(value) => value
                    .trim()
                    .parse()
                    .context("HTTP_TIMEOUT_SECS must be a whole number of seconds")?,
                None => 300,
            }),
        };

        if config.backend == WarehouseBackend::BigQuery {
            if config.project_id.is_none() {
                bail!("GCP_PROJECT_ID must be set for the BigQuery warehouse");
            }
            if config.access_token.is_none() {
                bail!("GCP_ACCESS_TOKEN must be set for the BigQuery warehouse");
            }
        }

        Ok(config)
    }

    pub fn bigquery(&self) -> Result<BigQueryConfig> {
        let project_id = self
            .project_id
            .clone()
            .context("GCP_PROJECT_ID must be set for the BigQuery warehouse")?;
        let access_token = self
            .access_token
            .clone()
            .context("GCP_ACCESS_TOKEN must be set for the BigQuery warehouse")?;

        let mut config = BigQueryConfig::new(project_id, access_token);
        config.location = self.location.clone();
        config.timeout = self.http_timeout;
        Ok(config)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        if self.isolate_failures {
            FailurePolicy::Isolate
        } else {
            FailurePolicy::FailFast
        }
    }

    /// Run plan with the compiled-in datamarts written for the configured backend
    pub fn plan(&self) -> RunPlan {
        let project = self
            .project_id
            .clone()
            .unwrap_or_else(|| "local".to_string());

        RunPlan {
            schema: self.schema.clone(),
            sources: self.sources.clone(),
            date_columns: self.date_columns.clone(),
            datamarts: default_datamarts(self.backend.dialect()),
            query_context: QueryContext::new(project, &self.schema),
            failure_policy: self.failure_policy(),
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("not a boolean: {}", other),
    }
}
