//! BigQuery warehouse over the REST API
//!
//! Loads are multipart load jobs carrying newline-delimited JSON with an
//! explicit schema and `WRITE_TRUNCATE`, which replaces both the rows and
//! the schema of the destination. Queries go through `jobs.query` and
//! page through `getQueryResults`.

use super::Warehouse;
use crate::pipeline::error::WarehouseError;
use crate::pipeline::frame::{build_column, column_cells, Cell, ColumnKind};
use crate::pipeline::types::Destination;
use async_trait::async_trait;
use chrono::NaiveDate;
use polars::prelude::{DataFrame, PolarsResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

/// How long `jobs.query` waits server-side before answering "not complete yet"
const QUERY_WAIT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    /// OAuth2 bearer token, e.g. from `gcloud auth print-access-token`
    pub access_token: String,
    pub location: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl BigQueryConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            access_token: access_token.into(),
            location: None,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            max_polls: 300,
        }
    }
}

pub struct BigQueryWarehouse {
    client: Client,
    config: BigQueryConfig,
    api_base: String,
    upload_base: String,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> Result<Self, WarehouseError> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        })
    }

    /// Point the client at another endpoint, e.g. a local emulator
    pub fn with_endpoints(mut self, api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self.upload_base = upload_base.into();
        self
    }

    async fn wait_for_job(&self, mut job: JobResource) -> Result<(), WarehouseError> {
        let job_id = job.job_reference.job_id.clone();

        for _ in 0..self.config.max_polls {
            if let Some(status) = &job.status {
                if status.state == "DONE" {
                    return match &status.error_result {
                        Some(error) => Err(WarehouseError::Job {
                            job_id,
                            message: error.message.clone(),
                        }),
                        None => Ok(()),
                    };
                }
                debug!("Job {} is {}", job_id, status.state);
            }

            tokio::time::sleep(self.config.poll_interval).await;

            let url = format!(
                "{}/projects/{}/jobs/{}",
                self.api_base, self.config.project_id, job_id
            );
            let mut request = self.client.get(url).bearer_auth(&self.config.access_token);
            if let Some(location) = &job.job_reference.location {
                request = request.query(&[("location", location)]);
            }
            job = decode(request.send().await?).await?;
        }

        Err(WarehouseError::Job {
            job_id,
            message: "timed out waiting for job to finish".to_string(),
        })
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResults, WarehouseError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, self.config.project_id, job.job_id
        );

        let mut params = vec![("timeoutMs".to_string(), QUERY_WAIT_MS.to_string())];
        if let Some(location) = &job.location {
            params.push(("location".to_string(), location.clone()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.access_token)
            .query(&params)
            .send()
            .await?;
        decode(response).await
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn replace_table(
        &self,
        destination: &Destination,
        frame: &DataFrame,
    ) -> Result<usize, WarehouseError> {
        let schema = table_schema(frame);
        let payload = ndjson_rows(frame)?;
        let job_id = format!("blood_donation_load_{}", Uuid::new_v4().simple());
        let metadata = load_job_metadata(
            &self.config.project_id,
            destination,
            &job_id,
            self.config.location.as_deref(),
            &schema,
        );

        let boundary = format!("load_{}", Uuid::new_v4().simple());
        let body = multipart_related(&boundary, &metadata.to_string(), &payload);

        info!("Submitting load job {} for {}", job_id, destination);
        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            self.upload_base, self.config.project_id
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await?;

        let job: JobResource = decode(response).await?;
        self.wait_for_job(job).await?;

        info!("Load job {} done", job_id);
        Ok(frame.height())
    }

    async fn query(&self, sql: &str) -> Result<DataFrame, WarehouseError> {
        let url = format!(
            "{}/projects/{}/queries",
            self.api_base, self.config.project_id
        );
        let request = QueryRequest {
            query: sql.to_string(),
            use_legacy_sql: false,
            timeout_ms: QUERY_WAIT_MS,
            location: self.config.location.clone(),
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await?;
        let mut results: QueryResults = decode(response).await?;

        let mut polls = 0;
        while !results.job_complete {
            polls += 1;
            if polls > self.config.max_polls {
                return Err(WarehouseError::Job {
                    job_id: results.job_reference.job_id.clone(),
                    message: "timed out waiting for query results".to_string(),
                });
            }
            results = self.query_results(&results.job_reference, None).await?;
        }

        let fields = results
            .schema
            .map(|schema| schema.fields)
            .ok_or_else(|| WarehouseError::Decode("query result has no schema".to_string()))?;
        let mut rows = results.rows.unwrap_or_default();
        let mut page_token = results.page_token;

        while let Some(token) = page_token {
            let page = self
                .query_results(&results.job_reference, Some(&token))
                .await?;
            rows.extend(page.rows.unwrap_or_default());
            page_token = page.page_token;
        }

        debug!("Query returned {} rows", rows.len());
        Ok(frame_from_rows(&fields, &rows)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest {
    query: String,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    job_reference: JobReference,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Option<Vec<TableRow>>,
    #[serde(default)]
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, WarehouseError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    Ok(response.json::<T>().await?)
}

/// Map a failed API response onto the warehouse error taxonomy
fn classify_status(status: StatusCode, body: &str) -> WarehouseError {
    let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope.error.message,
            envelope
                .error
                .errors
                .into_iter()
                .map(|detail| detail.reason)
                .collect::<Vec<_>>(),
        ),
        Err(_) => (body.trim().to_string(), Vec::new()),
    };

    let quota = reasons
        .iter()
        .any(|reason| reason == "quotaExceeded" || reason == "rateLimitExceeded");

    match status {
        StatusCode::TOO_MANY_REQUESTS => WarehouseError::RateLimited(message),
        StatusCode::FORBIDDEN if quota => WarehouseError::RateLimited(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WarehouseError::Auth(message),
        _ => WarehouseError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn bigquery_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Float => "FLOAT",
        ColumnKind::Boolean => "BOOLEAN",
        ColumnKind::Date => "DATE",
        ColumnKind::Text => "STRING",
    }
}

fn column_kind(field: &FieldSchema) -> ColumnKind {
    if field.mode.as_deref() == Some("REPEATED") {
        return ColumnKind::Text;
    }

    match field.field_type.as_str() {
        "INTEGER" | "INT64" => ColumnKind::Integer,
        "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" => ColumnKind::Float,
        "BOOLEAN" | "BOOL" => ColumnKind::Boolean,
        "DATE" => ColumnKind::Date,
        _ => ColumnKind::Text,
    }
}

/// Load schema inferred from the frame's dtypes
fn table_schema(frame: &DataFrame) -> Vec<FieldSchema> {
    frame
        .get_columns()
        .iter()
        .map(|column| FieldSchema {
            name: column.name().to_string(),
            field_type: bigquery_type(ColumnKind::of(column.dtype())).to_string(),
            mode: Some("NULLABLE".to_string()),
        })
        .collect()
}

fn ndjson_rows(frame: &DataFrame) -> PolarsResult<String> {
    let columns = frame
        .get_columns()
        .iter()
        .map(|column| column_cells(column).map(|(_, cells)| (column.name().to_string(), cells)))
        .collect::<PolarsResult<Vec<_>>>()?;

    let mut payload = String::new();
    for row in 0..frame.height() {
        let record: serde_json::Map<String, serde_json::Value> = columns
            .iter()
            .map(|(name, cells)| (name.clone(), cells[row].to_json()))
            .collect();
        payload.push_str(&serde_json::Value::Object(record).to_string());
        payload.push('\n');
    }

    Ok(payload)
}

fn load_job_metadata(
    project_id: &str,
    destination: &Destination,
    job_id: &str,
    location: Option<&str>,
    schema: &[FieldSchema],
) -> serde_json::Value {
    let mut job_reference = json!({ "projectId": project_id, "jobId": job_id });
    if let Some(location) = location {
        job_reference["location"] = json!(location);
    }

    json!({
        "jobReference": job_reference,
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": project_id,
                    "datasetId": destination.schema,
                    "tableId": destination.name,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_TRUNCATE",
                "createDisposition": "CREATE_IF_NEEDED",
                "schema": { "fields": schema },
            }
        }
    })
}

fn multipart_related(boundary: &str, metadata: &str, payload: &str) -> String {
    format!(
        "--{boundary}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\r\n\
         {metadata}\r\n\
         --{boundary}\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {payload}\r\n\
         --{boundary}--\r\n"
    )
}

fn result_cell(value: &serde_json::Value, kind: ColumnKind) -> Cell {
    let text = match value {
        serde_json::Value::Null => return Cell::Null,
        serde_json::Value::String(text) => text,
        other => return Cell::Text(other.to_string()),
    };

    let parsed = match kind {
        ColumnKind::Integer => text.parse().ok().map(Cell::Integer),
        ColumnKind::Float => text.parse().ok().map(Cell::Float),
        ColumnKind::Boolean => text.parse().ok().map(Cell::Boolean),
        ColumnKind::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(Cell::Date),
        ColumnKind::Text => Some(Cell::Text(text.clone())),
    };

    parsed.unwrap_or(Cell::Null)
}

fn frame_from_rows(fields: &[FieldSchema], rows: &[TableRow]) -> PolarsResult<DataFrame> {
    let columns = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let kind = column_kind(field);
            let cells = rows
                .iter()
                .map(|row| {
                    row.f
                        .get(idx)
                        .map_or(Cell::Null, |cell| result_cell(&cell.v, kind))
                })
                .collect();
            build_column(&field.name, kind, cells)
        })
        .collect::<PolarsResult<Vec<_>>>()?;

    DataFrame::new(columns)
}
