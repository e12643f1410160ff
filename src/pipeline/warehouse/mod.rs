//! Warehouse loader - replace-semantics writes and SQL reads against the
//! remote analytical warehouse

pub mod bigquery;
pub mod sqlite;

use crate::pipeline::error::{PipelineError, WarehouseError};
use crate::pipeline::types::{Destination, LoadStats};
use async_trait::async_trait;
use polars::prelude::DataFrame;
use tracing::info;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use sqlite::SqliteWarehouse;

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Discard the destination's content and schema and replace them with
    /// the frame's. Returns the number of rows written.
    async fn replace_table(
        &self,
        destination: &Destination,
        frame: &DataFrame,
    ) -> Result<usize, WarehouseError>;

    /// Execute SQL and return the complete result set
    async fn query(&self, sql: &str) -> Result<DataFrame, WarehouseError>;
}

/// Load a cleaned table into `{schema}.{name}`, replacing what was there
pub async fn load(
    warehouse: &dyn Warehouse,
    frame: &DataFrame,
    destination: &Destination,
) -> Result<LoadStats, PipelineError> {
    let write_error = |source: WarehouseError| PipelineError::WarehouseWrite {
        destination: destination.to_string(),
        source,
    };

    if frame.width() == 0 {
        return Err(write_error(WarehouseError::Payload(
            "table has no columns".to_string(),
        )));
    }

    info!(
        "Writing {} rows x {} columns to {}",
        frame.height(),
        frame.width(),
        destination
    );

    let rows = warehouse
        .replace_table(destination, frame)
        .await
        .map_err(write_error)?;

    Ok(LoadStats {
        destination: destination.clone(),
        rows,
        columns: frame.width(),
    })
}
