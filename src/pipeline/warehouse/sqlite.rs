//! SQLite-backed warehouse for local dry runs.
//! Each warehouse schema is an attached database, so `schema.table`
//! resolves the same way it does in the remote warehouse.

use super::Warehouse;
use crate::pipeline::error::{StoreError, WarehouseError};
use crate::pipeline::store::{fetch_frame, replace_frame, single_connection_pool};
use crate::pipeline::types::Destination;
use crate::pipeline::utils::quote_ident;
use async_trait::async_trait;
use polars::prelude::DataFrame;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

pub struct SqliteWarehouse {
    pool: SqlitePool,
    /// Directory holding one file per schema; `None` keeps schemas in memory
    schema_dir: Option<PathBuf>,
}

impl SqliteWarehouse {
    /// Open a file-backed warehouse; schema files live next to `path`
    pub async fn open(path: &Path, schema: &str) -> Result<Self, StoreError> {
        let schema_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if !schema_dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&schema_dir).await?;
        }

        info!("Opening SQLite warehouse at {:?}", path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let warehouse = Self {
            pool: single_connection_pool(options).await?,
            schema_dir: Some(schema_dir),
        };
        warehouse.ensure_schema(schema).await?;
        Ok(warehouse)
    }

    pub async fn in_memory(schema: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let warehouse = Self {
            pool: single_connection_pool(options).await?,
            schema_dir: None,
        };
        warehouse.ensure_schema(schema).await?;
        Ok(warehouse)
    }

    async fn ensure_schema(&self, schema: &str) -> Result<(), StoreError> {
        let attached: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_database_list")
            .fetch_all(&self.pool)
            .await?;
        if attached.iter().any(|name| name == schema) {
            return Ok(());
        }

        let target = match &self.schema_dir {
            Some(dir) => dir
                .join(format!("{}.sqlite", schema))
                .to_string_lossy()
                .into_owned(),
            None => ":memory:".to_string(),
        };

        sqlx::query(&format!("ATTACH DATABASE ? AS {}", quote_ident(schema)))
            .bind(target)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn replace_table(
        &self,
        destination: &Destination,
        frame: &DataFrame,
    ) -> Result<usize, WarehouseError> {
        self.ensure_schema(&destination.schema).await?;

        let qualified = format!(
            "{}.{}",
            quote_ident(&destination.schema),
            quote_ident(&destination.name)
        );
        let rows = replace_frame(&self.pool, &qualified, &destination.to_string(), frame).await?;
        Ok(rows)
    }

    async fn query(&self, sql: &str) -> Result<DataFrame, WarehouseError> {
        Ok(fetch_frame(&self.pool, sql).await?)
    }
}
