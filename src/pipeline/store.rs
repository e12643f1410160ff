//! Local store - datamart tables persisted in a file-backed SQLite database
//!
//! Every write replaces the whole table inside one transaction: drop,
//! create with the frame's schema, insert every row. Readers never see a
//! half-written table.

use crate::pipeline::error::StoreError;
use crate::pipeline::frame::{build_column, column_cells, Cell, ColumnKind};
use crate::pipeline::utils::quote_ident;
use async_trait::async_trait;
use polars::prelude::{DataFrame, PolarsResult};
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column as _, Executor as _, Row as _, Statement as _, TypeInfo as _, ValueRef as _};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Destination for materialized datamarts
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Replace table `name` with the frame's schema and rows; returns rows written
    async fn replace_table(&self, name: &str, frame: &DataFrame) -> Result<usize, StoreError>;

    async fn read_table(&self, name: &str) -> Result<DataFrame, StoreError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and its parent directory
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        info!("Opening local store at {:?}", path);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = single_connection_pool(options).await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = single_connection_pool(options).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn replace_table(&self, name: &str, frame: &DataFrame) -> Result<usize, StoreError> {
        replace_frame(&self.pool, &quote_ident(name), name, frame).await
    }

    async fn read_table(&self, name: &str) -> Result<DataFrame, StoreError> {
        fetch_frame(&self.pool, &format!("SELECT * FROM {}", quote_ident(name))).await
    }
}

/// One long-lived connection: attached databases and in-memory databases
/// belong to a connection, so it must never be recycled.
pub(crate) async fn single_connection_pool(
    options: SqliteConnectOptions,
) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Drop and recreate `qualified` (already quoted) from the frame
pub(crate) async fn replace_frame(
    pool: &SqlitePool,
    qualified: &str,
    display_name: &str,
    frame: &DataFrame,
) -> Result<usize, StoreError> {
    let columns = frame
        .get_columns()
        .iter()
        .map(|column| {
            column_cells(column).map(|(kind, cells)| (column.name().to_string(), kind, cells))
        })
        .collect::<PolarsResult<Vec<_>>>()?;

    if columns.is_empty() {
        return Err(StoreError::EmptySchema(display_name.to_string()));
    }

    let definitions: Vec<String> = columns
        .iter()
        .map(|(name, kind, _)| format!("{} {}", quote_ident(name), sql_type(*kind)))
        .collect();
    let create = format!("CREATE TABLE {} ({})", qualified, definitions.join(", "));
    let insert = format!(
        "INSERT INTO {} VALUES ({})",
        qualified,
        vec!["?"; columns.len()].join(", ")
    );

    let mut tx = pool.begin().await?;

    sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified))
        .execute(&mut *tx)
        .await?;
    sqlx::query(&create).execute(&mut *tx).await?;

    for row in 0..frame.height() {
        let mut query = sqlx::query(&insert);
        for (_, _, cells) in &columns {
            query = bind_cell(query, &cells[row]);
        }
        query.execute(&mut *tx).await?;
    }

    tx.commit().await?;

    debug!(
        "Replaced {} with {} rows x {} columns",
        display_name,
        frame.height(),
        columns.len()
    );
    Ok(frame.height())
}

/// Run a query and collect the full result, column order as selected
pub(crate) async fn fetch_frame(pool: &SqlitePool, sql: &str) -> Result<DataFrame, StoreError> {
    let statement = pool.prepare(sql).await?;
    let declared: Vec<(String, Option<ColumnKind>)> = statement
        .columns()
        .iter()
        .map(|column| {
            (
                column.name().to_string(),
                declared_kind(column.type_info().name()),
            )
        })
        .collect();

    let rows = sqlx::query(sql).fetch_all(pool).await?;

    let mut cells: Vec<Vec<Cell>> = vec![Vec::with_capacity(rows.len()); declared.len()];
    for row in &rows {
        for (idx, column) in cells.iter_mut().enumerate() {
            column.push(read_cell(row, idx, declared[idx].1)?);
        }
    }

    let columns = declared
        .into_iter()
        .zip(cells)
        .map(|((name, declared), cells)| {
            let kind = declared.unwrap_or_else(|| ColumnKind::infer(&cells));
            build_column(&name, kind, cells)
        })
        .collect::<PolarsResult<Vec<_>>>()?;

    Ok(DataFrame::new(columns)?)
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Float => "REAL",
        ColumnKind::Boolean => "BOOLEAN",
        ColumnKind::Date => "DATE",
        ColumnKind::Text => "TEXT",
    }
}

/// Kind from a column's declared type; expressions have none and are
/// inferred from their values instead
fn declared_kind(type_name: &str) -> Option<ColumnKind> {
    match type_name {
        "INTEGER" => Some(ColumnKind::Integer),
        "REAL" => Some(ColumnKind::Float),
        "TEXT" => Some(ColumnKind::Text),
        "DATE" => Some(ColumnKind::Date),
        "BOOLEAN" => Some(ColumnKind::Boolean),
        _ => None,
    }
}

fn read_cell(
    row: &SqliteRow,
    idx: usize,
    declared: Option<ColumnKind>,
) -> Result<Cell, sqlx::Error> {
    let storage = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Cell::Null);
        }
        raw.type_info().name().to_string()
    };

    let cell = match storage.as_str() {
        "INTEGER" | "BOOLEAN" => {
            let value: i64 = row.try_get_unchecked(idx)?;
            if declared == Some(ColumnKind::Boolean) {
                Cell::Boolean(value != 0)
            } else {
                Cell::Integer(value)
            }
        }
        "REAL" => Cell::Float(row.try_get_unchecked(idx)?),
        "BLOB" => {
            let value: Vec<u8> = row.try_get_unchecked(idx)?;
            Cell::Text(String::from_utf8_lossy(&value).into_owned())
        }
        _ => Cell::Text(row.try_get_unchecked(idx)?),
    };

    Ok(cell)
}

fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    cell: &Cell,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match cell {
        Cell::Null => query.bind(None::<String>),
        Cell::Integer(v) => query.bind(*v),
        Cell::Float(v) => query.bind(*v),
        Cell::Boolean(v) => query.bind(*v),
        Cell::Date(v) => query.bind(v.format("%Y-%m-%d").to_string()),
        Cell::Text(v) => query.bind(v.clone()),
    }
}
