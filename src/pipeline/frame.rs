//! Cell-level conversions between polars frames and row-oriented backends
//!
//! Backends (SQLite, the BigQuery REST API, spreadsheets) hand us values
//! one cell at a time. Every column is reduced to one of five kinds so the
//! same conversion code serves all of them.

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Storage kind of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Date,
    Text,
}

impl ColumnKind {
    pub fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64 => ColumnKind::Integer,
            DataType::Float32 | DataType::Float64 => ColumnKind::Float,
            DataType::Boolean => ColumnKind::Boolean,
            DataType::Date => ColumnKind::Date,
            _ => ColumnKind::Text,
        }
    }

    /// Narrowest kind holding every non-null cell
    pub fn infer(cells: &[Cell]) -> Self {
        let mut kind: Option<ColumnKind> = None;

        for cell in cells {
            let cell_kind = match cell {
                Cell::Null => continue,
                Cell::Integer(_) => ColumnKind::Integer,
                Cell::Float(_) => ColumnKind::Float,
                Cell::Boolean(_) => ColumnKind::Boolean,
                Cell::Date(_) => ColumnKind::Date,
                Cell::Text(_) => ColumnKind::Text,
            };

            kind = Some(match (kind, cell_kind) {
                (None, k) => k,
                (Some(a), b) if a == b => a,
                (Some(ColumnKind::Integer), ColumnKind::Float)
                | (Some(ColumnKind::Float), ColumnKind::Integer) => ColumnKind::Float,
                _ => ColumnKind::Text,
            });
        }

        kind.unwrap_or(ColumnKind::Text)
    }
}

/// A single value
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Text(String),
}

impl Cell {
    fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Integer(v) => Some(*v),
            Cell::Boolean(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(v) => Some(*v),
            Cell::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Integer(v) => Some(v.to_string()),
            Cell::Float(v) => Some(v.to_string()),
            Cell::Boolean(v) => Some(v.to_string()),
            Cell::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            Cell::Text(v) => Some(v),
        }
    }

    /// JSON value for newline-delimited JSON payloads
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null => serde_json::Value::Null,
            Cell::Integer(v) => serde_json::Value::from(*v),
            Cell::Float(v) if v.is_finite() => serde_json::Value::from(*v),
            Cell::Float(_) => serde_json::Value::Null,
            Cell::Boolean(v) => serde_json::Value::from(*v),
            Cell::Date(v) => serde_json::Value::from(v.format("%Y-%m-%d").to_string()),
            Cell::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }
}

pub fn date_from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_DAYS_FROM_CE)
}

pub fn epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// Read a column out as its kind and one cell per row
pub fn column_cells(column: &Column) -> PolarsResult<(ColumnKind, Vec<Cell>)> {
    let kind = ColumnKind::of(column.dtype());

    let cells = match kind {
        ColumnKind::Integer => {
            let cast = column.cast(&DataType::Int64)?;
            cast.as_materialized_series()
                .i64()?
                .into_iter()
                .map(|v| v.map_or(Cell::Null, Cell::Integer))
                .collect()
        }
        ColumnKind::Float => {
            let cast = column.cast(&DataType::Float64)?;
            cast.as_materialized_series()
                .f64()?
                .into_iter()
                .map(|v| v.map_or(Cell::Null, Cell::Float))
                .collect()
        }
        ColumnKind::Boolean => column
            .as_materialized_series()
            .bool()?
            .into_iter()
            .map(|v| v.map_or(Cell::Null, Cell::Boolean))
            .collect(),
        ColumnKind::Date => {
            let cast = column.cast(&DataType::Int32)?;
            cast.as_materialized_series()
                .i32()?
                .into_iter()
                .map(|v| {
                    v.and_then(date_from_epoch_days)
                        .map_or(Cell::Null, Cell::Date)
                })
                .collect()
        }
        ColumnKind::Text => {
            let cast = column.cast(&DataType::String)?;
            cast.as_materialized_series()
                .str()?
                .into_iter()
                .map(|v| v.map_or(Cell::Null, |s| Cell::Text(s.to_string())))
                .collect()
        }
    };

    Ok((kind, cells))
}

/// Build a column of the given kind; cells that do not fit the kind become null
pub fn build_column(name: &str, kind: ColumnKind, cells: Vec<Cell>) -> PolarsResult<Column> {
    let series = match kind {
        ColumnKind::Integer => {
            let values: Vec<Option<i64>> = cells.iter().map(Cell::as_i64).collect();
            Series::new(name.into(), values)
        }
        ColumnKind::Float => {
            let values: Vec<Option<f64>> = cells.iter().map(Cell::as_f64).collect();
            Series::new(name.into(), values)
        }
        ColumnKind::Boolean => {
            let values: Vec<Option<bool>> = cells.iter().map(Cell::as_bool).collect();
            Series::new(name.into(), values)
        }
        ColumnKind::Date => {
            let values: Vec<Option<i32>> = cells
                .iter()
                .map(|cell| cell.as_date().map(epoch_days))
                .collect();
            Series::new(name.into(), values).cast(&DataType::Date)?
        }
        ColumnKind::Text => {
            let values: Vec<Option<String>> = cells.into_iter().map(Cell::into_text).collect();
            Series::new(name.into(), values)
        }
    };

    Ok(series.into())
}

/// Assemble a frame from named cell columns, inferring each column's kind
pub fn frame_from_cells(columns: Vec<(String, Vec<Cell>)>) -> PolarsResult<DataFrame> {
    let built = columns
        .into_iter()
        .map(|(name, cells)| {
            let kind = ColumnKind::infer(&cells);
            build_column(&name, kind, cells)
        })
        .collect::<PolarsResult<Vec<_>>>()?;

    DataFrame::new(built)
}
