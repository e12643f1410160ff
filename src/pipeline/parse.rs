//! Parse functions - turn raw source content into a tabular value

use crate::pipeline::error::FetchError;
use crate::pipeline::frame::{frame_from_cells, Cell};
use crate::pipeline::types::RawData;
use crate::pipeline::utils::extract_csv_from_zip;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use polars::prelude::*;
use std::io::Cursor;
use tracing::info;

/// Rows scanned when inferring CSV column types
const CSV_INFER_SCHEMA_ROWS: usize = 10_000;

/// Parse raw content into a frame according to its format
pub fn parse_raw(raw: &RawData) -> Result<DataFrame, FetchError> {
    info!(
        "Parsing {} content ({} bytes)",
        raw.format_name(),
        raw.as_bytes().len()
    );

    let df = match raw {
        RawData::Csv(bytes) => parse_csv(bytes)?,
        RawData::Parquet(bytes) => parse_parquet(bytes)?,
        RawData::Spreadsheet(bytes) => parse_xlsx(bytes)?,
        RawData::Archive(bytes) => parse_csv(&extract_csv_from_zip(bytes)?)?,
    };

    if df.width() == 0 {
        return Err(FetchError::NotTabular("no columns found".to_string()));
    }

    info!("Parsed {} rows x {} columns", df.height(), df.width());
    Ok(df)
}

/// Parse CSV with a header row
pub fn parse_csv(bytes: &[u8]) -> Result<DataFrame, FetchError> {
    if looks_like_html(bytes) {
        return Err(FetchError::NotTabular(
            "received an HTML page instead of CSV".to_string(),
        ));
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(CSV_INFER_SCHEMA_ROWS))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;

    Ok(df)
}

pub fn parse_parquet(bytes: &[u8]) -> Result<DataFrame, FetchError> {
    let df = ParquetReader::new(Cursor::new(bytes)).finish()?;
    Ok(df)
}

/// Parse the first sheet of an XLSX workbook; the first row holds headers
pub fn parse_xlsx(bytes: &[u8]) -> Result<DataFrame, FetchError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;

    let sheet_names = workbook.sheet_names();
    let sheet_name = sheet_names
        .first()
        .ok_or_else(|| FetchError::NotTabular("no sheets found in workbook".to_string()))?
        .clone();
    info!("Reading sheet: {}", sheet_name);

    let range = workbook.worksheet_range(&sheet_name)?;
    let mut rows = range.rows();

    let headers: Vec<String> = match rows.next() {
        Some(header_row) => header_row.iter().map(|cell| cell.to_string()).collect(),
        None => return Err(FetchError::NotTabular("sheet is empty".to_string())),
    };

    let mut columns: Vec<Vec<Cell>> = vec![Vec::new(); headers.len()];
    for row in rows {
        for (idx, column) in columns.iter_mut().enumerate() {
            column.push(row.get(idx).map_or(Cell::Null, spreadsheet_cell));
        }
    }

    let df = frame_from_cells(headers.into_iter().zip(columns).collect())?;
    Ok(df)
}

fn spreadsheet_cell(value: &Data) -> Cell {
    match value {
        Data::Empty => Cell::Null,
        Data::Int(i) => Cell::Integer(*i),
        Data::Float(f) => Cell::Float(*f),
        Data::Bool(b) => Cell::Boolean(*b),
        Data::String(s) if s.trim().is_empty() => Cell::Null,
        Data::String(s) => Cell::Text(s.clone()),
        other => Cell::Text(other.to_string()),
    }
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head: String = String::from_utf8_lossy(&bytes[..bytes.len().min(256)])
        .trim_start()
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();

    head.starts_with("<!doctype html") || head.starts_with("<html")
}
