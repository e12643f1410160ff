//! Schema normalizer - pure transformations from a raw table to a cleaned one
//!
//! Two passes, in order:
//! 1. column names become unique snake_case identifiers
//! 2. registry date columns present in the table are parsed into `Date`;
//!    cells that do not parse become null instead of failing the column

use crate::pipeline::frame::epoch_days;
use crate::pipeline::utils::canonical_identifier;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::collections::HashSet;
use tracing::{debug, warn};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%Y%m%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Clean a table: canonical column names, then permissive date parsing.
///
/// `date_columns` is the registry shared by every source; names missing
/// from this table are skipped.
pub fn clean(mut df: DataFrame, date_columns: &[String]) -> PolarsResult<DataFrame> {
    let original: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let renamed = canonical_column_names(original.iter().map(String::as_str));

    for (before, after) in original.iter().zip(&renamed) {
        if before != after {
            debug!("Renamed column {:?} -> {}", before, after);
        }
    }
    df.set_column_names(renamed.iter().map(String::as_str))?;

    for name in registry_names(date_columns) {
        let column = match df.column(&name) {
            Ok(column) => column,
            Err(_) => {
                debug!("Date column {} not present, skipping", name);
                continue;
            }
        };

        let parsed = to_date_column(column)?;

        let lost = parsed.null_count().saturating_sub(column.null_count());
        if lost > 0 {
            warn!(
                "{} value(s) in column {} could not be parsed as dates and were set to null",
                lost, name
            );
        }

        df.with_column(parsed)?;
    }

    Ok(df)
}

/// Unique canonical names, positions preserved.
/// Empty names become `column_{n}`; collisions get `_2`, `_3`, ...
pub fn canonical_column_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for (idx, raw) in names.into_iter().enumerate() {
        let mut base = canonical_identifier(raw);
        if base.is_empty() {
            base = format!("column_{}", idx + 1);
        }

        let mut candidate = base.clone();
        let mut suffix = 2;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        result.push(candidate);
    }

    result
}

fn registry_names(date_columns: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    date_columns
        .iter()
        .map(|name| canonical_identifier(name))
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

fn to_date_column(column: &Column) -> PolarsResult<Column> {
    match column.dtype() {
        DataType::Date => Ok(column.clone()),
        DataType::Datetime(_, _) => column.cast(&DataType::Date),
        _ => {
            let text = column.cast(&DataType::String)?;
            let days: Vec<Option<i32>> = text
                .as_materialized_series()
                .str()?
                .into_iter()
                .map(|value| value.and_then(parse_date).map(epoch_days))
                .collect();

            let series = Series::new(column.name().clone(), days).cast(&DataType::Date)?;
            Ok(series.into())
        }
    }
}

/// Parse a date in any of the accepted layouts; datetimes are truncated
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
                .map(|datetime| datetime.date())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|datetime| datetime.date_naive())
        })
}
