//! Utility functions for common operations

use crate::pipeline::error::FetchError;
use bytes::Bytes;
use reqwest::{Client, Url};
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::info;

/// Download a file via HTTP, following redirects.
/// Returns the final URL alongside the body.
pub async fn http_get(client: &Client, url: &str) -> Result<(String, Bytes), FetchError> {
    info!("Downloading from {}", url);

    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        return Err(FetchError::Status(status));
    }

    let final_url = response.url().to_string();
    if final_url != url {
        info!("{} resolved to {}", url, final_url);
    }

    let bytes = response.bytes().await?;
    info!("Downloaded {} bytes", bytes.len());
    Ok((final_url, bytes))
}

/// Extract the first CSV file from an in-memory ZIP archive
pub fn extract_csv_from_zip(zip_bytes: &[u8]) -> Result<Bytes, FetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let filename = file.name().to_string();

        if filename.to_ascii_lowercase().ends_with(".csv") {
            info!("Found CSV file in archive: {}", filename);
            // declared sizes come from the archive and are not trusted
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)?;
            return Ok(Bytes::from(buffer));
        }
    }

    Err(FetchError::NotTabular(
        "no CSV file found in ZIP archive".to_string(),
    ))
}

/// Canonical snake_case identifier accepted by both warehouse backends.
///
/// Runs of characters outside `[A-Za-z0-9]` collapse to one `_`, camelCase
/// boundaries become `_`, and a leading digit gets a `_` prefix. Returns an
/// empty string when nothing usable is left.
pub fn canonical_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;
    let mut previous_lower = false;

    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && previous_lower {
                pending_separator = true;
            }
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
            previous_lower = false;
        }
    }

    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    out
}

/// Last path segment of a URL or filesystem path, query string excluded
pub fn file_name_of(location: &str) -> Option<String> {
    if let Ok(url) = Url::parse(location) {
        if let Some(segments) = url.path_segments() {
            return segments
                .filter(|s| !s.is_empty())
                .last()
                .map(|s| s.to_string());
        }
    }

    Path::new(location)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Lower-cased extension of the file a location points at
pub fn extension_of(location: &str) -> Option<String> {
    file_name_of(location).and_then(|name| {
        Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    })
}

/// Table name for a source: the canonicalized file stem of its resolved location
pub fn logical_name_from_location(location: &str) -> Option<String> {
    let file_name = file_name_of(location)?;
    let stem = Path::new(&file_name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())?;

    let name = canonical_identifier(&stem);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
