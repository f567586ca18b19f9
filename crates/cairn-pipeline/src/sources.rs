//! Built-in source readers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use cairn_types::{CairnError, Result};

use crate::graph::SourceFormat;
use crate::registry::SourceReader;

/// Emits `{format, paths, hints}` without opening the files.
///
/// Formats without a dedicated reader are handed to analysis functions as
/// references; the functions open them with their own format readers.
pub struct PathReferenceReader;

#[async_trait]
impl SourceReader for PathReferenceReader {
    async fn read(
        &self,
        format: SourceFormat,
        paths: &[PathBuf],
        hints: &BTreeMap<String, String>,
        _params: &Value,
    ) -> Result<Value> {
        for path in paths {
            if !tokio::fs::try_exists(path).await? {
                return Err(CairnError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("source file {} does not exist", path.display()),
                )));
            }
        }
        Ok(json!({
            "format": format,
            "paths": paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            "hints": hints,
        }))
    }
}

/// Reads a numeric CSV file into a row-major matrix.
///
/// Params: `setHeader` (row index of a header line to skip, or null) and
/// `transpose` (bool). Empty cells become `null`.
pub struct CsvReader;

#[async_trait]
impl SourceReader for CsvReader {
    async fn read(
        &self,
        _format: SourceFormat,
        paths: &[PathBuf],
        _hints: &BTreeMap<String, String>,
        params: &Value,
    ) -> Result<Value> {
        let path = paths
            .first()
            .ok_or_else(|| CairnError::Other("csv source has no path".into()))?;
        let text = tokio::fs::read_to_string(path).await?;
        let header = params.get("setHeader").and_then(Value::as_u64).map(|h| h as usize);
        let transpose = params.get("transpose").and_then(Value::as_bool).unwrap_or(false);

        let matrix = parse_numeric_csv(&text, header)
            .map_err(|message| CairnError::Other(format!("{}: {message}", path.display())))?;
        let matrix = if transpose { transposed(matrix) } else { matrix };
        Ok(json!(matrix))
    }
}

fn parse_numeric_csv(text: &str, header: Option<usize>) -> std::result::Result<Vec<Vec<Option<f64>>>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        if Some(i) == header {
            continue;
        }
        let row = record
            .iter()
            .map(|cell| {
                let cell = cell.trim();
                if cell.is_empty() {
                    Ok(None)
                } else {
                    cell.parse::<f64>()
                        .map(Some)
                        .map_err(|_| format!("row {i}: '{cell}' is not a number"))
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    Ok(rows)
}

fn transposed(matrix: Vec<Vec<Option<f64>>>) -> Vec<Vec<Option<f64>>> {
    let width = matrix.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|c| matrix.iter().map(|row| row.get(c).copied().flatten()).collect())
        .collect()
}
