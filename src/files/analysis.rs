/// Tabular dataset parsing and column analysis
///
/// Datasets arrive as CSV (header row + records) or JSON (an array of flat
/// objects). Both are parsed into a `Table` of optional string cells, which
/// feeds `analyze` (for the stored `DatasetAnalysis`) and the training
/// engine's preprocessing.

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::state::data::{ColumnSummary, ColumnType, DatasetAnalysis};

/// Number of distinct sample values kept per column
const SAMPLE_SIZE: usize = 5;

/// Cell spellings treated as missing values
const NULL_TOKENS: [&str; 6] = ["", "na", "n/a", "nan", "null", "none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

impl DataFormat {
    /// Pick the format from the file extension, falling back to the MIME type
    pub fn detect(file_name: &str, mime_type: &str) -> Result<Self> {
        let ext = std::path::Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());

        match ext.as_deref() {
            Some("csv") => return Ok(DataFormat::Csv),
            Some("json") => return Ok(DataFormat::Json),
            _ => {}
        }

        match mime_type.to_lowercase().as_str() {
            "text/csv" | "application/csv" => Ok(DataFormat::Csv),
            "application/json" | "text/json" => Ok(DataFormat::Json),
            _ => Err(StoreError::UnsupportedFormat(format!(
                "{} ({}): only CSV and JSON datasets are supported",
                file_name, mime_type
            ))),
        }
    }
}

/// Parsed dataset: header names and rows of optional cells
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Iterate the cells of one column
    pub fn column(&self, index: usize) -> impl Iterator<Item = Option<&str>> + '_ {
        self.rows.iter().map(move |row| row.get(index).and_then(|c| c.as_deref()))
    }
}

pub fn is_null(cell: &str) -> bool {
    let lowered = cell.trim().to_lowercase();
    NULL_TOKENS.contains(&lowered.as_str())
}

fn clean_cell(cell: &str) -> Option<String> {
    if is_null(cell) {
        None
    } else {
        Some(cell.trim().to_string())
    }
}

/// Parse raw dataset bytes in the given format
pub fn parse_table(bytes: &[u8], format: DataFormat) -> Result<Table> {
    match format {
        DataFormat::Csv => parse_csv(bytes),
        DataFormat::Json => parse_json(bytes),
    }
}

fn parse_csv(bytes: &[u8]) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| StoreError::DatasetInvalid(format!("unreadable header row: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(StoreError::DatasetInvalid("missing header row".to_string()));
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| StoreError::DatasetInvalid(format!("bad record {}: {}", line + 1, e)))?;

        // Blank lines come through as a single empty field
        if record.len() == 1 && record.get(0).map(str::is_empty).unwrap_or(true) && headers.len() > 1 {
            continue;
        }

        let mut row: Vec<Option<String>> = record.iter().take(headers.len()).map(clean_cell).collect();
        row.resize(headers.len(), None);
        rows.push(row);
    }

    Ok(Table { headers, rows })
}

fn parse_json(bytes: &[u8]) -> Result<Table> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::DatasetInvalid(format!("invalid JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        _ => {
            return Err(StoreError::DatasetInvalid(
                "JSON dataset must be an array of objects".to_string(),
            ))
        }
    };

    let mut headers: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for item in &items {
        let object = item.as_object().ok_or_else(|| {
            StoreError::DatasetInvalid("JSON dataset must be an array of objects".to_string())
        })?;
        for key in object.keys() {
            if seen.insert(key.clone()) {
                headers.push(key.clone());
            }
        }
    }

    let rows = items
        .iter()
        .filter_map(|item| item.as_object())
        .map(|object| {
            headers
                .iter()
                .map(|h| match object.get(h) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => clean_cell(s),
                    Some(other) => Some(other.to_string()),
                })
                .collect()
        })
        .collect();

    Ok(Table { headers, rows })
}

/// Infer a column type from its non-null cells
pub fn sniff_type<'a>(cells: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut any = false;
    let mut all_int = true;
    let mut all_num = true;

    for cell in cells {
        any = true;
        if cell.parse::<i64>().is_err() {
            all_int = false;
        }
        if !cell.parse::<f64>().map(f64::is_finite).unwrap_or(false) {
            all_num = false;
            break;
        }
    }

    match (any, all_int, all_num) {
        (true, true, _) => ColumnType::Integer,
        (true, false, true) => ColumnType::Float,
        _ => ColumnType::String,
    }
}

/// Summarize every column of a table
pub fn analyze(table: &Table) -> DatasetAnalysis {
    let columns = table
        .headers
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let mut distinct: HashSet<&str> = HashSet::new();
            let mut samples = Vec::new();
            let mut null_count = 0;

            for cell in table.column(i) {
                match cell {
                    None => null_count += 1,
                    Some(value) => {
                        if distinct.insert(value) && samples.len() < SAMPLE_SIZE {
                            samples.push(value.to_string());
                        }
                    }
                }
            }

            ColumnSummary {
                name: name.clone(),
                column_type: sniff_type(table.column(i).flatten()),
                unique_count: distinct.len(),
                null_count,
                sample_values: samples,
            }
        })
        .collect();

    DatasetAnalysis {
        headers: table.headers.clone(),
        row_count: table.rows.len(),
        columns,
    }
}

/// Parse and analyze in one step
pub fn analyze_bytes(bytes: &[u8], format: DataFormat) -> Result<DatasetAnalysis> {
    parse_table(bytes, format).map(|table| analyze(&table))
}
