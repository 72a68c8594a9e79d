// 🏗️ Expense File Parser
// Reads quarterly accounting extracts against a declared positional schema

use crate::config::ExpenseFileSchema;
use crate::error::FileReadError;
use crate::registry::TextEncoding;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

// ============================================================================
// CORE TYPES
// ============================================================================

/// RawExpenseLine - one row of an accounting extract, before validation.
/// Only lives for the duration of a single file scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExpenseLine {
    pub date: String,              // "YYYY-MM" or "YYYY-MM-DD"
    pub registry_id: String,       // As written in the file, not yet padded
    pub account_code: String,
    pub description: String,
    pub opening_balance: String,
    pub closing_balance: String,   // Decimal-comma, e.g. "1500,00"

    // Provenance
    pub source_file: String,
    pub line_number: usize,
}

impl RawExpenseLine {
    /// Build a line from bare field values, positions as in the default schema
    pub fn from_fields(fields: &[&str]) -> Self {
        let field = |i: usize| fields.get(i).map(|s| s.trim().to_string()).unwrap_or_default();
        RawExpenseLine {
            date: field(0),
            registry_id: field(1),
            account_code: field(2),
            description: field(3),
            opening_balance: field(4),
            closing_balance: field(5),
            source_file: String::new(),
            line_number: 0,
        }
    }

    fn from_record(record: &csv::StringRecord, schema: &ExpenseFileSchema, source_file: &str, line_number: usize) -> Self {
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        RawExpenseLine {
            date: field(schema.date),
            registry_id: field(schema.registry_id),
            account_code: field(schema.account_code),
            description: field(schema.description),
            opening_balance: field(schema.opening_balance),
            closing_balance: field(schema.closing_balance),
            source_file: source_file.to_string(),
            line_number,
        }
    }
}

/// Parse a monetary cell of an accounting extract. The extracts are strictly
/// decimal-comma: `.` only groups thousands ("1.234,56", "1.500", "-12,5").
pub fn parse_source_amount(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let normalized = value.replace('.', "").replace(',', ".");
    normalized.parse::<f64>().ok().and_then(finite_amount)
}

/// Lenient parser for values this pipeline wrote itself (`.` decimal), also
/// accepting decimal-comma cells.
pub fn parse_amount(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let normalized = if value.contains(',') {
        value.replace('.', "").replace(',', ".")
    } else {
        value.to_string()
    };

    normalized.parse::<f64>().ok().and_then(finite_amount)
}

// -0.0 is folded into 0.0 so it never reaches the outputs
fn finite_amount(value: f64) -> Option<f64> {
    match value {
        v if !v.is_finite() => None,
        v if v == 0.0 => Some(0.0),
        v => Some(v),
    }
}

// ============================================================================
// FILE PARSING
// ============================================================================

/// Parse one semicolon-delimited extract.
///
/// The header width must equal `schema.width`; otherwise the file is refused
/// before any row is read. Short rows yield empty fields and are left to the
/// validator to reject.
pub fn parse_expense_file(path: &Path, schema: &ExpenseFileSchema) -> Result<Vec<RawExpenseLine>, FileReadError> {
    let bytes = fs::read(path).map_err(|source| FileReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let text = TextEncoding::Utf8Sig
        .decode(&bytes)
        .or_else(|| TextEncoding::Latin1.decode(&bytes))
        .unwrap_or_default();

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.csv")
        .to_string();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let found = reader
        .headers()
        .map_err(|source| FileReadError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    if found != schema.width {
        return Err(FileReadError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: schema.width,
            found,
        });
    }

    let mut lines = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        let record = result.map_err(|source| FileReadError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        // +2: 1-indexed plus header row
        lines.push(RawExpenseLine::from_record(&record, schema, &filename, line_num + 2));
    }

    trace!(file = %filename, rows = lines.len(), "expense file parsed");
    Ok(lines)
}

// ============================================================================
// PERIOD DISCOVERY
// ============================================================================

fn csv_stem(path: &Path) -> Option<&str> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        path.file_stem().and_then(|s| s.to_str())
    } else {
        None
    }
}

fn trailing_year(stem: &str) -> Option<i32> {
    if stem.len() < 4 || !stem.is_char_boundary(stem.len() - 4) {
        return None;
    }
    let tail = &stem[stem.len() - 4..];
    if tail.chars().all(|c| c.is_ascii_digit()) {
        tail.parse().ok()
    } else {
        None
    }
}

/// Source files for `year` (file stem ends with the year), sorted by name.
/// File names listed in `exclude` (e.g. earlier consolidated output) are skipped.
pub fn period_files(dir: &Path, year: i32, exclude: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let suffix = year.to_string();
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            !exclude.contains(&name)
        })
        .filter(|path| csv_stem(path).map(|s| s.ends_with(&suffix)).unwrap_or(false))
        .collect();

    files.sort();
    Ok(files)
}

/// Latest year found at the end of a `.csv` file stem in `dir`
pub fn latest_period(dir: &Path) -> std::io::Result<Option<i32>> {
    let latest = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| csv_stem(&path).and_then(trailing_year))
        .max();

    Ok(latest)
}
