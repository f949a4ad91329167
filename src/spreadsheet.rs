//! Spreadsheet parsing: the thin boundary between an uploaded `.xlsx`/`.xls`
//! file and the row records the Classifier and Batch Builder consume. An
//! external collaborator by design — this module's only job is to get from
//! bytes to `WorklistRow`s, nothing more.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::error::{EngineError, Result};
use crate::model::Money;

/// One worklist line, straight off the sheet with minimal coercion: strings
/// trimmed, numbers parsed, dates parsed. Classification happens downstream.
#[derive(Debug, Clone)]
pub struct WorklistRow {
    pub po_number: String,
    pub po_line: String,
    pub supplier_number: String,
    pub supplier_name: String,
    pub due_date: NaiveDate,
    pub recommended_date: Option<NaiveDate>,
    pub calculated_total_value: Money,
}

const EXPECTED_HEADERS: &[&str] = &[
    "po_number",
    "po_line",
    "supplier_number",
    "supplier_name",
    "due_date",
    "recommended_date",
    "calculated_total_value",
];

/// Parse an uploaded workbook's first worksheet into worklist rows.
///
/// Header matching is case-insensitive and tolerant of spaces/underscores
/// (`"PO Number"` and `"po_number"` both match). Rows missing a required
/// field are skipped and counted, not treated as a hard parse failure — a
/// single malformed row in a 5,000-row worklist shouldn't sink the upload.
pub fn parse_workbook(bytes: &[u8]) -> Result<ParsedWorkbook> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| EngineError::ValidationError(format!("could not open workbook: {e}")))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::ValidationError("workbook has no worksheets".into()))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| EngineError::ValidationError(format!("could not read worksheet '{sheet_name}': {e}")))?;

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| EngineError::ValidationError("worksheet has no header row".into()))?;
    let columns = index_columns(header)?;

    let mut parsed = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        if row.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }
        match parse_row(row, &columns) {
            Some(worklist_row) => parsed.push(worklist_row),
            None => skipped += 1,
        }
    }

    Ok(ParsedWorkbook {
        rows: parsed,
        rows_skipped: skipped,
    })
}

pub struct ParsedWorkbook {
    pub rows: Vec<WorklistRow>,
    pub rows_skipped: usize,
}

struct Columns {
    po_number: usize,
    po_line: usize,
    supplier_number: usize,
    supplier_name: usize,
    due_date: usize,
    recommended_date: usize,
    calculated_total_value: usize,
}

fn normalize_header(cell: &Data) -> String {
    cell.to_string().trim().to_lowercase().replace([' ', '-'], "_")
}

fn index_columns(header: &[Data]) -> Result<Columns> {
    let normalized: Vec<String> = header.iter().map(normalize_header).collect();
    let find = |name: &str| -> Result<usize> {
        normalized
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| EngineError::ValidationError(format!("missing required column '{name}'")))
    };

    // Fail fast on a missing header; this one *is* a hard parse error since
    // no row in the sheet could possibly be classified without it.
    for required in EXPECTED_HEADERS {
        find(required)?;
    }

    Ok(Columns {
        po_number: find("po_number")?,
        po_line: find("po_line")?,
        supplier_number: find("supplier_number")?,
        supplier_name: find("supplier_name")?,
        due_date: find("due_date")?,
        recommended_date: find("recommended_date")?,
        calculated_total_value: find("calculated_total_value")?,
    })
}

fn parse_row(row: &[Data], columns: &Columns) -> Option<WorklistRow> {
    let po_number = cell_string(row.get(columns.po_number)?)?;
    let po_line = cell_string(row.get(columns.po_line)?)?;
    let supplier_number = cell_string(row.get(columns.supplier_number)?)?;
    let supplier_name = cell_string(row.get(columns.supplier_name)?)?;
    let due_date = cell_date(row.get(columns.due_date)?)?;
    let recommended_date = row.get(columns.recommended_date).and_then(cell_date);
    let calculated_total_value = cell_decimal(row.get(columns.calculated_total_value)?)?;

    Some(WorklistRow {
        po_number,
        po_line,
        supplier_number,
        supplier_name,
        due_date,
        recommended_date,
        calculated_total_value: Money::new(calculated_total_value),
    })
}

fn cell_string(cell: &Data) -> Option<String> {
    let s = match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|d| d.date()),
        Data::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s.trim(), "%m/%d/%Y"))
            .ok(),
        _ => None,
    }
}

fn cell_decimal(cell: &Data) -> Option<Decimal> {
    match cell {
        Data::Float(f) => Decimal::try_from(*f).ok(),
        Data::Int(i) => Some(Decimal::from(*i)),
        Data::String(s) => s.trim().replace(['$', ','], "").parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_header_handles_spaces_and_case() {
        assert_eq!(normalize_header(&Data::String("PO Number".into())), "po_number");
        assert_eq!(normalize_header(&Data::String("Calculated-Total-Value".into())), "calculated_total_value");
    }

    #[test]
    fn cell_decimal_strips_currency_formatting() {
        assert_eq!(cell_decimal(&Data::String("$1,234.50".into())), Some(Decimal::new(123450, 2)));
    }

    #[test]
    fn cell_date_parses_iso_and_us_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert_eq!(cell_date(&Data::String("2025-03-01".into())), Some(expected));
        assert_eq!(cell_date(&Data::String("03/01/2025".into())), Some(expected));
    }

    #[test]
    fn cell_string_rejects_blank() {
        assert_eq!(cell_string(&Data::String("   ".into())), None);
    }
}
