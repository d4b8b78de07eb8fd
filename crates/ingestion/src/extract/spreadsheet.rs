//! CSV and Excel workbook extraction

use super::{ExtractedDocument, Page};
use crate::errors::IngestionError;
use calamine::Reader;
use researchdesk_search::model::FileKind;
use std::io::Cursor;
use tracing::warn;

/// CSV rows per page
const ROWS_PER_PAGE: usize = 100;

/// Header line followed by rows, cells joined with ` | `; the header repeats on every page
pub fn extract_csv(filename: &str, bytes: &[u8]) -> Result<ExtractedDocument, IngestionError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);

    let header = reader
        .headers()
        .map_err(|e| IngestionError::extraction(filename, e))?
        .iter()
        .collect::<Vec<_>>()
        .join(" | ");

    let mut pages = Vec::new();
    let mut current = Vec::with_capacity(ROWS_PER_PAGE);
    let mut skipped = 0usize;

    for record in reader.records() {
        match record {
            Ok(record) => current.push(record.iter().collect::<Vec<_>>().join(" | ")),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "Skipping malformed CSV row");
                continue;
            }
        }
        if current.len() == ROWS_PER_PAGE {
            pages.push(csv_page(pages.len(), &header, &current));
            current.clear();
        }
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(csv_page(pages.len(), &header, &current));
    }

    if skipped > 0 {
        warn!(skipped, filename, "Some CSV rows could not be parsed");
    }
    Ok(ExtractedDocument::new(FileKind::Csv, pages))
}

fn csv_page(existing: usize, header: &str, rows: &[String]) -> Page {
    let mut text = String::from(header);
    for row in rows {
        text.push('\n');
        text.push_str(row);
    }
    Page::new(existing as u32 + 1, text)
}

/// One page per sheet (xlsx or xls)
pub fn extract_workbook(filename: &str, bytes: &[u8]) -> Result<ExtractedDocument, IngestionError> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| IngestionError::extraction(filename, e))?;

    let mut pages = Vec::new();
    for (i, sheet_name) in workbook.sheet_names().to_vec().into_iter().enumerate() {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                warn!(sheet = %sheet_name, error = %e, "Failed to read sheet, skipping");
                continue;
            }
        };

        let mut sheet_content = format!("Sheet: {}", sheet_name);
        let mut has_rows = false;
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            sheet_content.push('\n');
            sheet_content.push_str(&cells.join(" | "));
            has_rows = true;
        }

        if has_rows {
            pages.push(Page::new(i as u32 + 1, sheet_content));
        }
    }

    Ok(ExtractedDocument::new(FileKind::Spreadsheet, pages))
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.trim().to_string(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        calamine::Data::DateTimeIso(s) | calamine::Data::DurationIso(s) => s.clone(),
        calamine::Data::Error(_) => String::new(),
    }
}
