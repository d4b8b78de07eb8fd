//! PDF text extraction
//!
//! Extracts per-page text using lopdf.

use super::{ExtractedDocument, Page};
use crate::errors::IngestionError;
use researchdesk_search::model::FileKind;
use tracing::{debug, warn};

/// Extract text from PDF bytes, one `Page` per PDF page
pub fn extract(filename: &str, bytes: &[u8]) -> Result<ExtractedDocument, IngestionError> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| IngestionError::extraction(filename, format!("Failed to load PDF: {}", e)))?;

    let page_ids = doc.get_pages();
    debug!(page_count = page_ids.len(), "Extracting text from PDF");

    let mut pages = Vec::with_capacity(page_ids.len());
    for (page_num, page_id) in page_ids {
        match extract_page_text(&doc, page_num, page_id) {
            Ok(text) => {
                let cleaned = clean_text(&text);
                if !cleaned.is_empty() {
                    pages.push(Page::new(page_num, cleaned));
                }
            }
            Err(e) => {
                warn!(page = page_num, error = %e, "Failed to extract text from page, skipping");
            }
        }
    }

    if pages.is_empty() {
        return Err(IngestionError::extraction(filename, "No text content extracted from PDF"));
    }

    Ok(ExtractedDocument::new(FileKind::Pdf, pages))
}

/// Font-aware extraction first, raw content stream scan when that yields nothing
fn extract_page_text(doc: &lopdf::Document, page_num: u32, page_id: lopdf::ObjectId) -> Result<String, String> {
    match doc.extract_text(&[page_num]) {
        Ok(text) if !text.trim().is_empty() => return Ok(text),
        Ok(_) => {}
        Err(e) => debug!(page = page_num, error = %e, "Font-aware extraction failed"),
    }

    let content = doc.get_page_content(page_id).map_err(|e| e.to_string())?;
    Ok(extract_text_from_content(&content))
}

/// Extract text from PDF content stream
fn extract_text_from_content(content: &[u8]) -> String {
    // Looks for text between BT and ET operators
    let content_str = String::from_utf8_lossy(content);
    let mut text = String::new();
    let mut in_text_block = false;
    let mut current_text = String::new();

    for line in content_str.lines() {
        let trimmed = line.trim();

        if trimmed == "BT" {
            in_text_block = true;
            continue;
        }

        if trimmed == "ET" {
            in_text_block = false;
            if !current_text.is_empty() {
                text.push_str(&current_text);
                text.push(' ');
                current_text.clear();
            }
            continue;
        }

        if in_text_block {
            if trimmed == "T*" || trimmed.ends_with(" Td") || trimmed.ends_with(" TD") {
                current_text.push(' ');
            } else if let Some(text_content) = extract_text_from_operator(trimmed) {
                current_text.push_str(&text_content);
            }
        }
    }

    text
}

/// Extract text from a PDF text operator: `(..) Tj`, `(..) '`, `(..) "` or `[..] TJ`
fn extract_text_from_operator(line: &str) -> Option<String> {
    if line.ends_with("Tj") || line.ends_with('\'') || line.ends_with('"') {
        let start = line.find('(')?;
        let end = line.rfind(')')?;
        if end > start {
            return Some(decode_pdf_string(&line[start + 1..end]));
        }
        return None;
    }

    if line.ends_with("TJ") {
        let mut result = String::new();
        let mut depth = 0usize;
        let mut escaped = false;
        let mut current = String::new();

        for ch in line.chars() {
            if depth > 0 && escaped {
                current.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' if depth > 0 => {
                    current.push(ch);
                    escaped = true;
                }
                '(' => {
                    if depth > 0 {
                        current.push(ch);
                    }
                    depth += 1;
                }
                ')' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        result.push_str(&decode_pdf_string(&current));
                        current.clear();
                    } else {
                        current.push(ch);
                    }
                }
                _ if depth > 0 => current.push(ch),
                _ => {}
            }
        }

        if !result.is_empty() {
            return Some(result);
        }
    }

    None
}

/// Decode PDF string escapes, including `\ddd` octal codes
fn decode_pdf_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('b') | Some('f') => {}
            Some(d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(next) => {
                            code = code * 8 + next;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if let Some(c) = char::from_u32(code) {
                    result.push(c);
                }
            }
            Some(c) => result.push(c),
            None => {}
        }
    }

    result
}

/// Collapse whitespace, drop BOMs and NULs, normalise curly quotes
fn clean_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(['\u{FEFF}', '\0'], "")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    fn build_pdf(pages: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_extracts_each_page() {
        let bytes = build_pdf(&["Hello World", "", "Closing remarks"]);
        let doc = extract("two.pdf", &bytes).unwrap();

        assert_eq!(doc.kind, FileKind::Pdf);
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.pages[0].number, 1);
        assert!(doc.pages[0].text.contains("Hello World"));
        assert_eq!(doc.pages[1].number, 3);
    }

    #[test]
    fn test_invalid_pdf() {
        let err = extract("broken.pdf", b"not a pdf").unwrap_err();
        assert!(matches!(err, IngestionError::Extraction { .. }));
    }

    #[test]
    fn test_content_stream_fallback() {
        let stream = b"BT\n/F1 12 Tf\n(Soil) Tj\nT*\n[(nitro) -20 (gen\\051)] TJ\nET\n";
        assert_eq!(extract_text_from_content(stream).trim(), "Soil nitrogen)");
    }

    #[test]
    fn test_clean_text() {
        let input = "Hello   World\n\nTest \u{201C}quoted\u{201D}";
        assert_eq!(clean_text(input), "Hello World Test \"quoted\"");
    }

    #[test]
    fn test_decode_pdf_string() {
        assert_eq!(decode_pdf_string("Hello\\nWorld"), "Hello\nWorld");
        assert_eq!(decode_pdf_string("Test\\(paren\\)"), "Test(paren)");
        assert_eq!(decode_pdf_string("caf\\351"), "café");
    }
}
