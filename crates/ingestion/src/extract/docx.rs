//! DOCX extraction from `word/document.xml`

use super::{ExtractedDocument, Page};
use crate::errors::IngestionError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use researchdesk_search::model::FileKind;
use std::io::{Cursor, Read};

const DOCUMENT_PART: &str = "word/document.xml";

pub fn extract(filename: &str, bytes: &[u8]) -> Result<ExtractedDocument, IngestionError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| IngestionError::extraction(filename, e))?;

    let mut xml = String::new();
    archive
        .by_name(DOCUMENT_PART)
        .map_err(|e| IngestionError::extraction(filename, format!("{}: {}", DOCUMENT_PART, e)))?
        .read_to_string(&mut xml)?;

    let pages = parse_document_xml(&xml).map_err(|e| IngestionError::extraction(filename, e))?;
    Ok(ExtractedDocument::new(FileKind::Docx, pages))
}

fn is_page_break(e: &BytesStart<'_>) -> bool {
    e.attributes()
        .flatten()
        .any(|a| a.key.local_name().as_ref() == b"type" && a.value.as_ref() == b"page")
}

/// Paragraphs become lines, table rows become ` | `-joined cells, and
/// explicit page breaks start a new page.
fn parse_document_xml(xml: &str) -> Result<Vec<Page>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);

    let mut pages = vec![String::new()];
    let mut paragraph = String::new();
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut table_depth = 0usize;
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tbl" => table_depth += 1,
                b"tr" => row.clear(),
                b"tc" => cell.clear(),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => paragraph.push('\t'),
                b"br" if is_page_break(&e) => {
                    flush_paragraph(&mut paragraph, pages.last_mut());
                    pages.push(String::new());
                }
                b"br" | b"cr" => paragraph.push('\n'),
                _ => {}
            },
            Event::Text(t) if in_text => paragraph.push_str(&t.unescape()?),
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" if table_depth > 0 => {
                    let text = paragraph.trim();
                    if !text.is_empty() {
                        if !cell.is_empty() {
                            cell.push(' ');
                        }
                        cell.push_str(text);
                    }
                    paragraph.clear();
                }
                b"p" => flush_paragraph(&mut paragraph, pages.last_mut()),
                b"tc" => row.push(cell.trim().to_string()),
                b"tr" => {
                    if row.iter().any(|c| !c.is_empty()) {
                        if let Some(page) = pages.last_mut() {
                            page.push_str(&row.join(" | "));
                            page.push('\n');
                        }
                    }
                    row.clear();
                }
                b"tbl" => table_depth = table_depth.saturating_sub(1),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    flush_paragraph(&mut paragraph, pages.last_mut());

    Ok(pages
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page::new(i as u32 + 1, text.trim_end().to_string()))
        .collect())
}

fn flush_paragraph(paragraph: &mut String, page: Option<&mut String>) {
    if let Some(page) = page {
        let text = paragraph.trim_end();
        if !text.is_empty() {
            page.push_str(text);
            page.push('\n');
        }
    }
    paragraph.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BODY: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Field notes</w:t></w:r></w:p>
    <w:p><w:r><w:t xml:space="preserve">Samples &amp; </w:t></w:r><w:r><w:t>controls</w:t></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>Site</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>pH</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>North</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>6.5</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
    <w:p><w:r><w:br w:type="page"/><w:t>Appendix</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

    fn build_docx(xml: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(DOCUMENT_PART, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_paragraphs_tables_and_page_breaks() {
        let doc = extract("notes.docx", &build_docx(BODY)).unwrap();

        assert_eq!(doc.kind, FileKind::Docx);
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(
            doc.pages[0].text,
            "Field notes\nSamples & controls\nSite | pH\nNorth | 6.5"
        );
        assert_eq!(doc.pages[1], Page::new(2, "Appendix"));
    }

    #[test]
    fn test_missing_document_part() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<x/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        assert!(matches!(
            extract("empty.docx", &bytes),
            Err(IngestionError::Extraction { .. })
        ));
        assert!(extract("junk.docx", b"plain bytes").is_err());
    }
}
