//! Text extraction
//!
//! Dispatches on the file extension (falling back to the MIME type) and
//! produces page-numbered text. Parsers that block run on the blocking pool.

mod docx;
mod image;
mod pdf;
mod spreadsheet;
mod text;

use crate::errors::IngestionError;
use researchdesk_common::llm::ChatModel;
use researchdesk_common::tokens::TokenUsage;
use researchdesk_search::model::{content_hash, FileKind};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// One page (or sheet, or block of rows) of extracted text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    /// 1-based
    pub number: u32,
    pub text: String,
}

impl Page {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedDocument {
    pub kind: FileKind,
    pub pages: Vec<Page>,
    /// SHA-256 of `full_text()`
    pub content_hash: String,
    /// Tokens spent on model calls during extraction (image descriptions)
    pub model_usage: TokenUsage,
}

impl ExtractedDocument {
    pub(crate) fn new(kind: FileKind, pages: Vec<Page>) -> Self {
        let pages: Vec<Page> = pages
            .into_iter()
            .filter(|p| !p.text.trim().is_empty())
            .collect();
        let mut document = Self {
            kind,
            pages,
            content_hash: String::new(),
            model_usage: TokenUsage::default(),
        };
        document.content_hash = content_hash(&document.full_text());
        document
    }

    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Highest page number seen
    pub fn page_count(&self) -> u32 {
        self.pages.iter().map(|p| p.number).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Lowercased extension of `filename`, if any
pub fn extension(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() || ext.contains('/') {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn kind_from_extension(ext: &str) -> Option<FileKind> {
    match ext {
        "pdf" => Some(FileKind::Pdf),
        "docx" => Some(FileKind::Docx),
        "csv" => Some(FileKind::Csv),
        "xlsx" | "xls" => Some(FileKind::Spreadsheet),
        "txt" | "md" | "markdown" | "json" => Some(FileKind::Text),
        "png" | "jpg" | "jpeg" | "gif" | "webp" => Some(FileKind::Image),
        _ => None,
    }
}

fn kind_from_mime(mime: &str) -> Option<FileKind> {
    let essence = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match essence.as_str() {
        "application/pdf" => Some(FileKind::Pdf),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(FileKind::Docx),
        "text/csv" => Some(FileKind::Csv),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" | "application/vnd.ms-excel" => {
            Some(FileKind::Spreadsheet)
        }
        "text/plain" | "text/markdown" | "application/json" => Some(FileKind::Text),
        "image/png" | "image/jpeg" | "image/gif" | "image/webp" => Some(FileKind::Image),
        _ => None,
    }
}

/// Decide how to read a file: extension first, then the declared MIME type
pub fn detect_kind(filename: &str, content_type: Option<&str>) -> Result<FileKind, IngestionError> {
    let ext = extension(filename);
    if let Some(kind) = ext.as_deref().and_then(kind_from_extension) {
        return Ok(kind);
    }
    if let Some(kind) = content_type.and_then(kind_from_mime) {
        return Ok(kind);
    }
    Err(IngestionError::UnsupportedFileType {
        extension: ext.unwrap_or_else(|| content_type.unwrap_or("unknown").to_string()),
    })
}

/// Whether `path` names a file the extractor can read
pub fn is_supported(filename: &str) -> bool {
    detect_kind(filename, None).is_ok()
}

/// File-type dispatching extractor
pub struct Extractor {
    vision: Arc<dyn ChatModel>,
}

impl Extractor {
    /// `vision` describes uploaded images
    pub fn new(vision: Arc<dyn ChatModel>) -> Self {
        Self { vision }
    }

    #[instrument(skip(self, bytes, content_type), fields(size = bytes.len()))]
    pub async fn extract(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ExtractedDocument, IngestionError> {
        let kind = detect_kind(filename, content_type)?;
        let name = filename.to_string();

        let document = match kind {
            FileKind::Pdf => tokio::task::spawn_blocking(move || pdf::extract(&name, &bytes)).await??,
            FileKind::Docx => tokio::task::spawn_blocking(move || docx::extract(&name, &bytes)).await??,
            FileKind::Csv => tokio::task::spawn_blocking(move || spreadsheet::extract_csv(&name, &bytes)).await??,
            FileKind::Spreadsheet => {
                tokio::task::spawn_blocking(move || spreadsheet::extract_workbook(&name, &bytes)).await??
            }
            FileKind::Text => text::extract(&bytes),
            FileKind::Image => {
                let mime = image::mime_type(filename, content_type);
                image::describe(self.vision.as_ref(), &bytes, &mime).await?
            }
        };

        if document.is_empty() {
            return Err(IngestionError::NoText {
                filename: filename.to_string(),
            });
        }

        debug!(kind = %document.kind, pages = document.pages.len(), "Extraction complete");
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use researchdesk_common::llm::LocalChat;

    #[test]
    fn test_detect_kind() {
        assert_eq!(detect_kind("Paper.PDF", None).unwrap(), FileKind::Pdf);
        assert_eq!(detect_kind("notes.md", None).unwrap(), FileKind::Text);
        assert_eq!(detect_kind("book.xls", None).unwrap(), FileKind::Spreadsheet);
        assert_eq!(detect_kind("photo.JPEG", None).unwrap(), FileKind::Image);
        assert_eq!(detect_kind("upload", Some("application/pdf")).unwrap(), FileKind::Pdf);
        assert_eq!(
            detect_kind("data.bin", Some("text/csv; charset=utf-8")).unwrap(),
            FileKind::Csv
        );
        assert!(matches!(
            detect_kind("setup.exe", Some("application/octet-stream")),
            Err(IngestionError::UnsupportedFileType { extension }) if extension == "exe"
        ));
        assert!(!is_supported("archive.tar.gz"));
    }

    #[test]
    fn test_empty_pages_are_dropped() {
        let doc = ExtractedDocument::new(
            FileKind::Text,
            vec![Page::new(1, "first"), Page::new(2, "  \n"), Page::new(3, "third")],
        );
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.full_text(), "first\n\nthird");
        assert_eq!(doc.content_hash, content_hash("first\n\nthird"));
    }

    #[tokio::test]
    async fn test_extract_text_and_reject_blank() {
        let extractor = Extractor::new(Arc::new(LocalChat::new()));
        let doc = extractor
            .extract("a.txt", b"page one\x0cpage two".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.kind, FileKind::Text);

        let err = extractor.extract("blank.txt", b"   ".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, IngestionError::NoText { .. }));
    }

    #[tokio::test]
    async fn test_image_is_described() {
        let extractor = Extractor::new(Arc::new(LocalChat::new()));
        let doc = extractor
            .extract("figure.png", vec![0x89, b'P', b'N', b'G'], None)
            .await
            .unwrap();
        assert_eq!(doc.kind, FileKind::Image);
        assert!(doc.pages[0].text.contains("image/png"));
        assert!(doc.model_usage.total() > 0);
    }
}
