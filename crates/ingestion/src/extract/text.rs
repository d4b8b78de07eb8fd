//! Plain text, markdown and JSON

use super::{ExtractedDocument, Page};
use researchdesk_search::model::FileKind;

const FORM_FEED: char = '\u{000C}';

/// UTF-8 (lossy) text; form feeds separate pages
pub fn extract(bytes: &[u8]) -> ExtractedDocument {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_start_matches('\u{FEFF}').replace("\r\n", "\n");

    let pages = text
        .split(FORM_FEED)
        .enumerate()
        .map(|(i, page)| Page::new(i as u32 + 1, page.trim()))
        .collect();

    ExtractedDocument::new(FileKind::Text, pages)
}
