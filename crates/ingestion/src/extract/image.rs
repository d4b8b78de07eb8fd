//! Images are described by the vision model; the description is the page text

use super::{ExtractedDocument, Page};
use crate::errors::IngestionError;
use researchdesk_common::llm::{ChatModel, IMAGE_DESCRIPTION_PROMPT};
use researchdesk_search::model::FileKind;
use tracing::debug;

/// MIME type from the declared content type, else guessed from the filename
pub fn mime_type(filename: &str, content_type: Option<&str>) -> String {
    match content_type {
        Some(ct) if ct.starts_with("image/") => ct.to_string(),
        _ => mime_guess::from_path(filename)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

pub async fn describe(model: &dyn ChatModel, bytes: &[u8], mime: &str) -> Result<ExtractedDocument, IngestionError> {
    let completion = model.describe_image(bytes, mime, IMAGE_DESCRIPTION_PROMPT).await?;
    debug!(
        model = %completion.model,
        tokens = completion.usage.total(),
        "Image described"
    );

    let mut document = ExtractedDocument::new(FileKind::Image, vec![Page::new(1, completion.content)]);
    document.model_usage = completion.usage;
    Ok(document)
}
