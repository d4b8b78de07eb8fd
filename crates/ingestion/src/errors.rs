//! Ingestion error types

use researchdesk_common::errors::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Unsupported file type: {extension}")]
    UnsupportedFileType { extension: String },

    #[error("Failed to extract {filename}: {message}")]
    Extraction { filename: String, message: String },

    #[error("No text content extracted from {filename}")]
    NoText { filename: String },

    #[error("Uploaded file {filename} is empty")]
    EmptyUpload { filename: String },

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    App(#[from] AppError),
}

impl IngestionError {
    pub(crate) fn extraction(filename: &str, message: impl std::fmt::Display) -> Self {
        IngestionError::Extraction {
            filename: filename.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::UnsupportedFileType { extension } => AppError::UnsupportedFileType { extension },
            IngestionError::Extraction { filename, message } => AppError::ExtractionFailed { filename, message },
            IngestionError::NoText { filename } => AppError::ExtractionFailed {
                filename,
                message: "no text content could be extracted".to_string(),
            },
            IngestionError::EmptyUpload { filename } => AppError::Validation {
                message: format!("Uploaded file {} is empty", filename),
                field: Some("file".to_string()),
            },
            IngestionError::Join(e) => AppError::from(e),
            IngestionError::Io(e) => AppError::from(e),
            IngestionError::App(e) => e,
        }
    }
}
