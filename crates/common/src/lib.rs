//! ResearchDesk Common Library
//!
//! Shared code for the ResearchDesk crates including:
//! - Configuration management
//! - Error types and handling
//! - Authentication utilities
//! - Embedding and chat model clients
//! - Token estimation and quota accounting
//! - Metrics and tracing setup

pub mod auth;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod quota;
pub mod telemetry;
pub mod tokens;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::ChatModel;
pub use quota::{Plan, QuotaTracker};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
