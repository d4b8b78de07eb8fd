//! Chat and vision model clients
//!
//! Provides:
//! - `ChatModel` trait used for answer generation and image description
//! - OpenAI chat completions client with token usage reporting
//! - Deterministic local model for offline operation and tests

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::tokens::{estimate_tokens, TokenUsage};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Generation options
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.3,
        }
    }
}

/// Model output with token accounting
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Trait for chat-capable language models
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Generate a reply to the conversation
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion>;

    /// Describe an image so its content can be indexed as text
    async fn describe_image(&self, image: &[u8], mime: &str, prompt: &str) -> Result<Completion>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Prompt used to turn uploaded images into searchable text
pub const IMAGE_DESCRIPTION_PROMPT: &str =
    "Describe this image in detail for a research knowledge base. Transcribe any visible \
     text verbatim, then summarise charts, tables, diagrams and their key values.";

/// OpenAI chat completions client
pub struct OpenAIChat {
    client: reqwest::Client,
    api_key: String,
    model: String,
    vision_model: String,
    base_url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl OpenAIChat {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }

    async fn send(&self, model: &str, body: serde_json::Value, prompt_estimate: u64) -> Result<Completion> {
        let start = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);

        let outcome = async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::LlmError {
                    message: format!("Request failed: {}", e),
                })?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::LlmError {
                    message: format!("API error {}: {}", status, body),
                });
            }

            response.json::<ChatResponse>().await.map_err(|e| AppError::LlmError {
                message: format!("Failed to parse response: {}", e),
            })
        }
        .await;

        let parsed = match outcome {
            Ok(parsed) => parsed,
            Err(e) => {
                crate::metrics::record_llm(start.elapsed().as_secs_f64(), model, None);
                return Err(e);
            }
        };

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from model".to_string(),
            })?;

        let usage = match parsed.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(prompt_estimate, estimate_tokens(&content) as u64),
        };

        crate::metrics::record_llm(start.elapsed().as_secs_f64(), model, Some(&usage));

        Ok(Completion {
            content,
            usage,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let prompt_estimate: u64 = messages
            .iter()
            .map(|m| estimate_tokens(&m.content) as u64)
            .sum();

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        self.send(&self.model, body, prompt_estimate).await
    }

    async fn describe_image(&self, image: &[u8], mime: &str, prompt: &str) -> Result<Completion> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);

        let body = serde_json::json!({
            "model": self.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:{};base64,{}", mime, encoded) } }
                ]
            }],
            "max_tokens": 1500,
        });

        self.send(&self.vision_model, body, estimate_tokens(prompt) as u64).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Offline model that answers by quoting the first numbered context block.
///
/// Output is deterministic, which keeps the retrieval pipeline testable
/// without network access.
pub struct LocalChat {
    model: String,
}

impl LocalChat {
    pub fn new() -> Self {
        Self {
            model: "local-extractive".to_string(),
        }
    }

    fn first_source_sentence(prompt: &str) -> Option<String> {
        let mut lines = prompt.lines();
        lines.find(|l| l.trim_start().starts_with("[1]"))?;
        let body = lines.find(|l| !l.trim().is_empty())?.trim();

        let sentence_end = body
            .find(['.', '!', '?'])
            .map(|i| i + 1)
            .unwrap_or(body.len());
        let sentence: String = body[..sentence_end].chars().take(240).collect();
        Some(sentence)
    }
}

impl Default for LocalChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatModel for LocalChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let mut content = match Self::first_source_sentence(prompt) {
            Some(sentence) => format!("According to your documents [1]: {}", sentence),
            None => "I could not find relevant information in your documents.".to_string(),
        };

        let max_chars = options.max_tokens as usize * crate::tokens::CHARS_PER_TOKEN;
        if content.chars().count() > max_chars {
            content = content.chars().take(max_chars).collect();
        }

        let prompt_tokens: u64 = messages
            .iter()
            .map(|m| estimate_tokens(&m.content) as u64)
            .sum();

        Ok(Completion {
            usage: TokenUsage::new(prompt_tokens, estimate_tokens(&content) as u64),
            content,
            model: self.model.clone(),
        })
    }

    async fn describe_image(&self, image: &[u8], mime: &str, prompt: &str) -> Result<Completion> {
        let content = format!("Image ({}, {} bytes); no description available offline.", mime, image.len());
        Ok(Completion {
            usage: TokenUsage::new(estimate_tokens(prompt) as u64, estimate_tokens(&content) as u64),
            content,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Create a chat model based on configuration
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "llm.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIChat::new(key, config)?))
        }
        "local" => Ok(Arc::new(LocalChat::new())),
        other => Err(AppError::Configuration {
            message: format!("Unknown llm provider: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_chat_quotes_first_source() {
        let model = LocalChat::new();
        let prompt = "Question: what is measured?\n\nContext:\n[1] results.pdf (page 2)\nThe study measured soil nitrogen. It also noted rainfall.\n";
        let completion = model
            .complete(
                &[ChatMessage::system("be precise"), ChatMessage::user(prompt)],
                &CompletionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(
            completion.content,
            "According to your documents [1]: The study measured soil nitrogen."
        );
        assert!(completion.usage.prompt_tokens > 0);
        assert!(completion.usage.completion_tokens > 0);
    }

    #[tokio::test]
    async fn test_local_chat_without_context() {
        let model = LocalChat::new();
        let completion = model
            .complete(&[ChatMessage::user("hello")], &CompletionOptions::default())
            .await
            .unwrap();
        assert!(completion.content.contains("could not find"));
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_create_chat_model() {
        assert!(create_chat_model(&LlmConfig::default()).is_err());
        let local = LlmConfig {
            provider: "local".to_string(),
            ..LlmConfig::default()
        };
        assert_eq!(create_chat_model(&local).unwrap().model_name(), "local-extractive");
    }
}
