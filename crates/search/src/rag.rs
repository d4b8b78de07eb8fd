//! Retrieval-augmented answers
//!
//! Provides:
//! - Prompt assembly from retrieved context and prior conversation turns
//! - Prompt token estimates for quota reservation ahead of the model call
//! - Citation extraction from the generated answer

use crate::context::{ContextBuilder, ContextConfig, ContextWindow};
use crate::retrieval::{RetrievalMode, SearchRequest, SearchService};
use crate::store::KnowledgeStore;
use regex_lite::Regex;
use researchdesk_common::config::{LlmConfig, SearchConfig};
use researchdesk_common::embeddings::Embedder;
use researchdesk_common::errors::{AppError, Result};
use researchdesk_common::llm::{ChatMessage, ChatModel, CompletionOptions, Role};
use researchdesk_common::tokens::{estimate_tokens, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Prior turns kept from the conversation history
const MAX_HISTORY_MESSAGES: usize = 10;

const EXCERPT_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "You are a research assistant. Answer the question using ONLY the numbered \
context taken from the user's documents. Include inline citations in the format [1], [2], etc. \
referring to the numbered sources. If the context doesn't contain enough information, say so. \
Do not make up information.";

const NO_CONTEXT_NOTICE: &str = "No documents matched this question. Tell the user that their uploaded \
documents do not appear to cover it.";

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub default_limit: usize,
    pub min_score: f32,
    pub context: ContextConfig,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl RagConfig {
    pub fn new(search: &SearchConfig, llm: &LlmConfig) -> Self {
        Self {
            default_limit: search.default_limit,
            min_score: search.min_score,
            context: ContextConfig::from_search_config(search),
            max_output_tokens: llm.max_output_tokens,
            temperature: llm.temperature,
        }
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            min_score: 0.2,
            context: ContextConfig::default(),
            max_output_tokens: 1000,
            temperature: 0.3,
        }
    }
}

/// Per-question options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub mode: RetrievalMode,

    /// Chunks retrieved before context assembly
    pub limit: Option<usize>,

    pub min_score: Option<f32>,

    pub document_ids: Option<Vec<Uuid>>,

    /// Earlier turns of the conversation, oldest first
    #[serde(default)]
    pub history: Vec<ChatMessage>,

    pub max_output_tokens: Option<u32>,
}

/// A numbered source handed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// 1-based number used in citations
    pub index: usize,
    pub document_id: Uuid,
    pub filename: String,
    pub pages: (u32, u32),
    pub score: f32,
    pub excerpt: String,
}

impl Source {
    fn from_window(index: usize, window: &ContextWindow) -> Self {
        Self {
            index,
            document_id: window.document_id,
            filename: window.filename.clone(),
            pages: window.pages,
            score: window.relevance_score,
            excerpt: window.content.chars().take(EXCERPT_CHARS).collect(),
        }
    }
}

/// Citation found in a generated answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub index: usize,
    pub document_id: Uuid,
    pub filename: String,
    /// Character offset of the first `[n]` marker in the answer
    pub position: usize,
}

/// Everything needed to call the model, computed before any quota is reserved
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub question: String,
    pub messages: Vec<ChatMessage>,
    pub sources: Vec<Source>,
    pub estimated_prompt_tokens: u64,
    pub completion: CompletionOptions,
}

impl PreparedQuery {
    /// Tokens to reserve: the prompt estimate plus the full output allowance
    pub fn reservation_tokens(&self) -> u64 {
        self.estimated_prompt_tokens + self.completion.max_tokens as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<Source>,
    pub usage: TokenUsage,
    pub model: String,
}

/// Answers questions from an owner's documents
pub struct RagEngine {
    search: SearchService,
    chat: Arc<dyn ChatModel>,
    context: ContextBuilder,
    config: RagConfig,
}

impl RagEngine {
    pub fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        config: RagConfig,
    ) -> Self {
        Self {
            search: SearchService::new(store, embedder),
            chat,
            context: ContextBuilder::new(config.context.clone()),
            config,
        }
    }

    pub fn model_name(&self) -> &str {
        self.chat.model_name()
    }

    /// Retrieve context and build the prompt for `question`
    #[tracing::instrument(skip(self, question, options), fields(mode = options.mode.as_str()))]
    pub async fn prepare(
        &self,
        owner_id: Uuid,
        question: &str,
        options: &QueryOptions,
    ) -> Result<PreparedQuery> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AppError::Validation {
                message: "Question must not be empty".to_string(),
                field: Some("question".to_string()),
            });
        }

        let response = self
            .search
            .search(&SearchRequest {
                owner_id,
                query: question.to_string(),
                mode: options.mode,
                limit: options.limit.unwrap_or(self.config.default_limit),
                min_score: Some(options.min_score.unwrap_or(self.config.min_score)),
                document_ids: options.document_ids.clone(),
            })
            .await?;

        let windows = self.context.build(response.chunks);
        let sources: Vec<Source> = windows
            .iter()
            .enumerate()
            .map(|(i, w)| Source::from_window(i + 1, w))
            .collect();

        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        let history_start = options.history.len().saturating_sub(MAX_HISTORY_MESSAGES);
        messages.extend(
            options.history[history_start..]
                .iter()
                .filter(|m| m.role != Role::System)
                .cloned(),
        );
        messages.push(ChatMessage::user(build_prompt(question, &windows)));

        let estimated_prompt_tokens = messages
            .iter()
            .map(|m| estimate_tokens(&m.content) as u64)
            .sum();

        tracing::debug!(
            sources = sources.len(),
            estimated_prompt_tokens,
            "Prepared query"
        );

        Ok(PreparedQuery {
            question: question.to_string(),
            messages,
            sources,
            estimated_prompt_tokens,
            completion: CompletionOptions {
                max_tokens: options
                    .max_output_tokens
                    .unwrap_or(self.config.max_output_tokens)
                    .min(self.config.max_output_tokens),
                temperature: self.config.temperature,
            },
        })
    }

    /// Call the chat model and attach citations
    pub async fn answer(&self, prepared: PreparedQuery) -> Result<RagAnswer> {
        let completion = self
            .chat
            .complete(&prepared.messages, &prepared.completion)
            .await?;

        let citations = extract_citations(&completion.content, &prepared.sources);

        Ok(RagAnswer {
            answer: completion.content,
            citations,
            sources: prepared.sources,
            usage: completion.usage,
            model: completion.model,
        })
    }
}

fn build_prompt(question: &str, windows: &[ContextWindow]) -> String {
    if windows.is_empty() {
        return format!("Question: {}\n\n{}\n\nAnswer:", question, NO_CONTEXT_NOTICE);
    }

    format!(
        "Question: {}\n\nContext:\n{}\nAnswer:",
        question,
        ContextBuilder::render(windows)
    )
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("citation pattern is valid"))
}

/// Citations `[n]` that refer to a provided source, in source order
pub fn extract_citations(answer: &str, sources: &[Source]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();

    for cap in citation_pattern().captures_iter(answer) {
        let (Some(marker), Some(number)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let Ok(index) = number.as_str().parse::<usize>() else {
            continue;
        };
        if index == 0 || index > sources.len() || citations.iter().any(|c| c.index == index) {
            continue;
        }

        let source = &sources[index - 1];
        citations.push(Citation {
            index,
            document_id: source.document_id,
            filename: source.filename.clone(),
            position: answer[..marker.start()].chars().count(),
        });
    }

    citations.sort_by_key(|c| c.index);
    citations
}
