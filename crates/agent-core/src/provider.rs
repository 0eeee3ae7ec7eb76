//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM providers (Ollama, OpenAI-compatible
//! endpoints, etc.) so the reasoning engine and the simple loop work with any
//! backend without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{GenerationOptions, LlmProvider};
//!
//! let completion = provider
//!     .complete(conversation.messages(), &registry.tool_specs(), &options)
//!     .await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::tool::{ToolCall, ToolSpec};

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "llama3.2", "gpt-4o")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

const fn default_temperature() -> f32 {
    0.7
}
const fn default_max_tokens() -> u32 {
    2048
}
const fn default_top_p() -> f32 {
    0.9
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationOptions {
    /// Same options, different model
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }
}

/// Response from an LLM completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Completion {
    /// The generated text
    pub content: String,

    /// Model that generated this response
    pub model: String,

    /// Structured tool calls (providers with native function calling)
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Separate reasoning text, for models that expose it
    #[serde(default)]
    pub reasoning: Option<String>,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,

    /// Whether the response was truncated
    pub truncated: bool,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,
}

impl Completion {
    /// Plain text completion
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            finish_reason: Some(FinishReason::Stop),
            ..Self::default()
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self.finish_reason = Some(FinishReason::ToolUse);
        self
    }
}

/// Token usage statistics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Error,
}

/// Provider metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name (e.g., "Ollama", "OpenAI")
    pub name: String,

    /// Provider version
    pub version: Option<String>,

    /// Available models
    pub models: Vec<ModelInfo>,

    /// Whether tool/function calling is supported
    pub supports_tools: bool,
}

/// Information about a model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: Option<u32>,
    pub supports_vision: bool,
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get provider information and capabilities
    async fn info(&self) -> Result<ProviderInfo>;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Generate a completion from messages
    ///
    /// `tools` is empty when the caller wants a plain text answer.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &GenerationOptions,
    ) -> Result<Completion>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;

    /// Whether `tools` passed to `complete` reach the model natively
    ///
    /// When false, callers describe the tools in the system prompt and the
    /// model requests them with fenced `tool` blocks.
    fn supports_native_tools(&self) -> bool {
        false
    }

    /// Estimate token count for text (provider-specific tokenization)
    fn estimate_tokens(&self, text: &str) -> u32 {
        // Default: rough estimate of ~4 chars per token
        u32::try_from(text.len() / 4).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert!((opts.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(opts.max_tokens, 2048);
        assert_eq!(opts.model, "llama3.2");
    }

    #[test]
    fn test_with_model_keeps_sampling() {
        let opts = GenerationOptions {
            temperature: 0.1,
            ..GenerationOptions::default()
        };
        let planning = opts.with_model("planner-xl");
        assert_eq!(planning.model, "planner-xl");
        assert!((planning.temperature - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_completion_with_tool_calls() {
        let completion = Completion::text("", "m")
            .with_tool_calls(vec![ToolCall::new("list_tables", serde_json::json!({}))]);
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(completion.tool_calls.len(), 1);
    }
}
