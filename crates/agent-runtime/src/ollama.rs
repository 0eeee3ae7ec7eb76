//! Ollama LLM Provider
//!
//! Local inference through `ollama-rs`. Tools are never sent natively; the
//! callers describe them in the system prompt and parse fenced calls.

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo,
        TokenUsage,
    },
    tool::ToolSpec,
};
use async_trait::async_trait;
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, ChatMessageResponse, MessageRole, request::ChatMessageRequest},
    models::ModelOptions,
};

const DEFAULT_HOST: &str = "http://localhost";
const DEFAULT_PORT: u16 = 11434;

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL (scheme and host, no port)
    pub host: String,

    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_HOST.into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Self::from_base_url(&host).map_or(Self { host, port }, |parsed| Self {
            port: if parsed.port == DEFAULT_PORT { port } else { parsed.port },
            ..parsed
        })
    }

    /// Split `http://host:port` (as given in a model's `apiBase`)
    pub fn from_base_url(url: &str) -> Option<Self> {
        let url = url.trim_end_matches('/');
        let url = url.strip_suffix("/api").unwrap_or(url);
        let (scheme, rest) = url.split_once("://")?;
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (rest, DEFAULT_PORT),
        };
        Some(Self {
            host: format!("{scheme}://{host}"),
            port,
        })
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
}

impl OllamaProvider {
    pub fn from_config(config: &OllamaConfig) -> Self {
        Self {
            client: Ollama::new(config.host.clone(), config.port),
        }
    }

    pub fn from_env() -> Self {
        Self::from_config(&OllamaConfig::from_env())
    }

    /// Convert agent messages to Ollama format
    ///
    /// Ollama has no tool role here, so tool results and code observations
    /// are replayed as user turns.
    fn convert_messages(messages: &[Message]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => ChatMessage::new(MessageRole::System, m.content.clone()),
                Role::User | Role::Observation => ChatMessage::new(MessageRole::User, m.content.clone()),
                Role::Assistant => ChatMessage::new(MessageRole::Assistant, m.content.clone()),
                Role::Tool => ChatMessage::new(MessageRole::User, format!("Tool result:\n{}", m.content)),
            })
            .collect()
    }

    fn usage(prompt: u64, completion: u64) -> TokenUsage {
        let clamp = |n: u64| u32::try_from(n).unwrap_or(u32::MAX);
        TokenUsage {
            prompt_tokens: clamp(prompt),
            completion_tokens: clamp(completion),
            total_tokens: clamp(prompt.saturating_add(completion)),
        }
    }

    fn convert_completion(response: ChatMessageResponse, model: &str) -> Completion {
        Completion {
            content: response.message.content,
            model: model.to_string(),
            usage: response
                .final_data
                .as_ref()
                .map(|d| Self::usage(d.prompt_eval_count, d.eval_count)),
            finish_reason: Some(FinishReason::Stop),
            ..Completion::default()
        }
    }

    fn build_options(opts: &GenerationOptions) -> ModelOptions {
        ModelOptions::default()
            .temperature(opts.temperature)
            .top_p(opts.top_p)
            .num_predict(i32::try_from(opts.max_tokens).unwrap_or(i32::MAX))
    }

    fn request(messages: &[Message], options: &GenerationOptions) -> ChatMessageRequest {
        ChatMessageRequest::new(options.model.clone(), Self::convert_messages(messages))
            .options(Self::build_options(options))
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        let models = self.list_models().await.unwrap_or_default();
        Ok(ProviderInfo {
            name: "Ollama".into(),
            version: None,
            models,
            supports_tools: false,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Ollama health check failed");
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let response = self
            .client
            .send_chat_messages(Self::request(messages, options))
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        Ok(Self::convert_completion(response, &options.model))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;
        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None,
                supports_vision: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
    }

    #[test]
    fn test_from_base_url() {
        let config = OllamaConfig::from_base_url("http://gpu-box:11500/").unwrap();
        assert_eq!(config.host, "http://gpu-box");
        assert_eq!(config.port, 11500);

        let config = OllamaConfig::from_base_url("https://ollama.internal/api").unwrap();
        assert_eq!(config.host, "https://ollama.internal");
        assert_eq!(config.port, 11434);

        assert!(OllamaConfig::from_base_url("localhost").is_none());
    }

    #[test]
    fn test_message_conversion_replays_tool_output_as_user() {
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("Hello"),
            Message::tool("list_tables -> []", None),
            Message::observation("```output\n4\n```"),
        ];
        let converted = OllamaProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert!(converted[2].content.starts_with("Tool result:\n"));
        assert_eq!(converted[3].content, "```output\n4\n```");
    }

    #[test]
    fn test_usage_saturates() {
        let usage = OllamaProvider::usage(u64::MAX, 1);
        assert_eq!(usage.prompt_tokens, u32::MAX);
        assert_eq!(usage.total_tokens, u32::MAX);
    }
}
