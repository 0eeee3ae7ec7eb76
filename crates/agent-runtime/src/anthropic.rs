//! Anthropic Messages API provider
//!
//! `POST {base}/v1/messages` with native tool use. The system prompt travels
//! outside the message list, tool calls are `tool_use` blocks on assistant
//! turns and their results are `tool_result` blocks on the following user turn.

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo,
        TokenUsage,
    },
    tool::{ToolCall, ToolSpec},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::openai::check_status;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Value of the `anthropic-version` header
const API_VERSION: &str = "2023-06-01";

/// Messages API client
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn build_request(messages: &[Message], tools: &[ToolSpec], options: &GenerationOptions) -> ApiRequest {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        ApiRequest {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: Self::convert_messages(messages),
            temperature: Some(options.temperature),
            top_p: Some(options.top_p),
            stop_sequences: (!options.stop_sequences.is_empty()).then(|| options.stop_sequences.clone()),
            tools: (!tools.is_empty()).then(|| {
                tools
                    .iter()
                    .map(|t| ApiTool {
                        name: t.name.clone(),
                        description: (!t.description.is_empty()).then(|| t.description.clone()),
                        input_schema: t.parameters.clone(),
                    })
                    .collect()
            }),
        }
    }

    /// Non-system messages as alternating turns
    ///
    /// Consecutive messages with the same role are merged into one turn, so
    /// several tool results answer their assistant turn together.
    fn convert_messages(messages: &[Message]) -> Vec<ApiMessage> {
        let mut turns: Vec<ApiMessage> = Vec::new();
        for message in messages {
            let (role, parts) = match message.role {
                Role::System => continue,
                Role::User | Role::Observation => ("user", text_part(&message.content)),
                Role::Assistant => {
                    let mut parts = text_part(&message.content);
                    let calls = message.metadata.iter().flat_map(|m| m.tool_calls.iter());
                    parts.extend(calls.filter_map(|call| {
                        call.id.as_ref().map(|id| ApiPart::ToolUse {
                            id: id.clone(),
                            name: call.name.clone(),
                            input: tool_input(&call.arguments),
                        })
                    }));
                    ("assistant", parts)
                }
                Role::Tool => match message.metadata.as_ref().and_then(|m| m.tool_call_id.clone()) {
                    Some(id) => (
                        "user",
                        vec![ApiPart::ToolResult {
                            tool_use_id: id,
                            content: message.content.clone(),
                        }],
                    ),
                    None => ("user", text_part(&format!("Tool result:\n{}", message.content))),
                },
            };
            if parts.is_empty() {
                continue;
            }
            match turns.last_mut() {
                Some(last) if last.role == role => last.content.extend(parts),
                _ => turns.push(ApiMessage {
                    role: role.into(),
                    content: parts,
                }),
            }
        }
        turns
    }

    fn convert_response(response: ApiResponse) -> Completion {
        let mut content = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ApiBlock::Text { text } => content.push_str(&text),
                ApiBlock::Thinking { thinking } => reasoning.push_str(&thinking),
                ApiBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::new(name, input).with_id(id));
                }
                ApiBlock::Other => {}
            }
        }

        let finish_reason = response.stop_reason.as_deref().map(|reason| match reason {
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolUse,
            "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        });

        Completion {
            content,
            model: response.model,
            tool_calls,
            reasoning: (!reasoning.trim().is_empty()).then_some(reasoning),
            usage: response.usage.map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens.saturating_add(u.output_tokens),
            }),
            truncated: finish_reason == Some(FinishReason::Length),
            finish_reason,
        }
    }
}

fn text_part(text: &str) -> Vec<ApiPart> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![ApiPart::Text { text: text.to_string() }]
    }
}

/// `tool_use.input` must be an object
fn tool_input(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::Null => json!({}),
        other => json!({ "value": other }),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Anthropic".into(),
            version: Some(API_VERSION.into()),
            models: self.list_models().await.unwrap_or_default(),
            supports_tools: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Anthropic health check failed");
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let request = Self::build_request(messages, tools, options);
        debug!(model = %request.model, messages = request.messages.len(), "Sending messages request");
        let response = self
            .authorize(self.client.post(format!("{}/v1/messages", self.base_url)))
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(format!("Anthropic: {e}")))?;
        let response: ApiResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to parse response: {e}")))?;
        Ok(Self::convert_response(response))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .authorize(self.client.get(format!("{}/v1/models", self.base_url)))
            .send()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;
        let list: ApiModelList = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to parse model list: {e}")))?;
        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                context_length: None,
                supports_vision: true,
            })
            .collect())
    }

    fn supports_native_tools(&self) -> bool {
        true
    }
}

// API types

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiPart {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ApiBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiModelList {
    data: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_splits_system_and_merges_tool_results() {
        let first = ToolCall::new("list_tables", Value::Null).with_id("toolu_1");
        let second = ToolCall::new("query", json!({"sql": "select 1"})).with_id("toolu_2");
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("What tables exist?"),
            Message::assistant_with_tool_calls("Checking.", vec![first, second]),
            Message::tool("users, orders", Some("toolu_1".into())),
            Message::tool("1", Some("toolu_2".into())),
            Message::observation("```output\n2\n```"),
        ];
        let tools = vec![ToolSpec {
            name: "query".into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }];
        let request = AnthropicProvider::build_request(&messages, &tools, &GenerationOptions::default());
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["system"], "You are helpful.");
        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["role"], "assistant");
        assert_eq!(turns[1]["content"][0], json!({"type": "text", "text": "Checking."}));
        assert_eq!(turns[1]["content"][1]["type"], "tool_use");
        assert_eq!(turns[1]["content"][1]["input"], json!({}));
        assert_eq!(turns[2]["role"], "user");
        let results: Vec<&str> = turns[2]["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["type"].as_str().unwrap())
            .collect();
        assert_eq!(results, vec!["tool_result", "tool_result", "text"]);
        assert_eq!(turns[2]["content"][1]["tool_use_id"], "toolu_2");
        assert_eq!(body["tools"][0]["input_schema"], json!({"type": "object"}));
        assert!(body["tools"][0].get("description").is_none());
        assert_eq!(body["max_tokens"], 2048);
    }

    #[test]
    fn test_response_blocks() {
        let response: ApiResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "Need the tables.", "signature": "x"},
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_9", "name": "list_tables", "input": {}},
                {"type": "server_tool_use", "id": "srv", "name": "web", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        }))
        .unwrap();
        let completion = AnthropicProvider::convert_response(response);
        assert_eq!(completion.content, "Let me look.");
        assert_eq!(completion.reasoning.as_deref(), Some("Need the tables."));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].id.as_deref(), Some("toolu_9"));
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(completion.usage.unwrap().total_tokens, 19);
    }

    #[test]
    fn test_max_tokens_marks_truncated() {
        let response: ApiResponse = serde_json::from_value(json!({
            "model": "m",
            "content": [{"type": "text", "text": "partial"}],
            "stop_reason": "max_tokens"
        }))
        .unwrap();
        assert!(AnthropicProvider::convert_response(response).truncated);
    }

    #[test]
    fn test_headers() {
        let provider = AnthropicProvider::new("sk-ant", "https://api.anthropic.com/");
        let request = provider
            .authorize(provider.client.post(format!("{}/v1/messages", provider.base_url)))
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(request.headers()["x-api-key"], "sk-ant");
        assert_eq!(request.headers()["anthropic-version"], API_VERSION);
    }
}
