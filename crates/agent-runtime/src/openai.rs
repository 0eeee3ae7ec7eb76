//! OpenAI-compatible chat completions provider
//!
//! Talks to `{base}/chat/completions` with native function calling. The same
//! client serves LM Studio, Azure OpenAI deployments and any other server
//! exposing that API.

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
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Chat-completions client
pub struct OpenAiProvider {
    name: String,
    api_key: Option<String>,
    base_url: String,
    azure: Option<AzureDeployment>,
    client: Client,
}

/// Azure routes by deployment and versions every request
#[derive(Clone, Debug)]
struct AzureDeployment {
    deployment: String,
    api_version: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: "OpenAI".into(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            azure: None,
            client: Client::new(),
        }
    }

    /// Azure OpenAI deployment under `endpoint`, authenticated with an `api-key` header
    pub fn azure(
        api_key: Option<String>,
        endpoint: impl Into<String>,
        deployment: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            azure: Some(AzureDeployment {
                deployment: deployment.into(),
                api_version: api_version.into(),
            }),
            ..Self::new(api_key, endpoint)
        }
        .with_name("Azure OpenAI")
    }

    /// `OPENAI_API_KEY` and `OPENAI_BASE_URL`
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into()),
        )
    }

    /// Display name reported by `info`
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        match &self.azure {
            Some(azure) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url, azure.deployment, azure.api_version
            ),
            None => format!("{}/chat/completions", self.base_url),
        }
    }

    fn models_url(&self) -> String {
        match &self.azure {
            Some(azure) => format!("{}/openai/models?api-version={}", self.base_url, azure.api_version),
            None => format!("{}/models", self.base_url),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match (&self.api_key, &self.azure) {
            (Some(key), Some(_)) => builder.header("api-key", key),
            (Some(key), None) => builder.bearer_auth(key),
            (None, _) => builder,
        }
    }

    fn build_request(messages: &[Message], tools: &[ToolSpec], options: &GenerationOptions) -> ApiRequest {
        let tools = (!tools.is_empty()).then(|| {
            tools
                .iter()
                .map(|t| ApiTool {
                    tool_type: "function".into(),
                    function: ApiFunction {
                        name: t.name.clone(),
                        description: (!t.description.is_empty()).then(|| t.description.clone()),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect()
        });
        ApiRequest {
            model: options.model.clone(),
            messages: messages.iter().map(Self::convert_message).collect(),
            temperature: Some(options.temperature),
            top_p: Some(options.top_p),
            max_tokens: Some(options.max_tokens),
            stop: (!options.stop_sequences.is_empty()).then(|| options.stop_sequences.clone()),
            tools,
        }
    }

    fn convert_message(message: &Message) -> ApiMessage {
        let metadata = message.metadata.as_ref();
        let plain = |role: &str, content: String| ApiMessage {
            role: role.into(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        };
        match message.role {
            Role::System => plain("system", message.content.clone()),
            Role::User | Role::Observation => plain("user", message.content.clone()),
            Role::Assistant => {
                let calls: Vec<ApiToolCall> = metadata
                    .map(|m| m.tool_calls.iter().map(ApiToolCall::from_call).collect())
                    .unwrap_or_default();
                ApiMessage {
                    role: "assistant".into(),
                    content: (!message.content.is_empty() || calls.is_empty())
                        .then(|| message.content.clone()),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                }
            }
            Role::Tool => match metadata.and_then(|m| m.tool_call_id.clone()) {
                Some(id) => ApiMessage {
                    tool_call_id: Some(id),
                    ..plain("tool", message.content.clone())
                },
                // A tool role without an id is rejected by the API
                None => plain("user", format!("Tool result:\n{}", message.content)),
            },
        }
    }

    fn convert_response(response: ApiResponse, model: &str) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("No response choices".into()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let arguments = if tc.function.arguments.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                        warn!(tool = %tc.function.name, error = %e, "Tool call arguments are not JSON");
                        Value::Null
                    })
                };
                let call = ToolCall::new(tc.function.name, arguments);
                if tc.id.is_empty() { call } else { call.with_id(tc.id) }
            })
            .collect();

        let finish_reason = choice.finish_reason.as_deref().map(|reason| match reason {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolUse,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        });

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| model.to_string()),
            tool_calls,
            reasoning: choice.message.reasoning_content.filter(|r| !r.trim().is_empty()),
            usage: response.usage.map(ApiUsage::into_usage),
            truncated: finish_reason == Some(FinishReason::Length),
            finish_reason,
        })
    }

    async fn post(&self, request: &ApiRequest) -> Result<reqwest::Response> {
        let builder = self.authorize(self.client.post(self.chat_url()).json(request));
        debug!(model = %request.model, messages = request.messages.len(), "Sending chat completion");
        let response = builder
            .send()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(format!("{}: {e}", self.name)))?;
        check_status(response).await
    }
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("API error {status}: {body}");
    Err(match status {
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(message),
        s if s.is_server_error() => AgentError::ProviderUnavailable(message),
        _ => AgentError::Provider(message),
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: self.name.clone(),
            version: None,
            models: self.list_models().await.unwrap_or_default(),
            supports_tools: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(provider = %self.name, error = %e, "Health check failed");
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
        let response: ApiResponse = self
            .post(&request)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to parse response: {e}")))?;
        Self::convert_response(response, &options.model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .authorize(self.client.get(self.models_url()))
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
                name: m.id.clone(),
                id: m.id,
                context_length: None,
                supports_vision: false,
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
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ApiFunctionCall,
}

fn function_type() -> String {
    "function".into()
}

impl ApiToolCall {
    fn from_call(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone().unwrap_or_default(),
            call_type: function_type(),
            function: ApiFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
    /// Separate reasoning text some servers return alongside the answer
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl ApiUsage {
    fn into_usage(self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self
                .total_tokens
                .unwrap_or_else(|| self.prompt_tokens.saturating_add(self.completion_tokens)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiModelList {
    data: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
}
