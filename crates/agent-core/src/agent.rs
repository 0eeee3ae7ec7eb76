//! Simple Loop
//!
//! The non-reasoning conversation loop: ask the model, run whatever tools it
//! requests, feed the results back, repeat until it answers in plain text.
//! No planning, no code execution, no persistent context.
//!
//! Cancellation is checked before each model call; tool calls already
//! dispatched always run to completion.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchMode, ToolDispatcher};
use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::registry::{CollisionPolicy, ToolRegistry};
use crate::reply;
use crate::tool::ToolSpec;

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub system_prompt: String,

    /// Model calls before the loop gives up and returns the last reply
    pub max_iterations: usize,

    pub generation: GenerationOptions,

    /// Append the text tool catalog to the system prompt for providers
    /// without native tool calling
    pub inject_tool_descriptions: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            generation: GenerationOptions::default(),
            inject_tool_descriptions: true,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to tools. \
Use them when they help answer the question, then answer concisely and accurately.";

/// Final reply of a simple-loop run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentReply {
    pub content: String,
    /// Model calls made
    pub iterations: usize,
    /// The iteration ceiling was hit while the model still wanted tools
    pub exhausted: bool,
}

pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    dispatcher: ToolDispatcher,
    config: AgentConfig,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(provider: Arc<dyn LlmProvider>, dispatcher: ToolDispatcher, config: AgentConfig) -> Self {
        Self {
            provider,
            dispatcher,
            config,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// System prompt, plus the tool catalog when the provider needs it in text
    pub fn system_prompt(&self) -> String {
        let mut prompt = self.config.system_prompt.clone();
        let registry = self.dispatcher.registry();
        if self.config.inject_tool_descriptions
            && !self.provider.supports_native_tools()
            && !registry.is_empty()
        {
            prompt.push_str("\n\n");
            prompt.push_str(&registry.prompt_section());
        }
        prompt
    }

    /// Run the loop over `conversation`, appending every turn to it
    pub async fn run(&self, conversation: &mut Conversation) -> Result<AgentReply> {
        conversation.ensure_system_prompt(self.system_prompt());

        let tools: Vec<ToolSpec> = if self.provider.supports_native_tools() {
            self.dispatcher.registry().tool_specs()
        } else {
            Vec::new()
        };

        let mut last = String::new();
        for iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let completion = self
                .provider
                .complete(conversation.messages(), &tools, &self.config.generation)
                .await?;

            let mut calls = completion.tool_calls;
            calls.extend(reply::parse_tool_calls(&completion.content));

            if calls.is_empty() {
                conversation.push(Message::assistant(&completion.content));
                return Ok(AgentReply {
                    content: completion.content,
                    iterations: iteration,
                    exhausted: false,
                });
            }

            for call in &mut calls {
                call.ensure_id();
            }
            conversation.push(Message::assistant_with_tool_calls(
                &completion.content,
                calls.clone(),
            ));
            for invocation in self.dispatcher.invoke_all(&calls).await {
                tracing::debug!(
                    tool = %invocation.call.name,
                    success = invocation.is_success(),
                    "Tool call finished"
                );
                conversation.push(invocation.to_message());
            }
            last = completion.content;
        }

        tracing::warn!(
            max_iterations = self.config.max_iterations,
            "Iteration ceiling reached; returning last reply"
        );
        Ok(AgentReply {
            content: last,
            iterations: self.config.max_iterations,
            exhausted: true,
        })
    }

    /// Run with a single question in a temporary conversation
    pub async fn ask(&self, question: &str) -> Result<AgentReply> {
        let mut conversation = Conversation::with_system_prompt(self.system_prompt());
        conversation.push(Message::user(question));
        self.run(&mut conversation).await
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.dispatcher.registry()
    }

    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for [`Agent`]
#[derive(Default)]
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    registry: Option<Arc<ToolRegistry>>,
    dispatch: DispatchMode,
    config: AgentConfig,
    cancel: Option<CancellationToken>,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub const fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn generation(mut self, options: GenerationOptions) -> Self {
        self.config.generation = options;
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ToolRegistry::new(CollisionPolicy::default())));
        let dispatcher = ToolDispatcher::new(registry).with_mode(self.dispatch);
        let agent = Agent::new(provider, dispatcher, self.config);
        Ok(match self.cancel {
            Some(token) => agent.with_cancellation(token),
            None => agent,
        })
    }
}
