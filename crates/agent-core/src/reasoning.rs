//! Reasoning Engine
//!
//! Multi-step reasoning with an optional planning pass, tool calls and code
//! execution against the conversation's persistent context.
//!
//! ```text
//! Planning ──▶ Stepping ──(final answer marker)──▶ Concluded
//!                 │
//!                 └──(max_iterations, no marker)──▶ forced conclusion ──▶ Aborted
//! ```
//!
//! Each iteration is one awaited model call, then the requested tool calls
//! in request order, then any code blocks. Tool and code failures become
//! transcript content; only provider failures during stepping and
//! cancellation reach the caller as errors.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::conversation::{ConversationId, ConversationState};
use crate::dispatcher::{DispatchMode, ToolDispatcher};
use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::prompts;
use crate::provider::{GenerationOptions, LlmProvider};
use crate::registry::ToolRegistry;
use crate::reply::ParsedReply;
use crate::tool::ToolSpec;
use crate::trace::{TraceEvent, Tracer};

/// Engine configuration, fixed for the engine's lifetime
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Stepping calls before a conclusion is forced
    pub max_iterations: usize,
    pub enable_planning: bool,
    pub enable_code_execution: bool,
    /// Model used for the planning call only
    pub planning_model: Option<String>,
    pub answer_guidelines: String,
    pub dispatch: DispatchMode,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            enable_planning: true,
            enable_code_execution: true,
            planning_model: None,
            answer_guidelines: prompts::DEFAULT_GUIDELINES.into(),
            dispatch: DispatchMode::default(),
        }
    }
}

impl ReasoningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }
        if matches!(self.dispatch, DispatchMode::Concurrent { limit: 0 }) {
            return Err(AgentError::Config("concurrency limit must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningPhase {
    Planning,
    Stepping,
    Concluded,
    Aborted,
}

/// How the answer was reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// The model emitted a final-answer marker
    Confident,
    /// The iteration budget ran out and the answer was forced
    BudgetExhausted,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReasoningOutcome {
    pub conversation_id: ConversationId,
    pub answer: String,
    pub conclusion: Conclusion,
    /// Stepping calls made (the forced call is not counted)
    pub iterations: usize,
    pub plan: Option<String>,
    pub transcript: Vec<Message>,
}

impl ReasoningOutcome {
    pub const fn phase(&self) -> ReasoningPhase {
        match self.conclusion {
            Conclusion::Confident => ReasoningPhase::Concluded,
            Conclusion::BudgetExhausted => ReasoningPhase::Aborted,
        }
    }

    pub const fn is_confident(&self) -> bool {
        matches!(self.conclusion, Conclusion::Confident)
    }
}

pub struct ReasoningEngine {
    provider: Arc<dyn LlmProvider>,
    dispatcher: ToolDispatcher,
    config: ReasoningConfig,
    options: GenerationOptions,
    tracer: Tracer,
    cancel: CancellationToken,
}

impl ReasoningEngine {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: ReasoningConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            dispatcher: ToolDispatcher::new(registry).with_mode(config.dispatch),
            config,
            options: GenerationOptions::default(),
            tracer: Tracer::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Cancelling the token stops the run at the next iteration boundary
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub const fn config(&self) -> &ReasoningConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.dispatcher.registry()
    }

    /// Answer one question in a fresh conversation
    pub async fn ask(&self, question: &str) -> Result<ReasoningOutcome> {
        let mut state = ConversationState::new();
        self.run(question, &mut state).await
    }

    /// Answer `question` within `state`
    ///
    /// The transcript and counters are reset; variables bound by earlier
    /// queries in the same state stay available.
    pub async fn run(&self, question: &str, state: &mut ConversationState) -> Result<ReasoningOutcome> {
        state.begin_query();
        let guidelines = self.config.answer_guidelines.as_str();

        self.check_cancelled()?;
        let plan = if self.config.enable_planning {
            self.plan(question, guidelines).await
        } else {
            prompts::NO_PLAN.to_string()
        };
        state.set_plan(plan.clone());
        self.tracer.emit(TraceEvent::PlanReady { plan: plan.clone() });

        let native = self.provider.supports_native_tools();
        let catalog = (!native && !self.registry().is_empty()).then(|| self.registry().prompt_section());
        let tools: Vec<ToolSpec> = if native {
            self.registry().tool_specs()
        } else {
            Vec::new()
        };

        state.push(Message::system(prompts::reasoning_system(catalog.as_deref())));
        state.push(Message::user(prompts::initial_step(question, guidelines, &plan)));

        tracing::info!(
            conversation = %state.id(),
            max_iterations = self.config.max_iterations,
            tools = self.registry().len(),
            "Starting reasoning"
        );

        for iteration in 1..=self.config.max_iterations {
            self.check_cancelled()?;
            state.set_iteration(iteration);
            self.tracer.emit(TraceEvent::StepStarted {
                iteration,
                max_iterations: self.config.max_iterations,
            });

            if let Some(answer) = self.step(state, &tools).await? {
                tracing::info!(conversation = %state.id(), iteration, "Reasoning concluded");
                self.tracer.emit(TraceEvent::FinalAnswer {
                    answer: answer.clone(),
                });
                return Ok(Self::outcome(state, answer, Conclusion::Confident));
            }
        }

        self.tracer.emit(TraceEvent::BudgetExhausted {
            iterations: self.config.max_iterations,
        });
        self.check_cancelled()?;
        let answer = self.force_conclusion(state).await;
        Ok(Self::outcome(state, answer, Conclusion::BudgetExhausted))
    }

    /// One stepping iteration; returns the answer when the reply has a marker
    async fn step(&self, state: &mut ConversationState, tools: &[ToolSpec]) -> Result<Option<String>> {
        let completion = self
            .provider
            .complete(state.messages(), tools, &self.options)
            .await?;

        if let Some(reasoning) = completion.reasoning.as_deref().filter(|r| !r.is_empty()) {
            self.tracer.emit(TraceEvent::ProviderReasoning {
                text: reasoning.to_string(),
            });
        }

        let reply = ParsedReply::parse(&completion.content);
        if !reply.thought.is_empty() {
            self.tracer.emit(TraceEvent::Thought {
                text: reply.thought.clone(),
            });
        }

        if let Some(answer) = reply.final_answer {
            state.push(Message::assistant(&completion.content));
            return Ok(Some(answer));
        }

        let mut calls = completion.tool_calls;
        calls.extend(reply.tool_calls);
        for call in &mut calls {
            call.ensure_id();
        }

        if calls.is_empty() {
            state.push(Message::assistant(&completion.content));
        } else {
            state.push(Message::assistant_with_tool_calls(
                &completion.content,
                calls.clone(),
            ));
            for call in &calls {
                self.tracer.emit(TraceEvent::ToolDispatched { call: call.clone() });
            }
            for invocation in self.dispatcher.invoke_all(&calls).await {
                self.tracer.emit(TraceEvent::ToolCompleted {
                    name: invocation.call.name.clone(),
                    success: invocation.is_success(),
                    output: invocation.render(),
                });
                state.push(invocation.to_message());
            }
        }

        if self.config.enable_code_execution && !reply.code_blocks.is_empty() {
            let mut outputs = Vec::with_capacity(reply.code_blocks.len());
            for code in reply.code_blocks {
                let observation = state.context_mut().execute(&code);
                outputs.push(observation.render());
                self.tracer.emit(TraceEvent::CodeExecuted { code, observation });
            }
            state.push(Message::observation(format!(
                "```output\n{}\n```",
                outputs.join("\n")
            )));
        } else if calls.is_empty() {
            tracing::debug!(
                conversation = %state.id(),
                iteration = state.iteration(),
                "Reply had no tool call, code or final answer"
            );
        }

        Ok(None)
    }

    async fn plan(&self, question: &str, guidelines: &str) -> String {
        let names = self.registry().names();
        let messages = [
            Message::system(prompts::planning_system(&names)),
            Message::user(prompts::planning_user(question, guidelines)),
        ];
        let options = self
            .config
            .planning_model
            .as_ref()
            .map_or_else(|| self.options.clone(), |m| self.options.with_model(m));

        match self.provider.complete(&messages, &[], &options).await {
            Ok(completion) => {
                tracing::debug!(model = %options.model, "Plan generated");
                completion.content
            }
            Err(e) => {
                tracing::warn!(error = %e, "Planning failed; continuing with fallback plan");
                prompts::fallback_plan(&e)
            }
        }
    }

    /// The last model call after the budget ran out; never fails
    async fn force_conclusion(&self, state: &mut ConversationState) -> String {
        state.push(Message::user(prompts::FORCED_CONCLUSION));
        match self.provider.complete(state.messages(), &[], &self.options).await {
            Ok(completion) => {
                let answer = ParsedReply::parse(&completion.content)
                    .final_answer
                    .unwrap_or_else(|| completion.content.trim().to_string());
                state.push(Message::assistant(completion.content));
                tracing::info!(conversation = %state.id(), "Conclusion forced after budget exhausted");
                answer
            }
            Err(e) => {
                tracing::warn!(error = %e, "Forced conclusion failed");
                prompts::stopped_at(self.config.max_iterations)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn outcome(state: &ConversationState, answer: String, conclusion: Conclusion) -> ReasoningOutcome {
        ReasoningOutcome {
            conversation_id: state.id(),
            answer,
            conclusion,
            iterations: state.iteration(),
            plan: state.plan().map(str::to_string),
            transcript: state.messages().to_vec(),
        }
    }
}
