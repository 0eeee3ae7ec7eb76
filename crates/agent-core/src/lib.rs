//! # agent-core
//!
//! Agent orchestration runtime: a tool registry spanning many MCP servers, a
//! dispatcher that routes calls to the owning server, and two conversation
//! loops over a provider-agnostic LLM abstraction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │   ReasoningEngine (plan → step* → conclude)      Agent (simple)  │
//! │        │            │                               │            │
//! │        │     ExecutionContext                       │            │
//! │        ▼                                            ▼            │
//! │   LlmProvider (strategy)        ToolDispatcher ──▶ ToolRegistry  │
//! │                                                     │            │
//! │                            SessionManager ──▶ ServerSession*     │
//! │                                                (ProviderSession) │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transports, configuration and concrete providers live in
//! `agent-runtime`; this crate only sees the [`ProviderSession`] and
//! [`LlmProvider`] traits.

pub mod agent;
pub mod context;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod prompts;
pub mod provider;
pub mod reasoning;
pub mod registry;
pub mod reply;
pub mod session;
pub mod tool;
pub mod trace;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentReply};
pub use context::{ExecutionContext, Observation};
pub use conversation::{ConversationId, ConversationState};
pub use dispatcher::{DispatchMode, ToolDispatcher, ToolInvocation};
pub use error::{AgentError, Result};
pub use message::{Conversation, Message, Role};
pub use provider::{Completion, GenerationOptions, LlmProvider};
pub use reasoning::{Conclusion, ReasoningConfig, ReasoningEngine, ReasoningOutcome, ReasoningPhase};
pub use registry::{CollisionPolicy, ToolRegistry};
pub use session::{ProviderSession, ServerId, ServerSession, SessionManager, SessionState};
pub use tool::{ToolCall, ToolDescriptor, ToolError, ToolErrorKind, ToolResult, ToolSpec};
pub use trace::{TraceEvent, Tracer};
