//! # agent-runtime
//!
//! The concrete collaborators behind `agent-core`'s traits.
//!
//! - **config**: the JSON file naming models and MCP servers
//! - **mcp**: stdio, streamable-HTTP and legacy SSE MCP clients ([`agent_core::ProviderSession`])
//! - **auth**: per-request headers for remote servers
//! - **openai** / **anthropic** / **ollama**: [`agent_core::LlmProvider`] implementations
//! - **factory**: wiring config entries to the above
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{AppConfig, factory};
//!
//! let config = AppConfig::load("mcp_config.json")?;
//! let sessions = factory::session_manager(&config.servers()?);
//! sessions.connect_all().await;
//! let provider = factory::build_provider(config.choose_model(None)?)?;
//! ```

pub mod anthropic;
pub mod auth;
pub mod config;
pub mod factory;
pub mod mcp;
pub mod openai;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use anthropic::AnthropicProvider;
pub use auth::{BearerTokenAuth, HeaderProvider};
pub use config::{AppConfig, ConfigError, ModelConfig, ServerConfig, ServerSpec, TransportSpec};
pub use mcp::{HttpSession, SseSession, StdioSession};
pub use openai::OpenAiProvider;

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
