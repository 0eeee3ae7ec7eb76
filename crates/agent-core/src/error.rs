//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
///
/// Only a handful of these ever reach the caller of the reasoning engine:
/// tool-level failures are folded into the transcript by the dispatcher
/// (see [`crate::tool::ToolError`]).
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Transport-level failure talking to a tool server
    #[error("Transport error on server '{server}': {message}")]
    Transport { server: String, message: String },

    /// The server answered, but with a protocol-level error
    #[error("Server '{server}' returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    /// Operation attempted on a session in the wrong lifecycle state
    #[error("Session error: {0}")]
    Session(String),

    /// No tool server could be started or reached
    #[error("No tool servers available: {0}")]
    NoServers(String),

    /// Parse error (e.g., malformed provider payload)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller cancelled the conversation between iterations
    #[error("Conversation cancelled")]
    Cancelled,

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Shorthand for a transport failure on `server`
    pub fn transport(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the session behind a tool call is gone
    pub const fn is_fatal_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io(_))
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::Transport { server, .. } => {
                format!("The tool server '{server}' stopped responding.")
            }
            Self::NoServers(_) => "No tool servers could be started.".into(),
            Self::Config(msg) => format!("Invalid configuration: {msg}"),
            Self::Cancelled => "The request was cancelled.".into(),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
