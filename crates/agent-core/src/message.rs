//! Conversation Messages
//!
//! Standard message format used across the agent system. A [`Conversation`]
//! is the transcript the engine and the simple loop hand to the provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (linked to a tool call)
    Tool,
    /// Code execution output, shown to the model as user-side context
    Observation,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
            Self::Observation => write!(f, "observation"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content
    pub content: String,

    /// Tool name for tool messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Optional metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Additional message metadata
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Tool call ID (for tool messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Model that generated this (for assistant messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Custom key-value pairs
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that requested tool calls
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::assistant(content);
        if !tool_calls.is_empty() {
            msg.metadata = Some(MessageMetadata {
                tool_calls,
                ..Default::default()
            });
        }
        msg
    }

    /// Create a tool result message
    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        if tool_call_id.is_some() {
            msg.metadata = Some(MessageMetadata {
                tool_call_id,
                ..Default::default()
            });
        }
        msg
    }

    /// Create a code execution observation
    pub fn observation(content: impl Into<String>) -> Self {
        Self::new(Role::Observation, content)
    }

    /// Add a name to the message
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Tool calls attached to this message, if any
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.metadata
            .as_ref()
            .map(|m| m.tool_calls.as_slice())
            .unwrap_or_default()
    }

    /// Tool call this message answers, if any
    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_call_id.as_deref()
    }

    /// Estimate token count (rough approximation)
    pub fn estimate_tokens(&self) -> u32 {
        // ~4 characters per token is a rough estimate
        u32::try_from(self.content.len() / 4).unwrap_or(u32::MAX) + 4 // +4 for role overhead
    }
}

/// Conversation history with utility methods
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,

    /// Maximum context length (in estimated tokens)
    #[serde(default = "default_max_context")]
    max_context_tokens: u32,
}

const fn default_max_context() -> u32 {
    32_768
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            max_context_tokens: default_max_context(),
        }
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt));
        conv
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get messages as mutable
    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Make sure the transcript opens with a system message
    pub fn ensure_system_prompt(&mut self, prompt: impl Into<String>) {
        if self.messages.first().map(|m| m.role) != Some(Role::System) {
            self.messages.insert(0, Message::system(prompt));
        }
    }

    /// Clear all messages except system prompt
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Estimate total tokens in conversation
    pub fn estimate_tokens(&self) -> u32 {
        self.messages.iter().map(Message::estimate_tokens).sum()
    }

    /// Truncate to fit within token limit, preserving system and recent messages
    pub fn truncate_to_fit(&mut self) {
        while self.estimate_tokens() > self.max_context_tokens && self.messages.len() > 2 {
            // Find first non-system message and remove it
            match self.messages.iter().position(|m| m.role != Role::System) {
                // Don't remove the very last message
                Some(pos) if pos < self.messages.len() - 1 => {
                    self.messages.remove(pos);
                }
                _ => break,
            }
        }
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn test_conversation() {
        let mut conv = Conversation::with_system_prompt("You are helpful.");
        conv.push(Message::user("Hi"));
        conv.push(Message::assistant("Hello!"));

        assert_eq!(conv.len(), 3);
        assert!(conv.last().unwrap().role == Role::Assistant);
    }

    #[test]
    fn test_ensure_system_prompt_only_once() {
        let mut conv = Conversation::new();
        conv.push(Message::user("Hi"));
        conv.ensure_system_prompt("first");
        conv.ensure_system_prompt("second");
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].content, "first");
    }

    #[test]
    fn test_tool_call_metadata() {
        let call = ToolCall::new("list_tables", serde_json::json!({})).with_id("c1");
        let msg = Message::assistant_with_tool_calls("", vec![call]);
        assert_eq!(msg.tool_calls().len(), 1);

        let reply = Message::tool("users", Some("c1".into())).with_name("list_tables");
        assert_eq!(reply.tool_call_id(), Some("c1"));
        assert!(Message::user("x").tool_calls().is_empty());
    }
}
