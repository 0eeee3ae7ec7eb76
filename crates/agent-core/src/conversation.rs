//! Conversation State
//!
//! Everything one reasoning conversation owns: its transcript, the iteration
//! counter, the plan and the execution context. A caller that keeps the
//! state across prompts keeps the variables bound by earlier code steps.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::message::{Conversation, Message};

/// Unique conversation identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ConversationState {
    id: ConversationId,
    transcript: Conversation,
    iteration: usize,
    plan: Option<String>,
    context: ExecutionContext,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn id(&self) -> ConversationId {
        self.id
    }

    pub const fn transcript(&self) -> &Conversation {
        &self.transcript
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn push(&mut self, message: Message) {
        self.transcript.push(message);
    }

    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    pub(crate) const fn set_iteration(&mut self, iteration: usize) {
        self.iteration = iteration;
    }

    pub fn plan(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    pub(crate) fn set_plan(&mut self, plan: impl Into<String>) {
        self.plan = Some(plan.into());
    }

    pub const fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub const fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.context
    }

    /// Start a new query: fresh transcript and counters, same variables
    pub(crate) fn begin_query(&mut self) {
        self.transcript = Conversation::new();
        self.iteration = 0;
        self.plan = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Value;

    #[test]
    fn test_begin_query_keeps_variables() {
        let mut state = ConversationState::new();
        state.push(Message::user("first"));
        state.set_iteration(3);
        state.set_plan("plan");
        state.context_mut().execute("x = 1");

        state.begin_query();

        assert!(state.messages().is_empty());
        assert_eq!(state.iteration(), 0);
        assert_eq!(state.plan(), None);
        assert_eq!(state.context().get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ConversationState::new().id(), ConversationState::new().id());
    }
}
