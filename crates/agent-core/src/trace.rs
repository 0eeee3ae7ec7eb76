//! Trace events emitted while a conversation runs
//!
//! The engine never prints. Callers that want to watch progress hand it the
//! sending half of an unbounded channel; a closed receiver is ignored.

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::context::Observation;
use crate::tool::ToolCall;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    PlanReady { plan: String },
    StepStarted { iteration: usize, max_iterations: usize },
    /// Separate reasoning text from models that expose it
    ProviderReasoning { text: String },
    Thought { text: String },
    ToolDispatched { call: ToolCall },
    ToolCompleted { name: String, success: bool, output: String },
    CodeExecuted { code: String, observation: Observation },
    FinalAnswer { answer: String },
    BudgetExhausted { iterations: usize },
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanReady { plan } => write!(f, "Plan:\n{plan}"),
            Self::StepStarted {
                iteration,
                max_iterations,
            } => write!(f, "Step {iteration}/{max_iterations}:"),
            Self::ProviderReasoning { text } => write!(f, "[REASONING] {text}"),
            Self::Thought { text } => f.write_str(text),
            Self::ToolDispatched { call } => {
                write!(f, "View result from {} with {}", call.name, call.arguments)
            }
            Self::ToolCompleted {
                name,
                success,
                output,
            } => {
                let status = if *success { "ok" } else { "failed" };
                write!(f, "Tool {name} {status}: {output}")
            }
            Self::CodeExecuted { code, observation } => {
                write!(f, "Executing code:\n{code}\nCode output:\n{}", observation.render())
            }
            Self::FinalAnswer { .. } => f.write_str("Final answer detected"),
            Self::BudgetExhausted { iterations } => write!(
                f,
                "Reached max iterations ({iterations}) without final answer"
            ),
        }
    }
}

/// Optional event sink
#[derive(Clone, Debug, Default)]
pub struct Tracer(Option<UnboundedSender<TraceEvent>>);

impl Tracer {
    pub const fn new(sender: UnboundedSender<TraceEvent>) -> Self {
        Self(Some(sender))
    }

    pub const fn disabled() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: TraceEvent) {
        if let Some(tx) = &self.0 {
            // The receiver going away only means nobody is watching
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tracer = Tracer::new(tx);
        tracer.emit(TraceEvent::FinalAnswer { answer: "42".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            TraceEvent::FinalAnswer { answer: "42".into() }
        );
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        Tracer::new(tx).emit(TraceEvent::BudgetExhausted { iterations: 1 });
        Tracer::disabled().emit(TraceEvent::BudgetExhausted { iterations: 1 });
    }

    #[test]
    fn test_serializes_tagged() {
        let json = serde_json::to_value(TraceEvent::StepStarted {
            iteration: 1,
            max_iterations: 10,
        })
        .unwrap();
        assert_eq!(json["event"], "step_started");
        assert_eq!(json["iteration"], 1);
    }
}
