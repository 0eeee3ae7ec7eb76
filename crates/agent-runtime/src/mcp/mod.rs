//! MCP client transports
//!
//! Every transport implements [`agent_core::ProviderSession`]; the core never
//! sees which one a server uses.

mod http;
pub mod protocol;
mod sse;
mod stdio;

pub use http::{HttpSession, sse_messages};
pub use sse::SseSession;
pub use stdio::StdioSession;
