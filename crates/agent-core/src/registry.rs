//! Tool Registry
//!
//! Aggregates the catalogs of every connected server into one flat,
//! addressable namespace. Building never fails: a server whose discovery
//! fails is marked `Failed` and left out, the others proceed.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{ServerId, ServerSession};
use crate::tool::{ToolDescriptor, ToolError, ToolSpec};

/// How a tool name advertised by more than one server is resolved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Keep the first registration, drop later duplicates with a warning
    #[default]
    FirstWins,
    /// Re-key later duplicates as `<server>__<tool>`
    Qualify,
    /// Drop every tool whose name is claimed by more than one server
    Reject,
}

/// Separator between server id and tool name for qualified keys
pub const QUALIFIER: &str = "__";

/// One addressable tool
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryEntry {
    /// Name the model calls the tool by
    pub key: String,

    /// Descriptor as discovered (its `name` is the server-side name)
    pub descriptor: ToolDescriptor,
}

impl RegistryEntry {
    pub const fn server_id(&self) -> &ServerId {
        &self.descriptor.server_id
    }
}

/// Flat mapping from tool key to owning server
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
    sessions: HashMap<ServerId, Arc<ServerSession>>,
    failed: Vec<ServerId>,
    policy: CollisionPolicy,
}

impl ToolRegistry {
    /// Empty registry with the given collision policy
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Discover tools from `sessions`, in order
    ///
    /// Earlier sessions take precedence under [`CollisionPolicy::FirstWins`].
    pub async fn build(sessions: &[Arc<ServerSession>], policy: CollisionPolicy) -> Self {
        let mut registry = Self::new(policy);
        let mut rejected = HashSet::new();

        for session in sessions {
            let id = session.id().clone();
            registry.sessions.insert(id.clone(), Arc::clone(session));

            if !session.is_connected().await {
                tracing::warn!(server = %id, state = %session.state().await, "Skipping tool discovery; server not connected");
                registry.failed.push(id);
                continue;
            }

            match session.discover().await {
                Ok(tools) => {
                    tracing::info!(server = %id, tools = tools.len(), "Discovered tools");
                    for tool in tools {
                        registry.insert(tool, &mut rejected);
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %id, error = %e, "Tool discovery failed; server excluded");
                    registry.failed.push(id);
                }
            }
        }

        registry
    }

    fn insert(&mut self, descriptor: ToolDescriptor, rejected: &mut HashSet<String>) {
        let name = descriptor.name.clone();
        if rejected.contains(&name) {
            tracing::warn!(tool = %name, server = %descriptor.server_id, "Dropping tool with conflicting name");
            return;
        }

        let Some(&existing) = self.index.get(&name) else {
            self.push(name, descriptor);
            return;
        };
        let owner = self.entries[existing].server_id().clone();

        match self.policy {
            CollisionPolicy::FirstWins => {
                tracing::warn!(
                    tool = %name,
                    kept = %owner,
                    dropped = %descriptor.server_id,
                    "Duplicate tool name; keeping first registration"
                );
            }
            CollisionPolicy::Qualify => {
                let key = format!("{}{QUALIFIER}{name}", descriptor.server_id);
                if self.index.contains_key(&key) {
                    tracing::warn!(tool = %key, "Qualified tool name already taken; dropping");
                } else {
                    tracing::info!(tool = %name, key = %key, "Duplicate tool name; registered under qualified key");
                    self.push(key, descriptor);
                }
            }
            CollisionPolicy::Reject => {
                tracing::warn!(
                    tool = %name,
                    servers = %format!("{owner}, {}", descriptor.server_id),
                    "Tool name claimed by several servers; rejecting all"
                );
                self.entries.remove(existing);
                rejected.insert(name);
                self.reindex();
            }
        }
    }

    fn push(&mut self, key: String, descriptor: ToolDescriptor) {
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(RegistryEntry { key, descriptor });
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect();
    }

    /// Find the owner of a tool key
    pub fn resolve(&self, name: &str) -> Result<&RegistryEntry, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| ToolError::not_found(name))
    }

    /// Session that owns `server_id`
    pub fn session(&self, server_id: &ServerId) -> Option<&Arc<ServerSession>> {
        self.sessions.get(server_id)
    }

    /// All entries in registration order
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Tool keys in registration order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.key.as_str()).collect()
    }

    /// Servers excluded because they failed to connect or list tools
    pub fn failed_servers(&self) -> &[ServerId] {
        &self.failed
    }

    pub const fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Function definitions for providers with native tool calling
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.entries
            .iter()
            .map(|e| ToolSpec {
                name: e.key.clone(),
                description: e.descriptor.description.clone(),
                parameters: e.descriptor.input_schema.clone(),
            })
            .collect()
    }

    /// Generate system prompt section describing available tools
    pub fn prompt_section(&self) -> String {
        let mut prompt = String::from("## Available Tools\n\n");
        prompt.push_str("You can use the following tools by responding with a JSON block:\n\n");
        prompt.push_str(
            "```tool\n{\"tool\": \"tool_name\", \"arguments\": {\"arg\": \"value\"}}\n```\n\n",
        );

        for entry in &self.entries {
            let _ = writeln!(prompt, "### {}", entry.key);
            if !entry.descriptor.description.is_empty() {
                let _ = writeln!(prompt, "{}", entry.descriptor.description);
            }

            let params = describe_parameters(&entry.descriptor.input_schema);
            if !params.is_empty() {
                prompt.push_str("**Parameters:**\n");
                for line in params {
                    let _ = writeln!(prompt, "{line}");
                }
            }
            prompt.push('\n');
        }

        prompt
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("failed", &self.failed)
            .field("policy", &self.policy)
            .finish()
    }
}

fn describe_parameters(schema: &Value) -> Vec<String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };
    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, prop)| {
            let ty = prop.get("type").and_then(Value::as_str).unwrap_or("any");
            let description = prop.get("description").and_then(Value::as_str).unwrap_or("");
            let marker = if required.contains(name.as_str()) { " (required)" } else { "" };
            format!("- `{name}` ({ty}){marker}: {description}")
        })
        .collect()
}
