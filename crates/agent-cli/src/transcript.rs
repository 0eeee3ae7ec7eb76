//! Append-only JSONL log of finished runs

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use agent_core::{Message, ToolSpec};
use anyhow::Context;
use serde::Serialize;

#[derive(Serialize)]
struct Record<'a> {
    messages: &'a [Message],
    functions: &'a [ToolSpec],
}

/// Append one `{"messages": [...], "functions": [...]}` line to `path`
pub fn append(path: &Path, messages: &[Message], functions: &[ToolSpec]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut line = serde_json::to_vec(&Record { messages, functions })?;
    line.push(b'\n');
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(&line))
        .with_context(|| format!("writing {}", path.display()))
}
