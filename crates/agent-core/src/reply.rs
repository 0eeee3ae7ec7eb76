//! Model Reply Parsing
//!
//! Splits an assistant reply into the parts the engine acts on. Fences are
//! matched the way models actually write them: an info word right after the
//! opening backticks (case-insensitive), body up to the next fence.

use serde_json::Value;

use crate::tool::ToolCall;

const FENCE: &str = "```";

/// Everything actionable in one reply
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedReply {
    /// Text outside any fenced block
    pub thought: String,
    pub final_answer: Option<String>,
    /// Fenced ```` ```tool ```` calls, in text order
    pub tool_calls: Vec<ToolCall>,
    /// Dedented ```` ```python ```` / ```` ```py ```` bodies, in text order
    pub code_blocks: Vec<String>,
}

impl ParsedReply {
    pub fn parse(text: &str) -> Self {
        let fences = fences(text);

        let mut thought = String::new();
        let mut cursor = 0;
        let mut final_answers = Vec::new();
        let mut tool_calls = Vec::new();
        let mut code_blocks = Vec::new();

        for fence in &fences {
            thought.push_str(&text[cursor..fence.start]);
            cursor = fence.end;
            match fence.lang.as_str() {
                "final_answer" => final_answers.push(fence.body.trim().to_string()),
                "tool" => tool_calls.extend(parse_tool_json(fence.body)),
                "python" | "py" => {
                    let code = dedent(&fence.body.replace("<end_code>", ""));
                    if !code.is_empty() {
                        code_blocks.push(code);
                    }
                }
                _ => {}
            }
        }
        thought.push_str(&text[cursor..]);

        let final_answer = final_answers
            .pop()
            .or_else(|| last_tagged(text, "ask"))
            .or_else(|| last_tagged(text, "wait"));

        Self {
            thought: thought.replace("<end_code>", "").trim().to_string(),
            final_answer,
            tool_calls,
            code_blocks,
        }
    }

    pub fn has_action(&self) -> bool {
        !self.tool_calls.is_empty() || !self.code_blocks.is_empty()
    }
}

/// Fenced tool calls only, for the simple loop
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    fences(text)
        .iter()
        .filter(|f| f.lang == "tool")
        .flat_map(|f| parse_tool_json(f.body))
        .collect()
}

/// The final-answer marker body, if any
pub fn final_answer(text: &str) -> Option<String> {
    ParsedReply::parse(text).final_answer
}

struct Fence<'a> {
    lang: String,
    body: &'a str,
    start: usize,
    end: usize,
}

fn fences(text: &str) -> Vec<Fence<'_>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find(FENCE) {
        let start = pos + offset;
        let after = start + FENCE.len();
        let lang_len = text[after..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(text.len() - after);
        let body_start = after + lang_len;
        let Some(close) = text[body_start..].find(FENCE) else {
            break;
        };
        let body_end = body_start + close;
        out.push(Fence {
            lang: text[after..body_start].to_ascii_lowercase(),
            body: &text[body_start..body_end],
            start,
            end: body_end + FENCE.len(),
        });
        pos = body_end + FENCE.len();
    }
    out
}

fn parse_tool_json(body: &str) -> Vec<ToolCall> {
    let body = body.trim();
    let parsed = serde_json::from_str::<Value>(body).and_then(|value| match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value::<ToolCall>)
            .collect(),
        other => serde_json::from_value::<ToolCall>(other).map(|c| vec![c]),
    });
    match parsed {
        Ok(calls) => calls,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed tool block");
            Vec::new()
        }
    }
}

/// Body of the last `<tag>...</tag>` pair, trimmed
fn last_tagged(text: &str, tag: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `text`
    let lower = text.to_ascii_lowercase();
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut found = None;
    let mut pos = 0;
    while let Some(offset) = lower[pos..].find(&open) {
        let body_start = pos + offset + open.len();
        let Some(len) = lower[body_start..].find(&close) else {
            break;
        };
        found = Some(text[body_start..body_start + len].trim().to_string());
        pos = body_start + len + close.len();
    }
    found
}

fn dedent(code: &str) -> String {
    let indent = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_code_block_with_end_code() {
        let reply = ParsedReply::parse(
            "Thought: count rows first.\nCode:\n```python\n    rows = 3\n    print(rows)\n```<end_code>",
        );
        assert_eq!(reply.code_blocks, vec!["rows = 3\nprint(rows)"]);
        assert_eq!(reply.thought, "Thought: count rows first.\nCode:");
        assert!(reply.final_answer.is_none());
        assert!(reply.has_action());
    }

    #[test]
    fn test_last_final_answer_wins() {
        let reply = ParsedReply::parse(
            "```final_answer\ndraft\n```\n<ask>really?</ask>\n```final_answer\n42\n```",
        );
        assert_eq!(reply.final_answer.as_deref(), Some("42"));
    }

    #[test]
    fn test_ask_before_wait() {
        assert_eq!(final_answer("<wait>hold on</wait> <ASK> Which table? </ASK>").as_deref(), Some("Which table?"));
        assert_eq!(final_answer("<wait>one moment</wait>").as_deref(), Some("one moment"));
        assert_eq!(final_answer("no markers here"), None);
    }

    #[test]
    fn test_fenced_tool_calls_in_order() {
        let text = r#"First this:
```tool
{"tool": "list_tables", "arguments": {}}
```
then:
```tool
[{"name": "describe", "arguments": {"table": "users"}}, {"name": "count"}]
```"#;
        let calls = parse_tool_calls(text);
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["list_tables", "describe", "count"]);
        assert_eq!(calls[1].arguments, json!({"table": "users"}));
        assert_eq!(calls[2].arguments, Value::Null);
    }

    #[test]
    fn test_malformed_tool_block_ignored() {
        assert!(parse_tool_calls("```tool\n{not json}\n```").is_empty());
    }

    #[test]
    fn test_py_alias_and_case() {
        let reply = ParsedReply::parse("```PY\nx = 1\n```\n```Python\ny = 2\n```\n```json\n{}\n```");
        assert_eq!(reply.code_blocks, vec!["x = 1", "y = 2"]);
    }

    #[test]
    fn test_unclosed_fence_is_thought() {
        let reply = ParsedReply::parse("thinking ```python\nx = 1");
        assert!(reply.code_blocks.is_empty());
        assert_eq!(reply.thought, "thinking ```python\nx = 1");
    }
}
