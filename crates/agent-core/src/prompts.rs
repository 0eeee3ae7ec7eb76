//! Prompt templates for the reasoning engine

/// Plan text used when planning is disabled
pub const NO_PLAN: &str = "No specific plan - proceeding with direct execution.";

/// Guidelines used when the caller supplies none
pub const DEFAULT_GUIDELINES: &str = "Answer the question accurately and concisely.";

/// Last message before the forced-conclusion call
pub const FORCED_CONCLUSION: &str = "You have reached the maximum number of reasoning steps. \
Do not call any more tools and do not write more code. Summarize what you have found so far \
and give your best answer now, using this format:
```final_answer
...<your best answer, noting anything left unresolved>...
```";

const REASONING_SYSTEM_PROMPT: &str = r#"You are a reasoning agent that solves tasks step by step using the tools available to you.

Work through every task as Explore, Plan, Execute, Conclude:
1. Explore: look at the available tools and understand what the task needs.
2. Plan: draft a high-level plan from what you explored.
3. Execute: carry the plan out. If it turns out not to work, go back to Explore.
4. Conclude: distil the results into an answer.

Each step you take is Thought, then Code or Call-Tool, then Observation.
1. Thought: explain your reasoning and the approach for this step.
2. Code or Call-Tool. Code is written like this:
Code:
```python
your_code
```<end_code>
Always put `<end_code>` after the code block. Use print() for anything you need to see.
Write code one small cell at a time, like an analyst in a notebook.
Variables persist between executions.
The language is a small Python subset: assignments, if/elif/else, for loops,
list and dict literals, comprehensions, f-strings and common builtins and
methods. Imports are accepted but no modules are available.
To call a tool, follow the format in the Available Tools section.
Choose only one of Code or Call-Tool in each step.
3. Observation: the output of your code comes back in a ```output ... ``` block.

When the task is complete, reply with:
```final_answer
...<your complete answer>...
```
If the request is ambiguous or you lack information only the user has, ask them:
<ask>...<your question>...</ask>

Rules:
- Always check the available tools before deciding information is unavailable.
- Validate assumptions with the tools before acting on them.
- Only if every plan you can think of has failed, answer "Not Applicable".
- Use only variables you have defined. Never invent placeholder data.
- Never repeat code that already failed to help.
- Solve the task yourself instead of describing how to solve it."#;

/// System prompt for stepping, with the text tool catalog when the
/// provider has no native tool calling
pub fn reasoning_system(tool_section: Option<&str>) -> String {
    match tool_section {
        Some(section) if !section.is_empty() => {
            format!("{REASONING_SYSTEM_PROMPT}\n\n{section}")
        }
        _ => REASONING_SYSTEM_PROMPT.to_string(),
    }
}

/// System prompt for the planning call
pub fn planning_system(tool_names: &[&str]) -> String {
    let tools = serde_json::to_string_pretty(tool_names).unwrap_or_else(|_| "[]".into());
    format!(
        "Using the available tools and context, prepare a plan:
1. Break the user query into smaller sub-questions.
Sub-questions:
- ...

2. Extract the entities named in the query and the guidelines.
Entity Extraction:
- ...

3. Identify the tools and approaches relevant to the query. List them, do not explain them.
Relevant Tools and Approaches:
- Tool: tool_name - how it helps
- Approach: method - what it does

4. State the limitations or conditions set by the query and the guidelines.
Constraints:
- ...

5. Outline a solution approach that respects the constraints and uses the tools.
Solution Approach:
- Step 1: ...
- Step 2: ...

Available tools:
{tools}
"
    )
}

pub fn planning_user(question: &str, guidelines: &str) -> String {
    format!("The User Query:\n- {question}\nThe Guidelines:\n- {guidelines}\n")
}

/// First user turn of the stepping phase
pub fn initial_step(question: &str, guidelines: &str, plan: &str) -> String {
    format!(
        "Here is the question you need to answer:
- {question}

Here are the guidelines you must follow when answering it:
- {guidelines}

Here is the context and strategy from the planning analysis:
```plan
{plan}
```
"
    )
}

pub fn fallback_plan(error: &impl std::fmt::Display) -> String {
    format!("Planning failed: {error}. Proceeding with basic approach.")
}

/// Answer used when even the forced-conclusion call fails
pub fn stopped_at(max_iterations: usize) -> String {
    format!("Process stopped after reaching maximum iterations ({max_iterations}).")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_step_embeds_plan_block() {
        let prompt = initial_step("What is 6 * 7?", DEFAULT_GUIDELINES, "multiply");
        assert!(prompt.contains("- What is 6 * 7?"));
        assert!(prompt.contains("```plan\nmultiply\n```"));
    }

    #[test]
    fn test_reasoning_system_appends_catalog() {
        assert!(!reasoning_system(None).contains("## Available Tools"));
        let prompt = reasoning_system(Some("## Available Tools\n- x"));
        assert!(prompt.ends_with("## Available Tools\n- x"));
    }

    #[test]
    fn test_planning_lists_tools() {
        let prompt = planning_system(&["list_tables", "query"]);
        assert!(prompt.contains("\"list_tables\""));
        assert!(prompt.contains("\"query\""));
    }
}
