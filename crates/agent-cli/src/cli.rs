//! Command-line surface

use std::path::PathBuf;

use agent_core::{DispatchMode, ReasoningConfig};
use agent_runtime::config::DEFAULT_CONFIG_PATH;
use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "mcp-agent",
    version,
    about = "Answer a question using tools from MCP servers"
)]
pub struct Cli {
    /// The question; multiple words are joined with spaces
    #[arg(required = true)]
    pub query: Vec<String>,

    /// Configuration file naming models and MCP servers
    #[arg(long, env = "MCP_AGENT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Model title or id from the configuration (default: the one marked default)
    #[arg(long)]
    pub model: Option<String>,

    /// Print only the answer
    #[arg(short, long)]
    pub quiet: bool,

    /// Plan, call tools and run code step by step instead of the simple loop
    #[arg(long)]
    pub reasoning: bool,

    /// Skip the planning pass (reasoning mode)
    #[arg(long)]
    pub no_planning: bool,

    /// Do not execute code blocks (reasoning mode)
    #[arg(long)]
    pub no_code: bool,

    #[arg(long, value_parser = positive)]
    pub max_iterations: Option<usize>,

    /// Model used for the planning call only
    #[arg(long)]
    pub planning_model: Option<String>,

    /// Run up to N tool calls of one step at a time
    #[arg(long, value_name = "N", value_parser = positive)]
    pub concurrency: Option<usize>,

    /// Append the run's messages and tool list as one JSON line
    #[arg(long, value_name = "FILE")]
    pub log_messages: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

fn positive(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Cli {
    pub fn question(&self) -> String {
        self.query.join(" ")
    }

    /// File settings with command-line overrides applied
    pub fn reasoning_config(&self, base: &ReasoningConfig) -> ReasoningConfig {
        let mut config = base.clone();
        if self.no_planning {
            config.enable_planning = false;
        }
        if self.no_code {
            config.enable_code_execution = false;
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if let Some(model) = &self.planning_model {
            config.planning_model = Some(model.clone());
        }
        config.dispatch = self.dispatch_mode(base.dispatch);
        config
    }

    pub fn dispatch_mode(&self, base: DispatchMode) -> DispatchMode {
        self.concurrency
            .map_or(base, |limit| DispatchMode::Concurrent { limit })
    }

    /// Default filter when `-v` is not given and `RUST_LOG` is unset
    pub const fn log_level(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mcp-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_query_words_joined() {
        let cli = parse(&["What", "tables", "exist?"]);
        assert_eq!(cli.question(), "What tables exist?");
        assert!(!cli.reasoning);
        assert_eq!(cli.log_level(), None);
    }

    #[test]
    fn test_query_required() {
        assert!(Cli::try_parse_from(["mcp-agent", "--quiet"]).is_err());
    }

    #[test]
    fn test_zero_rejected() {
        assert!(Cli::try_parse_from(["mcp-agent", "--max-iterations", "0", "q"]).is_err());
        assert!(Cli::try_parse_from(["mcp-agent", "--concurrency", "0", "q"]).is_err());
    }

    #[test]
    fn test_reasoning_overrides() {
        let cli = parse(&[
            "--reasoning",
            "--no-planning",
            "--no-code",
            "--max-iterations",
            "3",
            "--planning-model",
            "big",
            "--concurrency",
            "4",
            "-vv",
            "q",
        ]);
        let config = cli.reasoning_config(&ReasoningConfig::default());
        assert!(!config.enable_planning);
        assert!(!config.enable_code_execution);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.planning_model.as_deref(), Some("big"));
        assert_eq!(config.dispatch, DispatchMode::Concurrent { limit: 4 });
        assert_eq!(cli.log_level(), Some("trace"));
    }

    #[test]
    fn test_file_settings_kept_without_flags() {
        let base = ReasoningConfig {
            max_iterations: 7,
            dispatch: DispatchMode::Concurrent { limit: 2 },
            ..ReasoningConfig::default()
        };
        let config = parse(&["q"]).reasoning_config(&base);
        assert_eq!(config.max_iterations, 7);
        assert!(config.enable_planning);
        assert_eq!(config.dispatch, DispatchMode::Concurrent { limit: 2 });
    }
}
