//! mcp-agent
//!
//! Starts the MCP servers named in the configuration file, answers one
//! question with their tools, and shuts every server down again.

mod cli;
mod run;
mod transcript;

use std::process::ExitCode;

use agent_core::AgentError;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = match cli.log_level() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if cli.quiet { "warn" } else { "info" })
        }),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", describe(&e));
            ExitCode::FAILURE
        }
    }
}

/// The friendly line for agent errors, with the cause chain underneath
fn describe(error: &anyhow::Error) -> String {
    match error.downcast_ref::<AgentError>() {
        Some(agent) => format!("{}\n  {error:#}", agent.user_message()),
        None => format!("Error: {error:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_describe_agent_error() {
        let error = Err::<(), _>(AgentError::Cancelled)
            .context("conversation failed")
            .unwrap_err();
        assert_eq!(
            describe(&error),
            "The request was cancelled.\n  conversation failed: Conversation cancelled"
        );
    }

    #[test]
    fn test_describe_other_error() {
        let error = anyhow::anyhow!("cannot read mcp_config.json");
        assert_eq!(describe(&error), "Error: cannot read mcp_config.json");
    }
}
