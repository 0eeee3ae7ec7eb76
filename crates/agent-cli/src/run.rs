//! One run: load config, start servers, answer, tear down

use std::sync::Arc;

use agent_core::{
    Agent, AgentError, Conclusion, Conversation, LlmProvider, Message, ReasoningEngine, SessionManager,
    ToolRegistry, TraceEvent, Tracer,
};
use agent_runtime::{AppConfig, ModelConfig, factory};
use anyhow::{Context, bail};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;
use crate::transcript;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(&cli.config)?;
    config.validate()?;
    let model = config.choose_model(cli.model.as_deref())?;
    let provider = factory::build_provider(model)?;

    match provider.health_check().await {
        Ok(true) => tracing::info!(provider = %model.provider, model = %model.model, "Model provider reachable"),
        _ => tracing::warn!(provider = %model.provider, "Model provider did not answer its health check"),
    }

    let sessions = factory::session_manager(&config.servers()?);
    let connected = sessions.connect_all().await;
    if connected == 0 {
        sessions.shutdown().await;
        bail!(AgentError::NoServers(format!(
            "none of the {} configured servers started",
            sessions.len()
        )));
    }
    tracing::info!(connected, configured = sessions.len(), "Tool servers ready");

    sessions
        .run_scoped(|| answer(&cli, &config, model, provider, &sessions))
        .await
}

async fn answer(
    cli: &Cli,
    config: &AppConfig,
    model: &ModelConfig,
    provider: Arc<dyn LlmProvider>,
    sessions: &SessionManager,
) -> anyhow::Result<()> {
    let registry = Arc::new(ToolRegistry::build(sessions.sessions(), config.collision_policy).await);
    tracing::info!(
        tools = registry.len(),
        failed_servers = registry.failed_servers().len(),
        "Tool registry built"
    );

    let cancel = CancellationToken::new();
    let watcher = watch_ctrl_c(cancel.clone());
    let question = cli.question();

    let messages = if cli.reasoning {
        reason(cli, config, model, provider, registry.clone(), &question, cancel).await
    } else {
        simple(cli, config, model, provider, registry.clone(), &question, cancel).await
    };
    watcher.abort();
    let messages = messages?;

    if let Some(path) = &cli.log_messages {
        transcript::append(path, &messages, &registry.tool_specs())?;
    }
    Ok(())
}

async fn reason(
    cli: &Cli,
    config: &AppConfig,
    model: &ModelConfig,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    question: &str,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<Message>> {
    let (printer, tracer) = if cli.quiet {
        (None, Tracer::disabled())
    } else {
        let (tx, rx) = mpsc::unbounded_channel();
        (Some(print_events(rx)), Tracer::new(tx))
    };

    let outcome = {
        let engine = ReasoningEngine::new(provider, registry, cli.reasoning_config(&config.reasoning))?
            .with_options(model.generation_options())
            .with_tracer(tracer)
            .with_cancellation(cancel);
        engine.ask(question).await
    };
    // The engine (and its sender) is gone, so the printer drains and exits
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let outcome = outcome.context("reasoning run failed")?;
    if outcome.conclusion == Conclusion::BudgetExhausted {
        tracing::warn!(iterations = outcome.iterations, "Answer was forced after the iteration budget ran out");
    }
    println!("{}", outcome.answer);
    Ok(outcome.transcript)
}

async fn simple(
    cli: &Cli,
    config: &AppConfig,
    model: &ModelConfig,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    question: &str,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<Message>> {
    let mut builder = Agent::builder()
        .provider(provider)
        .registry(registry)
        .dispatch(cli.dispatch_mode(config.reasoning.dispatch))
        .generation(model.generation_options())
        .max_iterations(cli.max_iterations.unwrap_or(config.reasoning.max_iterations))
        .cancellation(cancel);
    if let Some(prompt) = &model.system_message {
        builder = builder.system_prompt(prompt.clone());
    }
    let agent = builder.build()?;

    let mut conversation = Conversation::with_system_prompt(agent.system_prompt());
    conversation.push(Message::user(question));
    let reply = agent.run(&mut conversation).await.context("conversation failed")?;

    if reply.exhausted {
        tracing::warn!(iterations = reply.iterations, "Stopped at the iteration ceiling");
    }
    println!("{}", reply.content);
    Ok(conversation.messages().to_vec())
}

fn print_events(rx: mpsc::UnboundedReceiver<TraceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        while let Some(event) = events.next().await {
            eprintln!("{event}");
        }
    })
}

fn watch_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping at the next step boundary");
            cancel.cancel();
        }
    })
}
