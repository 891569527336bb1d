mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use quill_core::conversation::ConversationStore;
use quill_core::ids::SessionId;
use quill_core::model::ModelClient;
use quill_engine::tools::builtin_registry;
use quill_engine::{AgentRunner, Outcome, StdoutTransport, TransportAdapter};
use quill_llm::{AnthropicClient, BedrockClient, MockModelClient, MockResponse};
use quill_server::handlers::{is_new_conversation, NEW_CONVERSATION_REPLY};
use quill_store::{Database, MemoryConversationStore, SqliteConversationStore};
use quill_telemetry::{init_telemetry, TelemetryConfig};

use crate::config::{ModelSection, Overrides, Provider, QuillConfig};

#[derive(Parser)]
#[command(name = "quill", version, about = "Tool-augmented streaming inference engine")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "QUILL_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve `POST /invoke` until ctrl-c.
    Serve {
        #[arg(long, env = "QUILL_PORT")]
        port: Option<u16>,
        #[arg(long)]
        host: Option<String>,
    },
    /// Answer one goal on stdout.
    Ask {
        goal: String,
        #[arg(long, default_value = "cli")]
        session: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = QuillConfig::load(cli.config.as_deref())?;
    config.apply(cli.overrides);
    config.validate()?;

    let mut telemetry =
        TelemetryConfig::from_section(&config.logging).context("invalid [logging] section")?;
    telemetry.stderr = matches!(cli.command, Command::Ask { .. });
    init_telemetry(&telemetry)?;

    let model = build_model(&mut config.model).await?;
    let store = build_store(&config)?;
    let tools = builtin_registry().context("failed to register built-in tools")?;
    tracing::info!(
        provider = ?config.model.provider,
        model = %config.engine.model.model,
        tools = tools.count(),
        "engine ready"
    );
    let runner = Arc::new(AgentRunner::new(model, Arc::new(tools), store.clone(), config.engine.clone()));

    match cli.command {
        Command::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            serve(config, runner, store).await
        }
        Command::Ask { goal, session } => ask(&goal, SessionId::from_raw(session), runner, store).await,
    }
}

async fn build_model(section: &mut ModelSection) -> anyhow::Result<Arc<dyn ModelClient>> {
    Ok(match section.provider {
        Provider::Bedrock => Arc::new(BedrockClient::new(&section.options.region).await),
        Provider::Anthropic => {
            let key = section
                .api_key
                .take()
                .context("the anthropic provider needs ANTHROPIC_API_KEY or [model] api_key")?;
            Arc::new(AnthropicClient::new(key).context("failed to build anthropic client")?)
        }
        Provider::Mock => Arc::new(MockModelClient::repeating(MockResponse::text(
            "Thought: nothing to compute.\nFinal Answer: This is a mock response.",
        ))),
    })
}

fn build_store(config: &QuillConfig) -> anyhow::Result<Arc<dyn ConversationStore>> {
    if config.store.in_memory {
        return Ok(Arc::new(MemoryConversationStore::new()));
    }
    let db = Database::open(&config.store.path)
        .with_context(|| format!("failed to open database {}", config.store.path.display()))?;
    Ok(Arc::new(SqliteConversationStore::new(db)))
}

async fn serve(
    config: QuillConfig,
    runner: Arc<AgentRunner>,
    store: Arc<dyn ConversationStore>,
) -> anyhow::Result<ExitCode> {
    let addr = config.server.bind_addr();
    let handle = quill_server::start(config.server, runner, store, CancellationToken::new())
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(port = handle.port(), "quill ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

async fn ask(
    goal: &str,
    session_id: SessionId,
    runner: Arc<AgentRunner>,
    store: Arc<dyn ConversationStore>,
) -> anyhow::Result<ExitCode> {
    if is_new_conversation(goal) {
        store
            .increment_chat_index(session_id.as_str())
            .await
            .context("failed to start a new conversation")?;
        println!("{NEW_CONVERSATION_REPLY}");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let mut transport = TransportAdapter::new(StdoutTransport::new());
    let report = runner.run(goal, &session_id, &mut transport, &cancel).await;
    match report.outcome {
        Outcome::Answered { .. } => Ok(ExitCode::SUCCESS),
        Outcome::Aborted(reason) => {
            eprintln!("error: {reason} (status {})", reason.status());
            Ok(ExitCode::FAILURE)
        }
    }
}
