//! Stagewright CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load `stagewright.toml` (or the file named by
//!    `--config` / `STAGEWRIGHT_CONFIG`) and validate it.
//! 2. **Wire observability**: configure `tracing-subscriber` with a text or
//!    JSON layer and, when `OTEL_EXPORTER_OTLP_ENDPOINT` is set, an
//!    OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: create the `AnthropicProvider`,
//!    `ExtensionConnector`, and `FileStateStore` and inject them into the
//!    `PipelineOrchestrator`.
//! 4. **Dispatch**: `run` starts a research run, `resume` answers a pause,
//!    `status` reports the agent's active run.
//!
//! Pause messages and final documents go to stdout; logs go to stderr.

mod config;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use extension_api::ExtensionConnector;
use llm::{AnthropicConfig, AnthropicProvider};
use nodes::{OrchestratorSettings, PipelineOrchestrator, RunExit, StageExecutor, ToolLifecycleManager};
use pipeline::follow_up::FollowUpContextLoader;
use pipeline::persistence::StateStore;
use pipeline::stage::PipelineDefinition;
use pipeline::tokens::TokenBudgetEstimator;
use pipeline::{SessionId, TokenCount};
use store::FileStateStore;

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "stagewright", version, about = "Staged, resumable research runs")]
struct Cli {
    /// Configuration file.
    #[arg(long, env = "STAGEWRIGHT_CONFIG", default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Agent whose runs to operate on; overrides `storage.agent`.
    #[arg(long, global = true)]
    agent: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a new run.
    Run {
        /// The research question.
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Continue from a completed run.
        #[arg(long, value_name = "SESSION")]
        follow_up: Option<String>,
    },
    /// Answer the pause of the agent's active run.
    Resume {
        /// `proceed`, guidance for the next stage, `skip <stage>`, or `abort`.
        #[arg(default_value = "proceed", num_args = 0..)]
        response: Vec<String>,
    },
    /// Show the agent's active run.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = match telemetry::init(cli.log_format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = Config::load(&cli.config)?;
    if let Some(agent) = cli.agent {
        config.storage.agent = agent;
    }
    let base = config_dir(&cli.config);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.storage_root(&base)));
    let definition = PipelineDefinition::research();

    match cli.command {
        Command::Run { question, follow_up } => {
            let orchestrator = orchestrator(&config, &base, store.clone())?;
            let follow_up = match follow_up {
                Some(raw) => {
                    let previous = SessionId::parse(&raw).with_context(|| format!("'{raw}' is not a session id"))?;
                    let context = FollowUpContextLoader::new(store).load(previous).await;
                    if context.is_none() {
                        tracing::warn!(previous = %previous, "no usable answer for the previous run; starting fresh");
                    }
                    context
                }
                None => None,
            };
            let exit = orchestrator.run(&question.join(" "), &definition, follow_up).await;
            Ok(report(exit))
        }
        Command::Resume { response } => {
            let orchestrator = orchestrator(&config, &base, store)?;
            let exit = orchestrator.resume(&response.join(" "), &definition).await;
            Ok(report(exit))
        }
        Command::Status => status(&config, store.as_ref(), &definition).await,
    }
}

fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn orchestrator(config: &Config, base: &Path, store: Arc<dyn StateStore>) -> Result<PipelineOrchestrator> {
    let api_key = std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is not set")?;
    let mut llm_config = AnthropicConfig::new(api_key, &config.model.name);
    if let Some(url) = &config.model.base_url {
        llm_config.base_url = url.clone();
    }
    llm_config.timeout = std::time::Duration::from_secs(config.model.timeout_secs);
    llm_config.backoff = config.model.retry;
    let llm = Arc::new(AnthropicProvider::new(llm_config)?);

    let estimator = TokenBudgetEstimator::new(
        TokenCount::new(config.model.context_window),
        TokenCount::new(config.model.max_output_tokens),
    );
    let executor = StageExecutor::research(llm, estimator, &config.tools.research);
    let connector = Arc::new(ExtensionConnector::new(config.tools.timeouts));
    let tools = ToolLifecycleManager::from_config(connector, &config.tools.server, base)?;

    let settings = OrchestratorSettings {
        agent: config.agent()?,
        pricing: config.pricing(),
        budget: config.budget(),
    };
    Ok(PipelineOrchestrator::new(executor, tools, store, settings))
}

fn report(exit: RunExit) -> ExitCode {
    match exit {
        RunExit::Paused { session, message, .. } => {
            println!("{}", message.to_markdown());
            tracing::info!(session = %session, "waiting for `stagewright resume`");
            ExitCode::SUCCESS
        }
        RunExit::Completed {
            session,
            document,
            total_cost,
            ..
        } => {
            println!("{document}");
            eprintln!("session {session} completed (cost ${:.4})", total_cost.as_f64());
            ExitCode::SUCCESS
        }
        RunExit::Failed { reason, diagnostic, .. } => {
            eprintln!("run failed ({reason}): {diagnostic}");
            ExitCode::FAILURE
        }
    }
}

async fn status(config: &Config, store: &dyn StateStore, definition: &PipelineDefinition) -> Result<ExitCode> {
    let agent = config.agent()?;
    let Some(session) = store.active_session(&agent).await? else {
        println!("agent '{agent}' has no active run");
        return Ok(ExitCode::SUCCESS);
    };
    let Some(state) = store.load(session).await? else {
        bail!("active run {session} has no saved state");
    };
    let stage = |id| {
        definition
            .stage(id)
            .map_or_else(|| id.to_string(), |s| format!("{} ({})", s.name, s.id))
    };
    println!("session:  {session}");
    println!("question: {}", state.question());
    match (state.paused_stage(), state.current_stage()) {
        (Some(paused), _) => println!("state:    paused after {}", stage(paused)),
        (None, Some(next)) => println!("state:    interrupted before {}", stage(next)),
        (None, None) => println!("state:    complete"),
    }
    println!("cost:     ${:.4}", state.total_cost().as_f64());
    Ok(ExitCode::SUCCESS)
}
