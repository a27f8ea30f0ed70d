//! Command-line front end for the deliberation engine.
//!
//! ```bash
//! # Deliberate on a problem; checkpoints land in ./sessions
//! deliberation run --problem "Should we move billing to event sourcing?" \
//!     --constraint "no downtime" --checkpoint-dir ./sessions
//!
//! # Answer clarification questions of a paused session
//! deliberation answer --session <id> --answer "Which region?=EU only"
//!
//! # Continue an interrupted session, or print where it stands
//! deliberation resume --session <id>
//! deliberation show --session <id>
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use deliberation::checkpoint::FileCheckpointStore;
use deliberation::config::SchedulingMode;
use deliberation::inference::{OpenAiCompatibleProvider, SharedInference};
use deliberation::{
    Criticality, DeliberationEngine, EngineConfig, EventFilter, Problem, SessionState,
    SessionStatus,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; `DELIBERATION_*` variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for session checkpoints
    #[arg(long, global = true, default_value = "./sessions")]
    checkpoint_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new session and wait for it to come to rest
    Run {
        #[arg(long)]
        problem: String,

        #[arg(long, default_value = "")]
        context: String,

        /// May be repeated
        #[arg(long = "constraint")]
        constraints: Vec<String>,

        /// Use the higher readiness target
        #[arg(long, default_value_t = false)]
        high_criticality: bool,

        /// Let dependents start before their prerequisites finish
        #[arg(long, default_value_t = false)]
        speculative: bool,
    },

    /// Answer the clarification questions of a paused session
    Answer {
        #[arg(long)]
        session: String,

        /// `question=answer`; may be repeated
        #[arg(long = "answer", value_parser = parse_answer)]
        answers: Vec<(String, String)>,
    },

    /// Continue a suspended or interrupted session
    Resume {
        #[arg(long)]
        session: String,
    },

    /// Print the stored state of a session
    Show {
        #[arg(long)]
        session: String,
    },
}

fn parse_answer(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((q, a)) if !q.trim().is_empty() => Ok((q.trim().to_string(), a.trim().to_string())),
        _ => Err(format!("expected question=answer, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deliberation=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::load(args.config.as_deref()).context("loading config")?;
    if let Command::Run {
        speculative: true, ..
    } = &args.command
    {
        config.scheduler.mode = SchedulingMode::Speculative;
    }

    let provider: SharedInference = Arc::new(
        OpenAiCompatibleProvider::new(&config.inference).context("building inference client")?,
    );
    info!(
        url = %config.inference.url,
        model = %config.inference.model,
        checkpoints = %args.checkpoint_dir.display(),
        "Engine configured"
    );
    let store = Arc::new(FileCheckpointStore::new(&args.checkpoint_dir));
    let engine = DeliberationEngine::new(config, vec![provider], store);
    spawn_progress_log(&engine);

    let state = match args.command {
        Command::Run {
            problem,
            context,
            constraints,
            high_criticality,
            ..
        } => {
            let criticality = if high_criticality {
                Criticality::High
            } else {
                Criticality::Standard
            };
            let id = engine
                .start_with(Problem::new(&problem, &context, constraints), criticality)
                .await?;
            info!(session_id = %id, "Session started");
            engine.wait(&id).await?
        }
        Command::Answer { session, answers } => {
            if answers.is_empty() {
                bail!("at least one --answer is required");
            }
            let answers: BTreeMap<String, String> = answers.into_iter().collect();
            engine.submit_clarification(&session, answers).await?;
            engine.wait(&session).await?
        }
        Command::Resume { session } => {
            engine.resume(&session).await?;
            engine.wait(&session).await?
        }
        Command::Show { session } => engine.get_state(&session).await?,
    };

    print_outcome(&state)
}

/// Mirror progress events into the log.
fn spawn_progress_log(engine: &DeliberationEngine) {
    let mut events = engine.subscribe();
    let filter = EventFilter::new();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if filter.matches(&event) => {
                    info!(
                        session_id = event.session_id(),
                        event = event.event_type(),
                        "Progress"
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Progress log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn print_outcome(state: &SessionState) -> Result<()> {
    eprintln!("{}", state.status_line());
    match state.status {
        SessionStatus::Completed => {
            let report = state
                .report
                .as_ref()
                .context("completed session has no report")?;
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        SessionStatus::PausedForClarification => {
            println!("Session {} needs answers:", state.id);
            for question in state
                .clarification
                .iter()
                .flat_map(|c| c.questions.iter())
            {
                println!("  - {}", question);
            }
            println!(
                "Reply with: deliberation answer --session {} --answer \"<question>=<answer>\"",
                state.id
            );
        }
        SessionStatus::Failed | SessionStatus::Killed => {
            if let Some(reason) = &state.failure {
                println!("Session {} ended: {}", state.id, reason);
            }
        }
        SessionStatus::Suspended => {
            println!(
                "Session {} is suspended (checkpoint store unavailable); retry with: deliberation resume --session {}",
                state.id, state.id
            );
        }
        _ => println!("{}", serde_json::to_string_pretty(state)?),
    }
    Ok(())
}
