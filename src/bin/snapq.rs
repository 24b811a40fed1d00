//! snapq CLI: run the capture daemon and inspect its work items.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand};
use snapq::collab::{CommandCapture, FsArtifactCleaner, HttpDelivery};
use snapq::config::Config;
use snapq::engine::{Collaborators, Pipeline, PipelineConfig, Sweeper, TriggerOutcome};
use snapq::model::work::{State, WorkId};
use snapq::store::Store;
use snapq::telemetry::{TelemetryConfig, init_telemetry};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "snapq",
    about = "Capture screenshots on demand and deliver them for analysis"
)]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon. Each stdin line (or SIGUSR1) is a trigger.
    Serve,
    /// Work item operations
    Items {
        #[command(subcommand)]
        action: ItemsAction,
    },
    /// Run one cleanup pass and exit
    Sweep,
}

#[derive(Subcommand)]
enum ItemsAction {
    /// List work items, oldest first
    List {
        /// Filter by state (pending, in_flight, done, failed_retryable, failed_terminal)
        #[arg(long)]
        state: Option<State>,
    },
    /// Show one work item
    Show {
        id: WorkId,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Item counts per state
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Items { action } => {
            let store = Store::open(&config.db_path).await?;
            let result = match action {
                ItemsAction::List { state } => cmd_items_list(&store, state).await,
                ItemsAction::Show { id, json } => cmd_items_show(&store, id, json).await,
                ItemsAction::Stats { json } => cmd_items_stats(&store, json).await,
            };
            store.close().await;
            result
        }
        Command::Sweep => cmd_sweep(&config).await,
    }
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "snapq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let capture_command = config
        .capture_command
        .clone()
        .context("SNAPQ_CAPTURE_COMMAND is required for serve")?;
    let endpoint = config
        .endpoint
        .clone()
        .context("SNAPQ_ENDPOINT is required for serve")?;

    let store = Arc::new(Store::open(&config.db_path).await?);
    let collab = Collaborators {
        capture: Arc::new(
            CommandCapture::new(capture_command, &config.artifact_dir)
                .with_timeout(config.capture_timeout()),
        ),
        deliver: Arc::new(HttpDelivery::new(
            endpoint,
            config.api_key.clone(),
            config.delivery_timeout(),
        )?),
        cleaner: Arc::new(FsArtifactCleaner),
    };
    let pipeline =
        Pipeline::start(Arc::clone(&store), collab, PipelineConfig::from(&config)).await?;

    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());
    let mut user_signal = UserSignal::new()?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(db = %config.db_path.display(), "snapq ready, waiting for triggers");
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received, shutting down");
                break;
            }
            line = next_line(&mut stdin) => match line {
                Some(_) => fire(&pipeline).await,
                None => {
                    info!("stdin closed; still listening for signals");
                    stdin = None;
                }
            },
            _ = user_signal.recv() => fire(&pipeline).await,
        }
    }

    pipeline.shutdown().await;
    store.close().await;
    Ok(())
}

async fn fire(pipeline: &Pipeline) {
    match pipeline.on_trigger(Instant::now()).await {
        TriggerOutcome::Admitted(item) => info!(id = %item.id, "capture queued"),
        TriggerOutcome::Debounced | TriggerOutcome::Stopped => {}
        TriggerOutcome::CaptureFailed(_) | TriggerOutcome::Failed(_) => {
            warn!("trigger produced no work item")
        }
    }
}

/// Next stdin line, or pending forever once stdin is gone.
async fn next_line(lines: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// SIGUSR1 on Unix, so a hotkey daemon can trigger with `kill -USR1`.
struct UserSignal {
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl UserSignal {
    fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                inner: signal(SignalKind::user_defined1())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.inner.recv().await.is_some() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

async fn cmd_items_list(store: &Store, state: Option<State>) -> anyhow::Result<()> {
    let states: Vec<State> = match state {
        Some(s) => vec![s],
        None => State::ALL.to_vec(),
    };
    let items = store.list(&states).await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<16}  {:<4}  {:<16}  ARTIFACT",
        "ID", "STATE", "TRY", "CREATED"
    );
    println!("{}", "-".repeat(90));
    for item in &items {
        println!(
            "{:<6}  {:<16}  {:<4}  {:<16}  {}",
            item.id,
            item.state,
            item.attempt_count,
            item.created_at.format("%Y-%m-%d %H:%M"),
            file_name(item.artifact_ref.as_path()),
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_items_show(store: &Store, id: WorkId, json: bool) -> anyhow::Result<()> {
    let item = store.get(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!("ID:         {}", item.id);
    println!("State:      {}", item.state);
    println!("Artifact:   {}", item.artifact_ref);
    println!("Attempts:   {}", item.attempt_count);
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    if let Some(ref err) = item.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref result) = item.result {
        println!("---");
        println!("{result}");
    }
    Ok(())
}

async fn cmd_items_stats(store: &Store, json: bool) -> anyhow::Result<()> {
    let counts = store.counts_by_state().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }
    for state in State::ALL {
        println!("{:<16}  {}", state.as_str(), counts.get(state));
    }
    Ok(())
}

async fn cmd_sweep(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&config.db_path).await?);
    let sweeper = Sweeper::new(
        Arc::clone(&store),
        Arc::new(FsArtifactCleaner),
        config.grace_period(),
    );
    let report = sweeper.sweep_once(Utc::now()).await?;
    store.close().await;

    println!("removed: {}  failed: {}", report.removed, report.failed);
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
