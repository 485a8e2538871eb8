//! bulwark-replay: reduces a JSON-lines event log to the latest event per
//! entity, starting from stored checkpoints.
//!
//! Each input line is an object with `entity_id` (or `id`), `sequence` (or
//! `seq`) and a `payload`. The report goes to stdout, logs go to
//! stderr.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bulwark_core::CheckpointManager;
use bulwark_runtime::replay::read_event_lines;
use bulwark_runtime::{
    init_tracing, ReplayReport, ReplayWorker, ResilienceConfig, SharedCheckpoints,
};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bulwark replay CLI
#[derive(Parser)]
#[command(name = "bulwark-replay")]
#[command(about = "Replay an event log on top of stored checkpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Event log with one JSON event per line; reads stdin when omitted
    input: Option<PathBuf>,

    /// Runtime configuration file (JSON)
    #[arg(short, long, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Events per window; overrides the configured replay window
    #[arg(short, long)]
    window: Option<usize>,

    /// Checkpoint file to start from
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    /// Write the merged checkpoints back to the checkpoint file
    #[arg(long, requires = "checkpoints")]
    save: bool,

    /// Enable JSON logging
    #[arg(long, env = "BULWARK_LOG_JSON")]
    log_json: bool,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
struct Output {
    #[serde(flatten)]
    report: ReplayReport<serde_json::Value>,
    checkpoints: BTreeMap<String, u64>,
}

fn load_checkpoints(cli: &Cli, config: &ResilienceConfig) -> anyhow::Result<CheckpointManager> {
    match &cli.checkpoints {
        Some(path) if path.exists() => {
            let file = File::open(path)
                .with_context(|| format!("opening checkpoints {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing checkpoints {}", path.display()))
        }
        _ => Ok(CheckpointManager::with_config(config.checkpoint)?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let config = match &cli.config {
        Some(path) => ResilienceConfig::from_path(path)?,
        None => ResilienceConfig::default(),
    };
    let window = cli.window.unwrap_or(config.replay_window);

    let events = match &cli.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("opening {}", path.display()))?;
            read_event_lines(BufReader::new(file))?
        }
        None => read_event_lines(io::stdin().lock())?,
    };
    info!(events = events.len(), window, "replay starting");

    let checkpoints = Arc::new(SharedCheckpoints::new(load_checkpoints(&cli, &config)?));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling replay");
            on_interrupt.cancel();
        }
    });

    let report = ReplayWorker::new(Arc::clone(&checkpoints))
        .run(events, window, cancel)
        .await?;
    info!(
        winners = report.winners.len(),
        windows = report.windows,
        skipped_stale = report.skipped_stale,
        "replay finished"
    );

    if cli.save {
        if let Some(path) = &cli.checkpoints {
            let json = serde_json::to_vec_pretty(&checkpoints.snapshot())?;
            std::fs::write(path, json)
                .with_context(|| format!("writing checkpoints {}", path.display()))?;
        }
    }

    let output = Output {
        report,
        checkpoints: checkpoints.streams(),
    };
    let mut stdout = io::stdout().lock();
    if cli.pretty {
        serde_json::to_writer_pretty(&mut stdout, &output)?;
    } else {
        serde_json::to_writer(&mut stdout, &output)?;
    }
    writeln!(stdout)?;
    Ok(())
}
