use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use termcore_dispatch::OutputOrdering;
use termcore_kernel::{Terminal, TerminalConfig};
use termcore_protocol::{ExportFormat, OutputEntry, OutputKind, SnapshotId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "termcored")]
#[command(about = "Terminal core demo daemon: one command per stdin line")]
struct Cli {
    /// Directory for file-backed snapshots. In-memory when omitted.
    #[arg(long)]
    root: Option<PathBuf>,
    /// JSON terminal config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    no_autosave: bool,
    #[arg(long)]
    strict_ordering: bool,
    /// Restore the newest snapshot on start.
    #[arg(long)]
    restore: bool,
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn load_config(cli: &Cli) -> Result<TerminalConfig> {
    let mut config = match &cli.config {
        Some(path) => TerminalConfig::from_file(path).await?,
        None => TerminalConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.storage_root = Some(root.clone());
    }
    if cli.no_autosave {
        config.autosave_enabled = false;
    }
    if cli.strict_ordering {
        config.output_ordering = OutputOrdering::Strict;
    }
    if cli.restore {
        config.restore_latest = true;
    }
    Ok(config)
}

fn print_entry(entry: &OutputEntry) {
    match entry.kind {
        OutputKind::Error => println!("error: {}", entry.message),
        OutputKind::Warn => println!("warn: {}", entry.message),
        _ => println!("{}", entry.message),
    }
}

/// Lines starting with `:` drive the daemon itself rather than the session.
/// Returns false when the loop should stop.
async fn run_meta(terminal: &Terminal, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    match parts.next().unwrap_or_default() {
        ":quit" | ":exit" => return Ok(false),
        ":save" => {
            let name = parts.collect::<Vec<_>>().join(" ");
            let name = (!name.is_empty()).then_some(name.as_str());
            let id = terminal.save(name).await?;
            println!("saved {id}");
        }
        ":snapshots" => {
            for summary in terminal.persistence().list() {
                println!(
                    "{}  {}  {} tabs  {} commands  {}",
                    summary.id,
                    summary.timestamp.to_rfc3339(),
                    summary.tab_count,
                    summary.command_count,
                    summary.name.unwrap_or_default()
                );
            }
        }
        ":restore" => {
            let id = parts.next().context("usage: :restore <snapshot-id>")?;
            terminal.restore(&SnapshotId::from_string(id)).await?;
            println!("restored {id}");
        }
        ":export" => {
            let id = parts.next().context("usage: :export <snapshot-id> [json|text]")?;
            let format: ExportFormat = parts.next().unwrap_or("json").parse()?;
            let rendered = terminal
                .persistence()
                .export(&SnapshotId::from_string(id), format)
                .await?;
            println!("{rendered}");
        }
        ":metrics" => println!("{}", serde_json::to_string_pretty(&terminal.metrics())?),
        other => println!("error: unknown daemon command {other}"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(&cli).await?;
    let terminal = Terminal::builder(config).build();
    terminal.init().await?;
    info!(
        storage = ?terminal.config().storage_root,
        ordering = ?terminal.config().output_ordering,
        "termcored ready"
    );

    let mut session_events = terminal.store().subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(notification) = session_events.recv().await {
            debug!(entity = ?notification.entity, event = %notification.event, "session event");
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed reading stdin")? {
        let line = line.trim();
        if line.starts_with(':') {
            match run_meta(&terminal, line).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(error) => {
                    println!("error: {error:#}");
                    continue;
                }
            }
        }
        for entry in terminal.execute(line).await.iter().skip(1) {
            print_entry(entry);
        }
    }

    terminal.dispose().await?;
    event_task.abort();
    if let Err(error) = event_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "event task stopped");
    }
    Ok(())
}
