//! Command-line batch runner: removes the background of every image in a
//! directory through the remote service, within the free-usage allowance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use bgremove_batch::export::{self, ExportFormat};
use bgremove_batch::{
    BatchEvent, BatchOrchestrator, ClientConfig, OrchestratorConfig, ProcessingConfig,
    ProcessingMode, QuotaLedger, RemoteClient, SourceImage,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremove-batch")]
struct Cli {
    /// Directory containing the images to process
    #[arg(value_name = "INPUT_DIR")]
    input: PathBuf,

    /// Directory for the results
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = "output")]
    output: PathBuf,

    /// Model tag (bria, clothing, standard, fast)
    #[arg(short, long, default_value = "bria")]
    model: String,

    /// Processing mode (ai, resize, both, crop-head, crop-head-ai, all)
    #[arg(long, default_value = "ai", value_parser = parse_mode)]
    mode: ProcessingMode,

    /// Target output size, e.g. 800x600
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    size: Option<(u32, u32)>,

    /// Write results as JPEG on a white background instead of transparent PNG
    #[arg(long)]
    jpg: bool,

    /// File that keeps the free-usage count between runs
    #[arg(long, value_name = "PATH")]
    usage_file: Option<PathBuf>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageState {
    process_count: u32,
}

fn parse_mode(s: &str) -> std::result::Result<ProcessingMode, String> {
    s.parse::<ProcessingMode>().map_err(|e| e.to_string())
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("bad width: {}", e))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("bad height: {}", e))?;
    if w == 0 || h == 0 {
        return Err("width and height must be positive".into());
    }
    Ok((w, h))
}

fn init_tracing(verbose: u8) -> Result<()> {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

async fn load_usage(path: &Path) -> Result<u32> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let state: UsageState = serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid usage file {}", path.display()))?;
            Ok(state.process_count)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e).with_context(|| format!("Cannot read {}", path.display())),
    }
}

async fn save_usage(path: &Path, process_count: u32) -> Result<()> {
    let json = serde_json::to_vec_pretty(&UsageState { process_count })?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Cannot write {}", path.display()))
}

async fn read_sources(dir: &Path) -> Result<Vec<SourceImage>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Cannot read input directory {}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut sources = Vec::with_capacity(paths.len());
    for path in paths {
        sources.push(SourceImage::from_path(&path).await?);
    }
    Ok(sources)
}

fn log_event(event: &BatchEvent) {
    match event {
        BatchEvent::BatchStarted { total } => tracing::info!("Processing {} image(s)", total),
        BatchEvent::JobCompleted {
            job_id,
            duration_ms,
        } => tracing::info!("Done {} in {} ms", job_id, duration_ms),
        BatchEvent::JobFailed { job_id, error } => tracing::warn!("Failed {}: {}", job_id, error),
        BatchEvent::JobCancelled { job_id } => tracing::info!("Cancelled {}", job_id),
        BatchEvent::LimitReached { .. } => {
            tracing::warn!("Free usage limit reached; sign in to process more images")
        }
        other => tracing::debug!(?other, "event"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let client_config = ClientConfig::from_env()?;
    let orchestrator_config = OrchestratorConfig::from_env()?;

    let initial_count = match &cli.usage_file {
        Some(path) => load_usage(path).await?,
        None => 0,
    };
    let ledger = Arc::new(
        QuotaLedger::new(orchestrator_config.max_free_images).with_count(initial_count),
    );

    let client =
        RemoteClient::new(client_config)?.with_cache_capacity(orchestrator_config.cache_capacity);
    if !client.health().await.unwrap_or(false) {
        tracing::warn!("Service at {} did not pass its health check", client.base_url());
    }

    let orchestrator = Arc::new(BatchOrchestrator::new(client, orchestrator_config).with_ledger(ledger));

    let sources = read_sources(&cli.input).await?;
    let ids = orchestrator
        .store()
        .add_sources(sources, &cli.model, Some(cli.mode))?;
    if ids.is_empty() {
        tracing::info!("No images found in {}", cli.input.display());
        return Ok(());
    }

    let token = orchestrator.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current image");
            token.cancel();
        }
    });

    let mut config = ProcessingConfig::new(cli.mode).with_tool("cli");
    if let Some((w, h)) = cli.size {
        config = config.with_target(w, h);
    }

    let report = orchestrator.submit_with_events(&config, log_event).await?;

    if let Some(path) = &cli.usage_file {
        save_usage(path, orchestrator.ledger().process_count()).await?;
    }

    let format = if cli.jpg {
        ExportFormat::Jpeg
    } else {
        ExportFormat::Original
    };
    let written = export::export_completed(
        &orchestrator.store().completed(),
        &cli.output,
        format,
        config.target,
    )
    .await?;

    println!(
        "{:?}: {} completed, {} failed, {} written to {}",
        report.outcome,
        report.completed,
        report.failed,
        written.len(),
        cli.output.display()
    );
    if report.limit_reached {
        println!(
            "Free usage limit reached ({} allowed).",
            orchestrator.ledger().max_free_images()
        );
    }
    Ok(())
}
