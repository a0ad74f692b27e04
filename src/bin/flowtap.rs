use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use flowtap::config::{
    parse_flush_after, PipelineConfig, ReassemblyMode, StorageEndpoint, DEFAULT_FINALIZER_WORKERS,
    DEFAULT_STORAGE_ENDPOINT,
};
use flowtap::observability::init_tracing;
use flowtap::pipeline::{Pipeline, RunSummary};
use flowtap::shutdown::Shutdown;
use flowtap::sink::store::JsonlStore;

#[derive(Parser, Debug)]
#[command(name = "flowtap", version, about = "flowtap – reassemble TCP flows from packet captures")]
struct Cli {
    /// Capture files (pcap or pcapng) to ingest
    files: Vec<PathBuf>,

    /// Watch this directory and ingest capture files as they appear
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Where flows and the ingest ledger are stored
    #[arg(long, env = "FLOWTAP_STORAGE", default_value = DEFAULT_STORAGE_ENDPOINT)]
    storage: String,

    /// Read a live capture stream from host:port (ignores files and --dir)
    #[arg(long, env = "FLOWTAP_LIVE")]
    live: Option<String>,

    /// Packet filter expression, e.g. "tcp and port 80"
    #[arg(long, env = "FLOWTAP_FILTER")]
    filter: Option<String>,

    /// Assemble segments that violate the TCP connection sequence
    #[arg(long, default_value_t = false)]
    nonstrict: bool,

    /// Finalize flows idle for this long, e.g. "90s" or "5m"
    #[arg(long, env = "FLOWTAP_FLUSH_AFTER", default_value = "")]
    flush_after: String,

    /// Wait this long after a new file appears before reading it
    #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
    settle_delay: Duration,

    /// Concurrent flow deliveries to storage
    #[arg(long, default_value_t = DEFAULT_FINALIZER_WORKERS)]
    finalizer_workers: usize,

    /// Use JSON logs
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if cli.files.is_empty() && cli.dir.is_none() && cli.live.is_none() {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "at least one of FILES, --dir or --live is required",
            )
            .exit();
    }

    match run(cli).await {
        Ok(summary) => {
            tracing::info!(
                ingested = summary.sources_ingested,
                skipped = summary.sources_skipped,
                failed = summary.sources_failed,
                interrupted = summary.sources_interrupted,
                packets = summary.packets,
                flows = summary.flows_emitted,
                flows_failed = summary.flows_failed,
                "Run complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let flush_after = parse_flush_after(&cli.flush_after)?;
    let StorageEndpoint::Directory(storage_dir) = cli.storage.parse::<StorageEndpoint>()?;
    if cli.filter.is_none() {
        tracing::warn!("No packet filter set; every TCP flow will be reassembled");
    }
    let mode = if cli.nonstrict {
        ReassemblyMode::Relaxed
    } else {
        ReassemblyMode::Strict
    };

    let config = PipelineConfig::default()
        .with_mode(mode)
        .with_flush_after(flush_after)
        .with_filter(cli.filter)
        .with_settle_delay(cli.settle_delay)
        .with_finalizer_workers(cli.finalizer_workers);
    tracing::info!(
        ?mode,
        flush_after = ?config.flush_after,
        storage = %storage_dir.display(),
        workers = config.finalizer_workers,
        "Starting flowtap"
    );

    let store = Arc::new(JsonlStore::open(&storage_dir).await?);
    let shutdown = Shutdown::new();
    shutdown.listen_for_interrupt();
    let pipeline = Pipeline::new(config, store.clone(), store, shutdown);

    let mut summary = RunSummary::default();
    if let Some(endpoint) = cli.live {
        let report = pipeline.ingest_live(&endpoint).await?;
        summary.record(&report);
        return Ok(summary);
    }

    summary.merge(&pipeline.ingest_files(&cli.files).await?);
    if let Some(dir) = cli.dir {
        summary.merge(&watch(&pipeline, &dir).await?);
    }
    Ok(summary)
}

#[cfg(feature = "dir-watch")]
async fn watch(pipeline: &Pipeline, dir: &std::path::Path) -> Result<RunSummary> {
    Ok(pipeline.watch_directory(dir).await?)
}

#[cfg(not(feature = "dir-watch"))]
async fn watch(_pipeline: &Pipeline, _dir: &std::path::Path) -> Result<RunSummary> {
    anyhow::bail!("--dir requires flowtap built with the `dir-watch` feature")
}
