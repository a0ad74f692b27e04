//! Capture-to-flow orchestration.
//!
//! A [`Pipeline`] owns the shared configuration and collaborators and runs
//! one capture session per source: capture files (checked against the
//! ingest ledger), a directory watched for new files, or a live stream.
//! Sessions run one at a time, each on a blocking thread.

mod session;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::runtime::Handle;

use crate::capture::filter::PacketFilter;
use crate::capture::{live, CaptureReader};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::scheduler::FinalizerPool;
use crate::shutdown::Shutdown;
use crate::sink::{FlowSink, IngestLedger};

use session::CaptureSession;

/// How a capture session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The source was read to its end.
    Completed,
    /// The source ended mid-block or failed mid-stream; what was read is kept.
    Truncated,
    /// Shutdown was requested before the source ended.
    Interrupted,
    /// The ledger already lists the source.
    Skipped,
}

/// Result of one capture session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub source_id: String,
    pub outcome: SessionOutcome,
    pub packets: u64,
    pub bytes: u64,
    pub tcp_segments: u64,
    pub rejected_segments: u64,
    pub flows_emitted: u64,
    pub flows_failed: u64,
}

impl SessionReport {
    fn skipped(source_id: String) -> Self {
        Self {
            source_id,
            outcome: SessionOutcome::Skipped,
            packets: 0,
            bytes: 0,
            tcp_segments: 0,
            rejected_segments: 0,
            flows_emitted: 0,
            flows_failed: 0,
        }
    }

    /// Whether the source counts as ingested.
    pub fn is_ingested(&self) -> bool {
        matches!(self.outcome, SessionOutcome::Completed | SessionOutcome::Truncated)
    }
}

/// Totals across every session of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sources_ingested: u64,
    pub sources_skipped: u64,
    pub sources_failed: u64,
    pub sources_interrupted: u64,
    pub packets: u64,
    pub flows_emitted: u64,
    pub flows_failed: u64,
}

impl RunSummary {
    pub fn record(&mut self, report: &SessionReport) {
        match report.outcome {
            SessionOutcome::Completed | SessionOutcome::Truncated => self.sources_ingested += 1,
            SessionOutcome::Interrupted => self.sources_interrupted += 1,
            SessionOutcome::Skipped => self.sources_skipped += 1,
        }
        self.packets += report.packets;
        self.flows_emitted += report.flows_emitted;
        self.flows_failed += report.flows_failed;
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.sources_ingested += other.sources_ingested;
        self.sources_skipped += other.sources_skipped;
        self.sources_failed += other.sources_failed;
        self.sources_interrupted += other.sources_interrupted;
        self.packets += other.packets;
        self.flows_emitted += other.flows_emitted;
        self.flows_failed += other.flows_failed;
    }
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    sink: Arc<dyn FlowSink>,
    ledger: Arc<dyn IngestLedger>,
    shutdown: Shutdown,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        sink: Arc<dyn FlowSink>,
        ledger: Arc<dyn IngestLedger>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            ledger,
            shutdown,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    fn compile_filter(&self) -> Result<Option<PacketFilter>> {
        self.config.filter.as_deref().map(PacketFilter::parse).transpose()
    }

    /// Ingest one capture file unless the ledger already lists it. The file
    /// is recorded in the ledger only when read to its end.
    pub async fn ingest_file(&self, path: &Path) -> Result<SessionReport> {
        let source_id = path.display().to_string();
        let seen = self
            .ledger
            .already_ingested(&source_id)
            .await
            .map_err(PipelineError::Sink)?;
        if seen {
            tracing::info!(file = %source_id, "Skipping already ingested capture");
            return Ok(SessionReport::skipped(source_id));
        }

        let filter = self.compile_filter()?;
        let owned = path.to_path_buf();
        let buffer = self.config.read_buffer;
        tracing::info!(file = %source_id, "Processing capture file");
        let started = Instant::now();
        let report = self
            .run_session(source_id.clone(), filter, move || {
                CaptureReader::open_file(&owned, buffer)
            })
            .await?;

        if report.is_ingested() {
            self.ledger
                .record_ingested(&source_id)
                .await
                .map_err(PipelineError::Sink)?;
        }
        tracing::info!(
            file = %source_id,
            outcome = ?report.outcome,
            packets = report.packets,
            flows = report.flows_emitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed capture file"
        );
        Ok(report)
    }

    /// Ingest files in order. Unreadable files are logged and skipped;
    /// fatal errors stop the run. Stops early on shutdown.
    pub async fn ingest_files(&self, paths: &[PathBuf]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for path in paths {
            if self.shutdown.is_triggered() {
                break;
            }
            self.ingest_into(path, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn ingest_into(&self, path: &Path, summary: &mut RunSummary) -> Result<()> {
        match self.ingest_file(path).await {
            Ok(report) => {
                summary.record(&report);
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping capture");
                summary.sources_failed += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read a live capture stream from `endpoint` (`host:port`) until it
    /// closes or shutdown is requested. Live sources bypass the ledger.
    pub async fn ingest_live(&self, endpoint: &str) -> Result<SessionReport> {
        let filter = self.compile_filter()?;
        let poll = self.config.live_poll_interval;
        let buffer = self.config.read_buffer;
        let shutdown = self.shutdown.clone();
        let target = endpoint.to_string();
        let report = self
            .run_session(endpoint.to_string(), filter, move || {
                let stream = live::connect(&target, poll, shutdown)?;
                CaptureReader::from_reader(target.as_str(), stream, buffer)
            })
            .await?;
        tracing::info!(
            endpoint,
            outcome = ?report.outcome,
            packets = report.packets,
            flows = report.flows_emitted,
            "Live capture ended"
        );
        Ok(report)
    }

    /// Ingest the capture files already in `dir` (by file name), then every
    /// capture file that appears until shutdown.
    #[cfg(feature = "dir-watch")]
    pub async fn watch_directory(&self, dir: &Path) -> Result<RunSummary> {
        use crate::capture::watch::{existing_captures, DirectoryWatcher};

        let meta = tokio::fs::metadata(dir).await.map_err(|e| PipelineError::WatchDirectory {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(PipelineError::WatchDirectory {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let mut summary = RunSummary::default();
        // Subscribe before scanning so files arriving mid-scan are not lost.
        let mut watcher = DirectoryWatcher::new(dir)?;
        for path in existing_captures(dir)? {
            if self.shutdown.is_triggered() {
                return Ok(summary);
            }
            self.ingest_into(&path, &mut summary).await?;
        }

        let settle = self.config.settle.delay;
        loop {
            let path = tokio::select! {
                _ = self.shutdown.triggered() => break,
                next = watcher.next() => match next {
                    Some(path) => path,
                    None => break,
                },
            };
            tracing::info!(file = %path.display(), "New capture file detected");
            tokio::select! {
                _ = self.shutdown.triggered() => break,
                _ = tokio::time::sleep(settle) => {}
            }
            watcher.coalesce(&path);
            self.ingest_into(&path, &mut summary).await?;
        }
        tracing::info!(dir = %dir.display(), "Stopped watching directory");
        Ok(summary)
    }

    async fn run_session<F>(&self, source_id: String, filter: Option<PacketFilter>, open: F) -> Result<SessionReport>
    where
        F: FnOnce() -> Result<CaptureReader> + Send + 'static,
    {
        let config = self.config.clone();
        let pool = FinalizerPool::new(self.sink.clone(), config.finalizer_workers, Handle::current());
        let shutdown = self.shutdown.clone();

        tokio::task::spawn_blocking(move || {
            let reader = open()?.with_filter(filter);
            CaptureSession::new(source_id, &config, pool, shutdown).run(reader)
        })
        .await
        .map_err(|e| PipelineError::Invariant(format!("capture session task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(outcome: SessionOutcome) -> SessionReport {
        SessionReport {
            outcome,
            packets: 10,
            flows_emitted: 2,
            ..SessionReport::skipped("x".into())
        }
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(&report(SessionOutcome::Completed));
        summary.record(&report(SessionOutcome::Truncated));
        summary.record(&report(SessionOutcome::Interrupted));
        assert_eq!(summary.sources_ingested, 2);
        assert_eq!(summary.sources_interrupted, 1);
        assert_eq!(summary.packets, 30);
        assert_eq!(summary.flows_emitted, 6);

        let mut total = RunSummary::default();
        total.merge(&summary);
        total.merge(&summary);
        assert_eq!(total.sources_ingested, 4);
    }

    #[test]
    fn test_only_finished_sessions_are_ingested() {
        assert!(report(SessionOutcome::Completed).is_ingested());
        assert!(report(SessionOutcome::Truncated).is_ingested());
        assert!(!report(SessionOutcome::Interrupted).is_ingested());
        assert!(!report(SessionOutcome::Skipped).is_ingested());
    }
}
