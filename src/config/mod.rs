//! Immutable pipeline configuration.
//!
//! Built once at startup (see the `flowtap` binary) and shared read-only
//! with every capture session.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Default delay between a directory event and reading the new file.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Default number of concurrent flow emissions per session.
pub const DEFAULT_FINALIZER_WORKERS: usize = 4;

/// Default storage endpoint when neither flag nor environment sets one.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "file://./flowtap-data";

/// TCP reassembly strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReassemblyMode {
    /// Segments violating the TCP connection sequence are rejected.
    #[default]
    Strict,
    /// Violations are counted but every segment is assembled.
    Relaxed,
}

/// How long to wait after a filesystem event before reading the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlePolicy {
    pub delay: Duration,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Where completed flows and the ingest ledger are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEndpoint {
    /// Directory holding `flows.jsonl` and `ingested.txt`.
    Directory(PathBuf),
}

impl FromStr for StorageEndpoint {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = |reason: &str| PipelineError::InvalidStorageEndpoint {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = value
            .split_once("://")
            .ok_or_else(|| invalid("expected <scheme>://<location>"))?;
        match scheme {
            "file" if rest.is_empty() => Err(invalid("empty path")),
            "file" => Ok(StorageEndpoint::Directory(PathBuf::from(rest))),
            _ => Err(invalid("unsupported scheme, expected file://")),
        }
    }
}

/// Parse a human-readable flush-after duration ("90s", "3m", "2h 45m").
/// An empty string disables flushing.
pub fn parse_flush_after(value: &str) -> Result<Option<Duration>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let duration =
        humantime::parse_duration(trimmed).map_err(|e| PipelineError::InvalidFlushDuration {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if duration.is_zero() {
        return Err(PipelineError::InvalidFlushDuration {
            value: value.to_string(),
            reason: "duration must be positive".to_string(),
        });
    }
    Ok(Some(duration))
}

/// Configuration shared by every capture session.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: ReassemblyMode,
    /// Idle time after which a flow is force-finalized. `None` disables
    /// time-based flushing.
    pub flush_after: Option<Duration>,
    /// Packet filter expression applied at every source.
    pub filter: Option<String>,
    pub settle: SettlePolicy,
    /// Upper bound on concurrently running flow emissions.
    pub finalizer_workers: usize,
    /// Initial buffer size of the capture reader.
    pub read_buffer: usize,
    /// Socket read timeout used to poll for shutdown on live streams.
    pub live_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ReassemblyMode::Strict,
            flush_after: None,
            filter: None,
            settle: SettlePolicy::default(),
            finalizer_workers: DEFAULT_FINALIZER_WORKERS,
            read_buffer: 256 * 1024,
            live_poll_interval: Duration::from_millis(250),
        }
    }
}

impl PipelineConfig {
    pub fn with_mode(mut self, mode: ReassemblyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_flush_after(mut self, flush_after: Option<Duration>) -> Self {
        self.flush_after = flush_after;
        self
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.filter(|f| !f.trim().is_empty());
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle = SettlePolicy { delay };
        self
    }

    pub fn with_finalizer_workers(mut self, workers: usize) -> Self {
        self.finalizer_workers = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flush_after() {
        assert_eq!(parse_flush_after("").unwrap(), None);
        assert_eq!(
            parse_flush_after("90s").unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_flush_after("2h 45m").unwrap(),
            Some(Duration::from_secs(2 * 3600 + 45 * 60))
        );
    }

    #[test]
    fn test_parse_flush_after_rejects_garbage() {
        let err = parse_flush_after("soon").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidFlushDuration { .. }));
        assert!(err.is_fatal());
        assert!(parse_flush_after("0s").is_err());
    }

    #[test]
    fn test_storage_endpoint() {
        assert_eq!(
            "file://./data".parse::<StorageEndpoint>().unwrap(),
            StorageEndpoint::Directory(PathBuf::from("./data"))
        );
        assert!("mongo:27017".parse::<StorageEndpoint>().is_err());
        assert!("s3://bucket".parse::<StorageEndpoint>().is_err());
        assert!("file://".parse::<StorageEndpoint>().is_err());
    }

    #[test]
    fn test_builder_clamps_workers_and_blank_filter() {
        let config = PipelineConfig::default()
            .with_finalizer_workers(0)
            .with_filter(Some("  ".to_string()));
        assert_eq!(config.finalizer_workers, 1);
        assert!(config.filter.is_none());
    }
}
