//! File-backed flow store.
//!
//! Completed flows are appended as JSON lines to `flows.jsonl`; ingested
//! capture ids are appended to `ingested.txt` and loaded into memory on
//! open.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CompletedFlow, FlowSink, IngestLedger};

pub const FLOWS_FILE: &str = "flows.jsonl";
pub const LEDGER_FILE: &str = "ingested.txt";

pub struct JsonlStore {
    flows: Mutex<File>,
    ledger: Mutex<LedgerState>,
}

struct LedgerState {
    file: File,
    ingested: HashSet<String>,
}

async fn append_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}

impl JsonlStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create storage directory {}", dir.display()))?;

        let ledger_path = dir.join(LEDGER_FILE);
        let ingested: HashSet<String> = match tokio::fs::read_to_string(&ledger_path).await {
            Ok(text) => text
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", ledger_path.display()))
            }
        };

        let flows = append_file(&dir.join(FLOWS_FILE)).await?;
        let file = append_file(&ledger_path).await?;
        tracing::info!(
            dir = %dir.display(),
            ingested = ingested.len(),
            "Opened flow store"
        );

        Ok(Self {
            flows: Mutex::new(flows),
            ledger: Mutex::new(LedgerState { file, ingested }),
        })
    }
}

#[async_trait]
impl FlowSink for JsonlStore {
    async fn accept(&self, flow: CompletedFlow) -> Result<()> {
        let mut line = serde_json::to_vec(&flow).context("Failed to serialize flow")?;
        line.push(b'\n');
        let mut file = self.flows.lock().await;
        file.write_all(&line).await.context("Failed to append flow")?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl IngestLedger for JsonlStore {
    async fn already_ingested(&self, source_id: &str) -> Result<bool> {
        Ok(self.ledger.lock().await.ingested.contains(source_id))
    }

    async fn record_ingested(&self, source_id: &str) -> Result<()> {
        let mut ledger = self.ledger.lock().await;
        if !ledger.ingested.insert(source_id.to_string()) {
            return Ok(());
        }
        ledger
            .file
            .write_all(format!("{}\n", source_id).as_bytes())
            .await
            .context("Failed to append to ingest ledger")?;
        ledger.file.flush().await?;
        Ok(())
    }
}
