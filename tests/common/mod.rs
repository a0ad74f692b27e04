#![allow(dead_code)]
//! In-memory collaborators for flowtap integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use flowtap::{CompletedFlow, FlowSink, IngestLedger, Pipeline, PipelineConfig, Shutdown};

/// Flow sink and ingest ledger backed by vectors.
#[derive(Default)]
pub struct MemoryStore {
    flows: Mutex<Vec<CompletedFlow>>,
    ingested: Mutex<Vec<String>>,
    reject_flows: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flows(&self) -> Vec<CompletedFlow> {
        self.flows.lock().unwrap().clone()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().unwrap().len()
    }

    /// Ingested source ids in the order they were recorded.
    pub fn ingested(&self) -> Vec<String> {
        self.ingested.lock().unwrap().clone()
    }

    pub fn reject_flows(&self, reject: bool) {
        self.reject_flows.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlowSink for MemoryStore {
    async fn accept(&self, flow: CompletedFlow) -> Result<()> {
        if self.reject_flows.load(Ordering::SeqCst) {
            bail!("sink offline");
        }
        self.flows.lock().unwrap().push(flow);
        Ok(())
    }
}

#[async_trait]
impl IngestLedger for MemoryStore {
    async fn already_ingested(&self, source_id: &str) -> Result<bool> {
        Ok(self.ingested.lock().unwrap().iter().any(|s| s == source_id))
    }

    async fn record_ingested(&self, source_id: &str) -> Result<()> {
        self.ingested.lock().unwrap().push(source_id.to_string());
        Ok(())
    }
}

pub fn pipeline(config: PipelineConfig, store: &Arc<MemoryStore>) -> Pipeline {
    pipeline_with_shutdown(config, store, Shutdown::new())
}

pub fn pipeline_with_shutdown(config: PipelineConfig, store: &Arc<MemoryStore>, shutdown: Shutdown) -> Pipeline {
    Pipeline::new(config, store.clone(), store.clone(), shutdown)
}
