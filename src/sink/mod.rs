//! Completed flows and the collaborators that receive them.
//!
//! The pipeline hands every finalized TCP flow to a [`FlowSink`] and asks an
//! [`IngestLedger`] whether a capture file was already processed. Both are
//! async traits so storage backends can do I/O without blocking the packet
//! loop; [`store::JsonlStore`] is the bundled implementation.

pub mod store;

use std::fmt;
use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One side of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }
}

/// Why a flow was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Both sides sent FIN and all data up to the FINs was seen.
    Fin,
    /// Either side sent RST.
    Reset,
    /// No packets for longer than the flush-after duration.
    Idle,
    /// Still open when its capture session ended.
    Flushed,
}

/// Contiguous payload sent in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowItem {
    pub direction: Direction,
    /// Capture time of the first segment contributing to this item.
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

/// A finalized, ordered TCP conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedFlow {
    /// Capture file path or live endpoint the flow came from.
    pub source_id: String,
    pub client: Endpoint,
    pub server: Endpoint,
    pub start_us: u64,
    pub end_us: u64,
    pub packets: u64,
    /// Payload bytes across both directions.
    pub bytes: u64,
    pub items: Vec<FlowItem>,
    pub close_reason: CloseReason,
    /// Segments that did not fit the TCP connection sequence.
    pub fsm_violations: u32,
}

impl CompletedFlow {
    /// All payload sent in `direction`, concatenated.
    pub fn payload(&self, direction: Direction) -> Vec<u8> {
        self.items
            .iter()
            .filter(|item| item.direction == direction)
            .flat_map(|item| item.data.iter().copied())
            .collect()
    }

    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }
}

/// Receives completed flows. Called concurrently from the finalizer pool.
#[async_trait]
pub trait FlowSink: Send + Sync {
    async fn accept(&self, flow: CompletedFlow) -> Result<()>;
}

/// Remembers which capture files were fully processed.
#[async_trait]
pub trait IngestLedger: Send + Sync {
    async fn already_ingested(&self, source_id: &str) -> Result<bool>;
    async fn record_ingested(&self, source_id: &str) -> Result<()>;
}
