//! flowtap: capture-to-flow pipeline.
//!
//! Reads pcap/pcapng captures from files, a watched directory or a live
//! forwarded capture stream, reassembles fragmented IPv4 datagrams and
//! rebuilds ordered, de-duplicated TCP byte streams ("flows") which are
//! handed to a [`sink::FlowSink`].
//!
//! ## Pipeline
//!
//! ```text
//! CaptureReader (pcap / pcapng / live stream, optional filter)
//!   → decode (link → IPv4/IPv6 → TCP)
//!   → Ipv4Defragmenter
//!   → Assembler (flow multiplexing, ordering, close detection)
//!       ↺ FlushScheduler (idle flush, once per packet)
//!   → FinalizerPool (bounded background emission)
//!   → FlowSink
//! ```
//!
//! A [`shutdown::Shutdown`] token is observed once per packet; on interrupt
//! the session stops reading, flushes every open flow and drains the
//! finalizer pool before returning.

pub mod capture;
pub mod config;
pub mod decode;
pub mod defrag;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod reassembly;
pub mod scheduler;
pub mod shutdown;
pub mod sink;

pub use config::{PipelineConfig, ReassemblyMode};
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunSummary, SessionOutcome, SessionReport};
pub use shutdown::Shutdown;
pub use sink::{CompletedFlow, FlowSink, IngestLedger};
