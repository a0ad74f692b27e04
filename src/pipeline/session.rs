//! The per-source packet loop.
//!
//! Runs on a blocking thread. For every packet: advance the flush clock
//! (and flush idle flows), decode, defragment IPv4, hand TCP segments to
//! the assembler, then poll for shutdown.

use crate::capture::{CaptureReader, PacketRecord};
use crate::config::PipelineConfig;
use crate::decode::{DecodedPacket, Network, Transport};
use crate::defrag::{Defragmented, Ipv4Defragmenter};
use crate::error::{PipelineError, Result};
use crate::reassembly::{Assembler, FlushScheduler, SegmentContext};
use crate::scheduler::FinalizerPool;
use crate::shutdown::Shutdown;

use super::{SessionOutcome, SessionReport};

pub(crate) struct CaptureSession {
    source_id: String,
    assembler: Assembler<FinalizerPool>,
    defrag: Ipv4Defragmenter,
    flush: FlushScheduler,
    shutdown: Shutdown,
    packets: u64,
    bytes: u64,
}

impl CaptureSession {
    pub fn new(source_id: String, config: &PipelineConfig, pool: FinalizerPool, shutdown: Shutdown) -> Self {
        Self {
            assembler: Assembler::new(source_id.clone(), config.mode, pool),
            source_id,
            defrag: Ipv4Defragmenter::new(),
            flush: FlushScheduler::new(config.flush_after),
            shutdown,
            packets: 0,
            bytes: 0,
        }
    }

    /// Consume the reader to the end (or until shutdown), then finalize all
    /// open flows and wait for their delivery.
    pub fn run(mut self, mut reader: CaptureReader) -> Result<SessionReport> {
        let outcome = match self.read_all(&mut reader) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Let flows already handed off finish before bailing out.
                if let Err(drain_err) = self.assembler.emitter().drain() {
                    tracing::error!(error = %drain_err, "Cannot drain finalizer pool");
                }
                return Err(e);
            }
        };

        let flushed = self.assembler.flush_all()?;
        self.assembler.emitter().drain()?;

        let stats = self.assembler.stats();
        let pool = self.assembler.emitter().stats();
        tracing::debug!(
            source = %self.source_id,
            flushed,
            pending_fragments = self.defrag.pending(),
            filtered = reader.filtered(),
            "Session finished"
        );
        Ok(SessionReport {
            source_id: self.source_id,
            outcome,
            packets: self.packets,
            bytes: self.bytes,
            tcp_segments: stats.segments,
            rejected_segments: stats.rejected,
            flows_emitted: pool.succeeded,
            flows_failed: pool.failed,
        })
    }

    fn read_all(&mut self, reader: &mut CaptureReader) -> Result<SessionOutcome> {
        for item in reader.by_ref() {
            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(source = %self.source_id, error = %e, "Capture read failed; ending session");
                    return Ok(SessionOutcome::Truncated);
                }
            };
            self.process(&record)?;
            if self.shutdown.is_triggered() {
                tracing::info!(source = %self.source_id, packets = self.packets, "Session interrupted");
                return Ok(SessionOutcome::Interrupted);
            }
        }
        // A live stream reports end of input once shutdown is requested.
        if self.shutdown.is_triggered() {
            return Ok(SessionOutcome::Interrupted);
        }
        if reader.truncated() {
            Ok(SessionOutcome::Truncated)
        } else {
            Ok(SessionOutcome::Completed)
        }
    }

    fn process(&mut self, record: &PacketRecord) -> Result<()> {
        self.packets += 1;
        self.bytes += record.wire_len as u64;
        let ts = record.timestamp_us;

        if let Some(cutoff) = self.flush.tick(ts) {
            let flushed = self.assembler.flush_older_than(cutoff)?;
            let discarded = self.defrag.discard_older_than(cutoff);
            if flushed > 0 || discarded > 0 {
                tracing::debug!(source = %self.source_id, flushed, discarded, cutoff_us = cutoff, "Flushed idle state");
            }
        }

        let decoded = record.decode();
        let Some(network) = decoded.network else {
            return Ok(());
        };

        let reassembled;
        let (network, transport) = match network {
            Network::V4(header) => {
                let result = self.defrag.defrag(&header, ts).map_err(|error| PipelineError::Defrag {
                    source_id: self.source_id.clone(),
                    error,
                })?;
                match result {
                    Defragmented::Whole => (network, decoded.transport),
                    Defragmented::Pending => return Ok(()),
                    Defragmented::Reassembled(datagram) => {
                        reassembled = datagram;
                        let again = DecodedPacket::decode_ip(&reassembled);
                        match again.network {
                            Some(net @ Network::V4(_)) => (net, again.transport),
                            _ => {
                                return Err(PipelineError::Invariant(
                                    "reassembled datagram does not decode as IPv4".to_string(),
                                ))
                            }
                        }
                    }
                }
            }
            Network::V6(_) => (network, decoded.transport),
        };

        if let Some(Transport::Tcp(segment)) = transport {
            let ctx = SegmentContext {
                timestamp_us: ts,
                wire_len: record.wire_len,
            };
            self.assembler.assemble(network.src(), network.dst(), &segment, ctx)?;
        }
        Ok(())
    }
}
