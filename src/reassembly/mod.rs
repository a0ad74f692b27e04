//! TCP flow reassembly.
//!
//! Segments are grouped into connections by [`FlowKey`], ordered per
//! direction and merged into [`CompletedFlow`]s. A flow is finalized exactly
//! once: when the connection closes (RST, or FIN from both sides), when it
//! has been idle past the flush cutoff, or when the session ends.
//!
//! Reference: RFC 793 (TCP).

mod flow;
pub mod flush;
mod fsm;
mod stream;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::ReassemblyMode;
use crate::decode::TcpSegment;
use crate::error::Result;
use crate::sink::{CloseReason, CompletedFlow, Endpoint};

pub use flow::FlowKey;
pub use flush::FlushScheduler;

use flow::{client_server, FlowState};

/// Receives flows as they are finalized.
pub trait FlowEmitter {
    fn emit(&mut self, flow: CompletedFlow) -> Result<()>;
}

impl FlowEmitter for Vec<CompletedFlow> {
    fn emit(&mut self, flow: CompletedFlow) -> Result<()> {
        self.push(flow);
        Ok(())
    }
}

/// Per-packet metadata the assembler needs besides the segment itself.
#[derive(Debug, Clone, Copy)]
pub struct SegmentContext {
    pub timestamp_us: u64,
    /// Wire length of the packet carrying the segment.
    pub wire_len: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub segments: u64,
    /// Segments dropped by strict connection tracking.
    pub rejected: u64,
    pub flows_opened: u64,
    pub flows_emitted: u64,
    /// Flows finalized without any payload; not emitted.
    pub flows_empty: u64,
}

/// Reassembles the TCP flows of one capture session.
pub struct Assembler<E: FlowEmitter> {
    source_id: String,
    mode: ReassemblyMode,
    flows: HashMap<FlowKey, FlowState>,
    emitter: E,
    stats: AssemblerStats,
}

impl<E: FlowEmitter> Assembler<E> {
    pub fn new(source_id: impl Into<String>, mode: ReassemblyMode, emitter: E) -> Self {
        Self {
            source_id: source_id.into(),
            mode,
            flows: HashMap::new(),
            emitter,
            stats: AssemblerStats::default(),
        }
    }

    /// Feed one TCP segment sent from `src` to `dst`.
    pub fn assemble(&mut self, src: IpAddr, dst: IpAddr, segment: &TcpSegment<'_>, ctx: SegmentContext) -> Result<()> {
        let src = Endpoint::new(src, segment.src_port);
        let dst = Endpoint::new(dst, segment.dst_port);
        let key = FlowKey::new(src, dst);
        self.stats.segments += 1;

        let finished = match self.flows.entry(key) {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if !state.admit(src, segment.flags, self.mode) {
                    self.stats.rejected += 1;
                    return Ok(());
                }
                state.ingest(src, segment, ctx.timestamp_us);
                match state.close_reason() {
                    Some(reason) => Some((entry.remove(), reason)),
                    None => None,
                }
            }
            Entry::Vacant(entry) => {
                let (client, server) = client_server(src, dst, segment.flags);
                let mut state = FlowState::new(client, server, ctx.timestamp_us);
                if !state.admit(src, segment.flags, self.mode) {
                    // No state is created for a rejected opening segment.
                    self.stats.rejected += 1;
                    return Ok(());
                }
                self.stats.flows_opened += 1;
                tracing::trace!(?key, %client, %server, "New TCP flow");
                state.ingest(src, segment, ctx.timestamp_us);
                match state.close_reason() {
                    Some(reason) => Some((state, reason)),
                    None => {
                        entry.insert(state);
                        None
                    }
                }
            }
        };

        if let Some((state, reason)) = finished {
            self.finalize(state, reason)?;
        }
        Ok(())
    }

    /// Finalize flows with no packets since before `cutoff_us`.
    pub fn flush_older_than(&mut self, cutoff_us: u64) -> Result<usize> {
        let mut idle: Vec<(FlowKey, u64)> = self
            .flows
            .iter()
            .filter(|(_, state)| state.last_seen_us() < cutoff_us)
            .map(|(key, state)| (*key, state.first_seen_us()))
            .collect();
        idle.sort_by_key(|(_, first_seen)| *first_seen);
        self.finalize_keys(idle.into_iter().map(|(key, _)| key), CloseReason::Idle)
    }

    /// Finalize every open flow, oldest first.
    pub fn flush_all(&mut self) -> Result<usize> {
        let mut open: Vec<(FlowKey, u64)> = self
            .flows
            .iter()
            .map(|(key, state)| (*key, state.first_seen_us()))
            .collect();
        open.sort_by_key(|(_, first_seen)| *first_seen);
        self.finalize_keys(open.into_iter().map(|(key, _)| key), CloseReason::Flushed)
    }

    fn finalize_keys(&mut self, keys: impl Iterator<Item = FlowKey>, reason: CloseReason) -> Result<usize> {
        let mut count = 0;
        for key in keys {
            if let Some(state) = self.flows.remove(&key) {
                self.finalize(state, reason)?;
                count += 1;
            }
        }
        Ok(count)
    }

    fn finalize(&mut self, state: FlowState, reason: CloseReason) -> Result<()> {
        let flow = state.finish(reason, &self.source_id);
        if flow.bytes == 0 {
            self.stats.flows_empty += 1;
            tracing::trace!(client = %flow.client, server = %flow.server, ?reason, "Dropping flow without payload");
            return Ok(());
        }
        tracing::debug!(
            client = %flow.client,
            server = %flow.server,
            bytes = flow.bytes,
            packets = flow.packets,
            ?reason,
            "Flow completed"
        );
        self.stats.flows_emitted += 1;
        self.emitter.emit(flow)
    }

    /// Connections currently tracked.
    pub fn open_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::TcpFlags;
    use crate::sink::Direction;

    const CLIENT: &str = "10.0.0.1";
    const SERVER: &str = "10.0.0.2";
    const CPORT: u16 = 40000;
    const SPORT: u16 = 80;
    const SEC: u64 = 1_000_000;

    const SYN: u8 = TcpFlags::SYN;
    const SYNACK: u8 = TcpFlags::SYN | TcpFlags::ACK;
    const ACK: u8 = TcpFlags::ACK;
    const PSH: u8 = TcpFlags::PSH | TcpFlags::ACK;
    const FIN: u8 = TcpFlags::FIN | TcpFlags::ACK;
    const RST: u8 = TcpFlags::RST;

    type TestAssembler = Assembler<Vec<CompletedFlow>>;

    fn assembler(mode: ReassemblyMode) -> TestAssembler {
        Assembler::new("test.pcap", mode, Vec::new())
    }

    fn segment(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port,
            dst_port,
            seq,
            ack: 0,
            flags: TcpFlags(flags),
            window: 8192,
            payload,
        }
    }

    /// Client-to-server segment.
    fn c2s(a: &mut TestAssembler, seq: u32, flags: u8, payload: &[u8], ts: u64) {
        let seg = segment(CPORT, SPORT, seq, flags, payload);
        a.assemble(CLIENT.parse().unwrap(), SERVER.parse().unwrap(), &seg, SegmentContext { timestamp_us: ts, wire_len: 60 })
            .unwrap();
    }

    /// Server-to-client segment.
    fn s2c(a: &mut TestAssembler, seq: u32, flags: u8, payload: &[u8], ts: u64) {
        let seg = segment(SPORT, CPORT, seq, flags, payload);
        a.assemble(SERVER.parse().unwrap(), CLIENT.parse().unwrap(), &seg, SegmentContext { timestamp_us: ts, wire_len: 60 })
            .unwrap();
    }

    /// SYN (isn 899), SYN+ACK (isn 4999), ACK.
    fn handshake(a: &mut TestAssembler) {
        c2s(a, 899, SYN, b"", 1);
        s2c(a, 4999, SYNACK, b"", 2);
        c2s(a, 900, ACK, b"", 3);
    }

    #[test]
    fn test_out_of_order_segments_delivered_in_order() {
        let mut a = assembler(ReassemblyMode::Strict);
        handshake(&mut a);
        c2s(&mut a, 1000, PSH, &[b'B'; 100], 4);
        c2s(&mut a, 900, PSH, &[b'A'; 100], 5);
        c2s(&mut a, 1100, FIN, b"", 6);
        s2c(&mut a, 5000, FIN, b"", 7);

        let flows = a.emitter();
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.close_reason, CloseReason::Fin);
        let sent = flow.payload(Direction::ClientToServer);
        assert_eq!(sent.len(), 200);
        assert!(sent[..100].iter().all(|b| *b == b'A'));
        assert!(sent[100..].iter().all(|b| *b == b'B'));
        assert_eq!(a.open_flows(), 0);
    }

    #[test]
    fn test_request_response_items() {
        let mut a = assembler(ReassemblyMode::Strict);
        handshake(&mut a);
        c2s(&mut a, 900, PSH, b"GET / ", 4);
        c2s(&mut a, 906, PSH, b"HTTP/1.1\r\n", 5);
        s2c(&mut a, 5000, PSH, b"200 OK", 6);
        c2s(&mut a, 916, RST, b"", 7);

        let flow = &a.emitter()[0];
        assert_eq!(flow.close_reason, CloseReason::Reset);
        assert_eq!(flow.items.len(), 2);
        assert_eq!(flow.items[0].direction, Direction::ClientToServer);
        assert_eq!(flow.items[0].data, b"GET / HTTP/1.1\r\n");
        assert_eq!(flow.items[0].timestamp_us, 4);
        assert_eq!(flow.items[1].data, b"200 OK");
        assert_eq!(flow.client.port, CPORT);
        assert_eq!(flow.packets, 7);
        assert_eq!(flow.bytes, 22);
    }

    #[test]
    fn test_flow_emitted_at_most_once() {
        let mut a = assembler(ReassemblyMode::Relaxed);
        handshake(&mut a);
        c2s(&mut a, 900, PSH, b"data", 4);
        c2s(&mut a, 904, RST, b"", 5);
        // Late retransmissions open a new (relaxed) flow, never touch the old one.
        c2s(&mut a, 904, RST, b"", 6);
        a.flush_all().unwrap();
        a.flush_all().unwrap();
        assert_eq!(a.emitter().len(), 1);
        assert_eq!(a.stats().flows_emitted, 1);
    }

    #[test]
    fn test_strict_rejects_mid_stream_start() {
        let mut a = assembler(ReassemblyMode::Strict);
        c2s(&mut a, 5000, PSH, b"no handshake", 1);
        assert_eq!(a.open_flows(), 0);
        assert_eq!(a.stats().rejected, 1);
        a.flush_all().unwrap();
        assert!(a.emitter().is_empty());
    }

    #[test]
    fn test_relaxed_accepts_mid_stream_start() {
        let mut a = assembler(ReassemblyMode::Relaxed);
        c2s(&mut a, 5000, PSH, b"no ", 1);
        c2s(&mut a, 5003, PSH, b"handshake", 2);
        assert_eq!(a.open_flows(), 1);
        a.flush_all().unwrap();
        let flow = &a.emitter()[0];
        assert_eq!(flow.payload(Direction::ClientToServer), b"no handshake");
        assert_eq!(flow.close_reason, CloseReason::Flushed);
        assert_eq!(flow.fsm_violations, 2);
    }

    #[test]
    fn test_relaxed_mid_stream_out_of_order() {
        let mut a = assembler(ReassemblyMode::Relaxed);
        c2s(&mut a, 1000, PSH, &[b'B'; 100], 1);
        c2s(&mut a, 900, PSH, &[b'A'; 100], 2);
        s2c(&mut a, 7000, PSH, b"reply", 3);
        a.flush_all().unwrap();

        let flow = &a.emitter()[0];
        let sent = flow.payload(Direction::ClientToServer);
        assert_eq!(sent.len(), 200);
        assert!(sent[..100].iter().all(|b| *b == b'A'));
        assert!(sent[100..].iter().all(|b| *b == b'B'));
        assert_eq!(flow.items.len(), 2);
        assert_eq!(flow.items[1].data, b"reply");
        assert_eq!(flow.bytes, 205);
    }

    #[test]
    fn test_strict_drops_syn_inside_established() {
        let mut a = assembler(ReassemblyMode::Strict);
        handshake(&mut a);
        c2s(&mut a, 900, PSH, b"ok", 4);
        c2s(&mut a, 902, SYN, b"bogus", 5);
        a.flush_all().unwrap();
        let flow = &a.emitter()[0];
        assert_eq!(flow.payload(Direction::ClientToServer), b"ok");
        assert_eq!(flow.fsm_violations, 1);
    }

    #[test]
    fn test_gap_released_at_finalization() {
        let mut a = assembler(ReassemblyMode::Strict);
        handshake(&mut a);
        c2s(&mut a, 900, PSH, b"head", 4);
        c2s(&mut a, 950, PSH, b"tail", 5);
        a.flush_all().unwrap();
        let flow = &a.emitter()[0];
        assert_eq!(flow.payload(Direction::ClientToServer), b"headtail");
    }

    #[test]
    fn test_empty_flow_not_emitted() {
        let mut a = assembler(ReassemblyMode::Strict);
        handshake(&mut a);
        c2s(&mut a, 900, RST, b"", 4);
        assert_eq!(a.open_flows(), 0);
        assert!(a.emitter().is_empty());
        assert_eq!(a.stats().flows_empty, 1);
    }

    #[test]
    fn test_idle_flush_after_cutoff() {
        // flush-after 60s: flow A goes quiet at t=0 while other traffic
        // keeps the capture clock moving every 10s.
        let mut flush = FlushScheduler::new(Some(std::time::Duration::from_secs(60)));
        let mut a = assembler(ReassemblyMode::Relaxed);
        assert_eq!(flush.tick(0), None);
        c2s(&mut a, 1, PSH, b"quiet", 0);

        let mut flushed_at = None;
        for i in 1..=10u64 {
            let now = i * 10 * SEC;
            if let Some(cutoff) = flush.tick(now) {
                if a.flush_older_than(cutoff).unwrap() > 0 && flushed_at.is_none() {
                    flushed_at = Some(i * 10);
                }
            }
            let other = segment(50000 + i as u16, 443, 1, PSH, b"x");
            a.assemble("10.9.9.9".parse().unwrap(), SERVER.parse().unwrap(), &other, SegmentContext { timestamp_us: now, wire_len: 60 })
                .unwrap();
        }
        assert_eq!(flushed_at, Some(90));
        let quiet = a
            .emitter()
            .iter()
            .find(|f| f.client.port == CPORT)
            .unwrap();
        assert_eq!(quiet.close_reason, CloseReason::Idle);
        assert_eq!(quiet.payload(Direction::ClientToServer), b"quiet");
    }

    #[test]
    fn test_wraparound_across_connection() {
        let mut a = assembler(ReassemblyMode::Strict);
        let isn = u32::MAX - 1;
        c2s(&mut a, isn, SYN, b"", 1);
        s2c(&mut a, 7, SYNACK, b"", 2);
        c2s(&mut a, u32::MAX, ACK, b"", 3);
        c2s(&mut a, 2, PSH, b"defg", 5);
        c2s(&mut a, u32::MAX, PSH, b"abc", 4);
        a.flush_all().unwrap();
        assert_eq!(a.emitter()[0].payload(Direction::ClientToServer), b"abcdefg");
    }
}
