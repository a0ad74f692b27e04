use std::fmt;

use crate::config::ReassemblyMode;
use crate::decode::{TcpFlags, TcpSegment};
use crate::sink::{CloseReason, CompletedFlow, Direction, Endpoint, FlowItem};

use super::fsm::ConnectionTracker;
use super::stream::{HalfStream, Released};

/// Direction-independent connection key. The lower endpoint comes first, so
/// both directions of a connection map to the same key.
#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct FlowKey {
    pub lower: Endpoint,
    pub upper: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { lower: a, upper: b }
        } else {
            Self { lower: b, upper: a }
        }
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.lower, self.upper)
    }
}

/// Pick the client: whoever sent a bare SYN, or received a SYN+ACK.
/// Without a handshake the first sender is assumed to be the client.
pub(crate) fn client_server(src: Endpoint, dst: Endpoint, flags: TcpFlags) -> (Endpoint, Endpoint) {
    if flags.syn() && flags.ack() {
        (dst, src)
    } else {
        (src, dst)
    }
}

/// Live state of one TCP connection.
#[derive(Debug)]
pub(crate) struct FlowState {
    client: Endpoint,
    server: Endpoint,
    halves: [HalfStream; 2],
    tracker: ConnectionTracker,
    items: Vec<FlowItem>,
    first_seen_us: u64,
    last_seen_us: u64,
    packets: u64,
    bytes: u64,
    violations: u32,
}

impl FlowState {
    pub fn new(client: Endpoint, server: Endpoint, timestamp_us: u64) -> Self {
        Self {
            client,
            server,
            halves: Default::default(),
            tracker: ConnectionTracker::default(),
            items: Vec::new(),
            first_seen_us: timestamp_us,
            last_seen_us: timestamp_us,
            packets: 0,
            bytes: 0,
            violations: 0,
        }
    }

    fn direction_of(&self, src: Endpoint) -> Direction {
        if src == self.client {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    /// Run the segment through the connection tracker. Returns whether it
    /// should be assembled under `mode`.
    pub fn admit(&mut self, src: Endpoint, flags: TcpFlags, mode: ReassemblyMode) -> bool {
        let direction = self.direction_of(src);
        if self.tracker.observe(direction, flags) {
            return true;
        }
        self.violations += 1;
        tracing::trace!(
            client = %self.client,
            server = %self.server,
            ?direction,
            ?flags,
            state = ?self.tracker.state(),
            "Segment violates TCP connection state"
        );
        mode == ReassemblyMode::Relaxed
    }

    pub fn ingest(&mut self, src: Endpoint, segment: &TcpSegment<'_>, timestamp_us: u64) {
        let direction = self.direction_of(src);
        self.packets += 1;
        self.last_seen_us = self.last_seen_us.max(timestamp_us);

        let half = &mut self.halves[direction.index()];
        if segment.flags.rst() {
            half.mark_reset();
            return;
        }
        let mut released = Vec::new();
        half.push(segment.seq, segment.flags, segment.payload, timestamp_us, &mut released);
        self.append(direction, released);
    }

    /// Merge released data into the item list, extending the last item when
    /// the direction did not change.
    fn append(&mut self, direction: Direction, released: Vec<Released>) {
        for chunk in released {
            self.bytes += chunk.data.len() as u64;
            match self.items.last_mut() {
                Some(last) if last.direction == direction => last.data.extend_from_slice(&chunk.data),
                _ => self.items.push(FlowItem {
                    direction,
                    timestamp_us: chunk.timestamp_us,
                    data: chunk.data,
                }),
            }
        }
    }

    /// Reason to finalize right away, if the connection is over.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.halves.iter().any(HalfStream::is_reset) {
            Some(CloseReason::Reset)
        } else if self.halves.iter().all(HalfStream::is_finished) {
            Some(CloseReason::Fin)
        } else {
            None
        }
    }

    pub fn last_seen_us(&self) -> u64 {
        self.last_seen_us
    }

    pub fn first_seen_us(&self) -> u64 {
        self.first_seen_us
    }

    /// Release all buffered data (gaps skipped) and build the final record.
    pub fn finish(mut self, reason: CloseReason, source_id: &str) -> CompletedFlow {
        let mut client = Vec::new();
        let mut server = Vec::new();
        self.halves[Direction::ClientToServer.index()].release_all(&mut client);
        self.halves[Direction::ServerToClient.index()].release_all(&mut server);
        // Interleave what was held back by capture time, keeping stream
        // order within each direction.
        let mut client = client.into_iter().peekable();
        let mut server = server.into_iter().peekable();
        loop {
            let direction = match (client.peek(), server.peek()) {
                (Some(c), Some(s)) if s.timestamp_us < c.timestamp_us => Direction::ServerToClient,
                (Some(_), _) => Direction::ClientToServer,
                (None, Some(_)) => Direction::ServerToClient,
                (None, None) => break,
            };
            let chunk = match direction {
                Direction::ClientToServer => client.next(),
                Direction::ServerToClient => server.next(),
            };
            self.append(direction, chunk.into_iter().collect());
        }

        CompletedFlow {
            source_id: source_id.to_string(),
            client: self.client,
            server: self.server,
            start_us: self.first_seen_us,
            end_us: self.last_seen_us,
            packets: self.packets,
            bytes: self.bytes,
            items: self.items,
            close_reason: reason,
            fsm_violations: self.violations,
        }
    }
}
