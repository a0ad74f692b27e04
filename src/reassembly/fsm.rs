//! TCP connection state tracking for strict reassembly.
//!
//! A simplified RFC 793 state machine viewed from the wire: it only needs
//! to tell whether a segment plausibly belongs to the connection so far.
//!
//! ```text
//!  Closed --SYN(c->s)--> SynSent --SYN+ACK(s->c)--> SynReceived
//!  SynReceived --ACK(c->s)--> Established --FIN--> Closing
//!  any --RST--> Closed
//! ```

use crate::decode::TcpFlags;
use crate::sink::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TcpState {
    #[default]
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionTracker {
    state: TcpState,
}

impl ConnectionTracker {
    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Advance with one segment. Returns false when the segment does not fit
    /// the current state; the state is left unchanged in that case.
    pub fn observe(&mut self, direction: Direction, flags: TcpFlags) -> bool {
        use Direction::{ClientToServer, ServerToClient};
        use TcpState::*;

        if flags.rst() {
            let valid = self.state != Closed;
            if valid {
                self.state = Closed;
            }
            return valid;
        }

        let next = match (self.state, direction) {
            (Closed, ClientToServer) if flags.syn() && !flags.ack() => Some(SynSent),
            (SynSent, ClientToServer) if flags.syn() && !flags.ack() => Some(SynSent),
            (SynSent, ServerToClient) if flags.syn() && flags.ack() => Some(SynReceived),
            (SynReceived, ServerToClient) if flags.syn() && flags.ack() => Some(SynReceived),
            (SynReceived, ClientToServer) if flags.ack() && !flags.syn() => {
                Some(if flags.fin() { Closing } else { Established })
            }
            (Established, _) if flags.syn() => None,
            (Established, _) if flags.fin() => Some(Closing),
            (Established, _) => Some(Established),
            (Closing, _) if flags.syn() => None,
            (Closing, _) => Some(Closing),
            _ => None,
        };
        match next {
            Some(state) => {
                self.state = state;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Direction::{ClientToServer as C2S, ServerToClient as S2C};

    fn flags(bits: u8) -> TcpFlags {
        TcpFlags(bits)
    }

    #[test]
    fn test_three_way_handshake_and_close() {
        let mut t = ConnectionTracker::default();
        assert!(t.observe(C2S, flags(TcpFlags::SYN)));
        assert!(t.observe(S2C, flags(TcpFlags::SYN | TcpFlags::ACK)));
        assert!(t.observe(C2S, flags(TcpFlags::ACK)));
        assert_eq!(t.state(), TcpState::Established);
        assert!(t.observe(S2C, flags(TcpFlags::ACK | TcpFlags::PSH)));
        assert!(t.observe(C2S, flags(TcpFlags::FIN | TcpFlags::ACK)));
        assert!(t.observe(S2C, flags(TcpFlags::FIN | TcpFlags::ACK)));
        assert_eq!(t.state(), TcpState::Closing);
    }

    #[test]
    fn test_mid_stream_start_is_violation() {
        let mut t = ConnectionTracker::default();
        assert!(!t.observe(C2S, flags(TcpFlags::ACK)));
        assert_eq!(t.state(), TcpState::Closed);
        assert!(!t.observe(S2C, flags(TcpFlags::SYN | TcpFlags::ACK)));
    }

    #[test]
    fn test_syn_inside_established_is_violation() {
        let mut t = ConnectionTracker::default();
        t.observe(C2S, flags(TcpFlags::SYN));
        t.observe(S2C, flags(TcpFlags::SYN | TcpFlags::ACK));
        t.observe(C2S, flags(TcpFlags::ACK));
        assert!(!t.observe(C2S, flags(TcpFlags::SYN)));
        assert_eq!(t.state(), TcpState::Established);
    }

    #[test]
    fn test_reset() {
        let mut t = ConnectionTracker::default();
        assert!(!t.observe(C2S, flags(TcpFlags::RST)));
        t.observe(C2S, flags(TcpFlags::SYN));
        assert!(t.observe(S2C, flags(TcpFlags::RST | TcpFlags::ACK)));
        assert_eq!(t.state(), TcpState::Closed);
    }

    #[test]
    fn test_syn_retransmission_allowed() {
        let mut t = ConnectionTracker::default();
        assert!(t.observe(C2S, flags(TcpFlags::SYN)));
        assert!(t.observe(C2S, flags(TcpFlags::SYN)));
        assert_eq!(t.state(), TcpState::SynSent);
    }
}
