//! One direction of a TCP connection.
//!
//! Sequence numbers are 32-bit and wrap; internally every byte gets a 64-bit
//! stream position relative to the first byte seen, so ordering never has to
//! compare wrapped values. Conversion goes through an anchor that follows
//! the release point, which keeps it correct for segments within 2^31 bytes
//! of the next expected byte.
//!
//! Reference: RFC 793 section 3.3, RFC 1982.

use std::collections::BTreeMap;

use crate::decode::TcpFlags;

/// Contiguous bytes handed to the flow, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Released {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
}

#[derive(Debug)]
struct Buffered {
    data: Vec<u8>,
    timestamp_us: u64,
}

#[derive(Debug, Default)]
pub(crate) struct HalfStream {
    /// (sequence number, stream position) of a known byte.
    anchor: Option<(u32, i64)>,
    /// Position of the next byte to release. Unknown until a SYN fixes the
    /// stream start; mid-stream data stays buffered until then.
    next: Option<i64>,
    /// Data not yet released, keyed by start position.
    pending: BTreeMap<i64, Buffered>,
    /// Position just past the last byte, once a FIN was seen.
    fin_at: Option<i64>,
    reset: bool,
}

impl HalfStream {
    fn position(&self, seq: u32) -> i64 {
        match self.anchor {
            Some((anchor_seq, anchor_pos)) => anchor_pos + (seq.wrapping_sub(anchor_seq) as i32) as i64,
            None => 0,
        }
    }

    fn reanchor(&mut self) {
        if let (Some((seq, pos)), Some(next)) = (self.anchor, self.next) {
            let advanced = (next - pos) as u32;
            self.anchor = Some((seq.wrapping_add(advanced), next));
        }
    }

    fn buffer(&mut self, start: i64, data: &[u8], timestamp_us: u64) {
        let keep_existing = self
            .pending
            .get(&start)
            .map(|b| b.data.len() >= data.len())
            .unwrap_or(false);
        if !keep_existing {
            self.pending.insert(
                start,
                Buffered {
                    data: data.to_vec(),
                    timestamp_us,
                },
            );
        }
    }

    /// Accept one segment and append any newly contiguous data to `out`.
    pub fn push(&mut self, seq: u32, flags: TcpFlags, payload: &[u8], timestamp_us: u64, out: &mut Vec<Released>) {
        // SYN occupies one sequence number; data follows it.
        let data_seq = if flags.syn() { seq.wrapping_add(1) } else { seq };
        if self.anchor.is_none() {
            self.anchor = Some((data_seq, 0));
        }

        let start = self.position(data_seq);
        let end = start + payload.len() as i64;
        if flags.syn() && self.next.is_none() {
            self.next = Some(start);
        }
        if flags.fin() && self.fin_at.is_none() {
            self.fin_at = Some(end);
        }

        match self.next {
            Some(next) => {
                if end > next && !payload.is_empty() {
                    // Trim the already released prefix of a retransmission.
                    if start < next {
                        self.buffer(next, &payload[(next - start) as usize..], timestamp_us);
                    } else {
                        self.buffer(start, payload, timestamp_us);
                    }
                }
            }
            None => {
                if !payload.is_empty() {
                    self.buffer(start, payload, timestamp_us);
                }
                // Without a SYN the stream starts at the lowest byte seen by
                // the time the sender closes.
                if let Some(fin) = self.fin_at {
                    let lowest = self.pending.keys().next().map_or(fin, |first| (*first).min(fin));
                    self.next = Some(lowest);
                }
            }
        }
        self.release(out);
    }

    /// Release buffered data starting at `next`, skipping overlap.
    fn release(&mut self, out: &mut Vec<Released>) {
        let Some(mut next) = self.next else {
            return;
        };
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > next {
                break;
            }
            let buffered = entry.remove();
            let end = start + buffered.data.len() as i64;
            if end <= next {
                continue;
            }
            let skip = (next - start) as usize;
            let data = if skip == 0 {
                buffered.data
            } else {
                buffered.data[skip..].to_vec()
            };
            out.push(Released {
                data,
                timestamp_us: buffered.timestamp_us,
            });
            next = end;
        }
        self.next = Some(next);
        self.reanchor();
    }

    /// Release everything still buffered, jumping over gaps.
    pub fn release_all(&mut self, out: &mut Vec<Released>) {
        while let Some((&start, _)) = self.pending.first_key_value() {
            match self.next {
                Some(next) if start > next => {
                    tracing::trace!(gap = start - next, "Skipping missing stream bytes");
                    self.next = Some(start);
                }
                Some(_) => {}
                None => self.next = Some(start),
            }
            self.release(out);
        }
    }

    pub fn mark_reset(&mut self) {
        self.reset = true;
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// FIN seen and every byte before it released.
    pub fn is_finished(&self) -> bool {
        matches!((self.fin_at, self.next), (Some(fin), Some(next)) if next >= fin)
    }

    #[cfg(test)]
    pub fn buffered_segments(&self) -> usize {
        self.pending.len()
    }
}
