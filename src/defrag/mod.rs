//! IPv4 fragment reassembly.
//!
//! Fragments are buffered per (source, destination, identification,
//! protocol) until the byte range `[0, total)` is fully covered, at which
//! point a single datagram with a rewritten header is produced and the
//! buffer is released. Inconsistent fragment sets are reported as errors;
//! callers treat them as fatal.
//!
//! Reference: RFC 791 section 3.2, RFC 815.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::decode::Ipv4Header;

/// Largest possible IPv4 datagram.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Fragments accepted for a single datagram before giving up.
pub const MAX_FRAGMENTS: usize = 8192;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefragError {
    #[error("fragment at offset {offset} with {len} bytes exceeds the maximum datagram size")]
    Oversized { offset: usize, len: usize },

    #[error("more than {limit} fragments for one datagram")]
    TooManyFragments { limit: usize },

    #[error("conflicting final fragments: datagram ends at {first} and at {second}")]
    ConflictingEnd { first: usize, second: usize },

    #[error("fragment data up to {end} beyond the datagram end at {total}")]
    BeyondEnd { end: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identification: u16,
    pub protocol: u8,
}

impl FragmentKey {
    fn of(header: &Ipv4Header<'_>) -> Self {
        Self {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

/// Result of feeding one IPv4 datagram to the defragmenter.
#[derive(Debug, PartialEq, Eq)]
pub enum Defragmented {
    /// Not a fragment; process the packet unchanged.
    Whole,
    /// Fragment buffered; nothing to process yet.
    Pending,
    /// The complete datagram (header + payload), to be decoded again.
    Reassembled(Vec<u8>),
}

struct FragmentBuffer {
    /// Payload bytes keyed by fragment offset.
    fragments: BTreeMap<usize, Vec<u8>>,
    /// Header of the offset-zero fragment.
    header: Option<Vec<u8>>,
    /// Payload length, known once the last fragment arrived.
    total: Option<usize>,
    last_seen_us: u64,
}

impl FragmentBuffer {
    fn new(now_us: u64) -> Self {
        Self {
            fragments: BTreeMap::new(),
            header: None,
            total: None,
            last_seen_us: now_us,
        }
    }

    fn insert(&mut self, header: &Ipv4Header<'_>) -> Result<(), DefragError> {
        let offset = header.fragment_offset;
        let payload = header.payload();
        let end = offset + payload.len();
        if header.header_len + end > MAX_DATAGRAM_LEN {
            return Err(DefragError::Oversized {
                offset,
                len: payload.len(),
            });
        }
        if !header.more_fragments {
            match self.total {
                Some(total) if total != end => {
                    return Err(DefragError::ConflictingEnd {
                        first: total,
                        second: end,
                    })
                }
                _ => self.total = Some(end),
            }
        }
        if let Some(total) = self.total {
            let furthest = self
                .fragments
                .iter()
                .map(|(off, data)| off + data.len())
                .chain(std::iter::once(end))
                .max()
                .unwrap_or(end);
            if furthest > total {
                return Err(DefragError::BeyondEnd {
                    end: furthest,
                    total,
                });
            }
        }
        if offset == 0 && self.header.is_none() {
            self.header = Some(header.header().to_vec());
        }
        // First copy of an offset wins; a longer retransmission replaces it.
        match self.fragments.get(&offset) {
            Some(existing) if existing.len() >= payload.len() => {}
            _ => {
                if self.fragments.len() >= MAX_FRAGMENTS {
                    return Err(DefragError::TooManyFragments {
                        limit: MAX_FRAGMENTS,
                    });
                }
                self.fragments.insert(offset, payload.to_vec());
            }
        }
        Ok(())
    }

    /// Assemble the datagram if `[0, total)` is covered.
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total?;
        let header = self.header.as_ref()?;
        let mut payload = Vec::with_capacity(total);
        for (&offset, data) in &self.fragments {
            if offset > payload.len() {
                return None; // hole
            }
            let skip = payload.len() - offset;
            if skip < data.len() {
                payload.extend_from_slice(&data[skip..]);
            }
        }
        if payload.len() < total {
            return None;
        }
        payload.truncate(total);

        let mut datagram = Vec::with_capacity(header.len() + total);
        datagram.extend_from_slice(header);
        datagram.extend_from_slice(&payload);
        rewrite_header(&mut datagram, header.len());
        Some(datagram)
    }
}

/// Set total length, clear MF/offset and recompute the header checksum.
fn rewrite_header(datagram: &mut [u8], header_len: usize) {
    let total_len = datagram.len() as u16;
    datagram[2..4].copy_from_slice(&total_len.to_be_bytes());
    let dont_fragment = datagram[6] & 0x40;
    datagram[6] = dont_fragment;
    datagram[7] = 0;
    datagram[10] = 0;
    datagram[11] = 0;
    let checksum = ipv4_checksum(&datagram[..header_len]);
    datagram[10..12].copy_from_slice(&checksum.to_be_bytes());
}

pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Per-session IPv4 defragmenter.
#[derive(Default)]
pub struct Ipv4Defragmenter {
    buffers: HashMap<FragmentKey, FragmentBuffer>,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one IPv4 datagram captured at `now_us`.
    pub fn defrag(&mut self, header: &Ipv4Header<'_>, now_us: u64) -> Result<Defragmented, DefragError> {
        if !header.is_fragment() {
            return Ok(Defragmented::Whole);
        }
        let key = FragmentKey::of(header);
        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| FragmentBuffer::new(now_us));
        buffer.last_seen_us = buffer.last_seen_us.max(now_us);

        if let Err(e) = buffer.insert(header) {
            self.buffers.remove(&key);
            return Err(e);
        }
        match buffer.assemble() {
            Some(datagram) => {
                self.buffers.remove(&key);
                tracing::trace!(
                    src = %key.src,
                    dst = %key.dst,
                    id = key.identification,
                    len = datagram.len(),
                    "Reassembled IPv4 datagram"
                );
                Ok(Defragmented::Reassembled(datagram))
            }
            None => Ok(Defragmented::Pending),
        }
    }

    /// Drop incomplete datagrams not touched since `cutoff_us`.
    pub fn discard_older_than(&mut self, cutoff_us: u64) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, buf| buf.last_seen_us >= cutoff_us);
        let discarded = before - self.buffers.len();
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale IPv4 fragment buffers");
        }
        discarded
    }

    /// Number of datagrams currently awaiting fragments.
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}
