//! Capture sources.
//!
//! Reads legacy pcap and pcapng data using the `pcap-parser` crate and
//! streams [`PacketRecord`]s. The same reader serves capture files and
//! live capture streams (any `Read` implementation); directory watching
//! discovers files to feed it.
//!
//! Reference: libpcap / pcapng file formats.

pub mod filter;
pub mod live;
#[cfg(feature = "dir-watch")]
pub mod watch;

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use anyhow::anyhow;
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};

use crate::decode::{DecodedPacket, LinkType};
use crate::error::{PipelineError, Result};
use filter::PacketFilter;

const LEGACY_MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const LEGACY_HEADER_LEN: usize = 24;
/// Section header block type; the same bytes in either byte order.
const PCAPNG_SHB: [u8; 4] = [0x0A, 0x0D, 0x0D, 0x0A];
const PCAPNG_BOM: u32 = 0x1A2B_3C4D;
const LEGACY_MAGIC_NANOS_SWAPPED: u32 = 0x4d3c_b2a1;

/// Largest block the reader will grow its buffer for.
const MAX_READ_BUFFER: usize = 16 * 1024 * 1024;

/// One captured packet.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    /// Capture timestamp in microseconds since the Unix epoch.
    pub timestamp_us: u64,
    /// Length of the packet on the wire (may exceed `data.len()`).
    pub wire_len: u32,
    pub link_type: LinkType,
    /// Captured bytes starting at the link-layer header.
    pub data: Vec<u8>,
}

impl PacketRecord {
    pub fn decode(&self) -> DecodedPacket<'_> {
        DecodedPacket::decode(self.link_type, &self.data)
    }
}

#[derive(Debug, Clone, Copy)]
struct Interface {
    link_type: LinkType,
    /// Timestamp units per second.
    ts_units: u64,
}

/// Link type and timestamp bookkeeping across pcap/pcapng blocks.
#[derive(Debug, Default)]
struct LinkState {
    legacy: Option<Interface>,
    interfaces: Vec<Interface>,
    last_timestamp_us: u64,
}

impl LinkState {
    /// Turn a packet block into a record; metadata blocks update state.
    fn record(&mut self, block: &PcapBlockOwned<'_>) -> Option<PacketRecord> {
        match block {
            PcapBlockOwned::LegacyHeader(hdr) => {
                let nanos = hdr.magic_number == LEGACY_MAGIC_NANOS
                    || hdr.magic_number == LEGACY_MAGIC_NANOS_SWAPPED;
                self.legacy = Some(Interface {
                    link_type: LinkType::from(hdr.network.0),
                    ts_units: if nanos { 1_000_000_000 } else { 1_000_000 },
                });
                None
            }
            PcapBlockOwned::Legacy(pkt) => {
                let iface = self.legacy?;
                let frac = to_micros(pkt.ts_usec as u64, iface.ts_units);
                let ts = pkt.ts_sec as u64 * 1_000_000 + frac;
                Some(self.emit(iface.link_type, ts, pkt.origlen, pkt.data))
            }
            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                self.interfaces.clear();
                None
            }
            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                self.interfaces.push(Interface {
                    link_type: LinkType::from(idb.linktype.0),
                    ts_units: ts_units_from_resolution(idb.if_tsresol),
                });
                None
            }
            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                let iface = *self.interfaces.get(epb.if_id as usize)?;
                let raw = ((epb.ts_high as u64) << 32) | epb.ts_low as u64;
                let ts = to_micros(raw, iface.ts_units);
                Some(self.emit(iface.link_type, ts, epb.origlen, epb.packet_data()))
            }
            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                // Simple packets carry no timestamp; reuse the last one.
                let iface = *self.interfaces.first()?;
                let ts = self.last_timestamp_us;
                Some(self.emit(iface.link_type, ts, spb.origlen, spb.packet_data()))
            }
            PcapBlockOwned::NG(_) => None,
        }
    }

    fn emit(&mut self, link_type: LinkType, ts: u64, wire_len: u32, data: &[u8]) -> PacketRecord {
        self.last_timestamp_us = ts;
        PacketRecord {
            timestamp_us: ts,
            wire_len,
            link_type,
            data: data.to_vec(),
        }
    }
}

/// `if_tsresol`: high bit clear is a power of ten, set is a power of two.
fn ts_units_from_resolution(tsresol: u8) -> u64 {
    let exp = (tsresol & 0x7F) as u32;
    let units = if tsresol & 0x80 == 0 {
        10u64.checked_pow(exp)
    } else {
        2u64.checked_pow(exp)
    };
    units.filter(|u| *u > 0).unwrap_or(1_000_000)
}

fn to_micros(value: u64, units_per_sec: u64) -> u64 {
    if units_per_sec == 1_000_000 {
        value
    } else {
        ((value as u128 * 1_000_000) / units_per_sec as u128) as u64
    }
}

/// Read exactly the file header: the legacy global header or the first
/// pcapng section header block. Reading no further keeps a live stream from
/// blocking on bytes that have not been sent yet.
fn read_preamble<R: Read>(input: &mut R) -> io::Result<Vec<u8>> {
    let mut head = vec![0u8; 12];
    input.read_exact(&mut head[..4])?;
    if head[..4] != PCAPNG_SHB {
        head.resize(LEGACY_HEADER_LEN, 0);
        input.read_exact(&mut head[4..])?;
        return Ok(head);
    }

    input.read_exact(&mut head[4..12])?;
    let len_bytes = [head[4], head[5], head[6], head[7]];
    let bom = [head[8], head[9], head[10], head[11]];
    let block_len: u32 = if u32::from_le_bytes(bom) == PCAPNG_BOM {
        u32::from_le_bytes(len_bytes)
    } else if u32::from_be_bytes(bom) == PCAPNG_BOM {
        u32::from_be_bytes(len_bytes)
    } else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad pcapng byte-order magic"));
    };
    let block_len = block_len as usize;
    if !(28..=MAX_READ_BUFFER).contains(&block_len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad section header length {}", block_len),
        ));
    }
    head.resize(block_len, 0);
    input.read_exact(&mut head[12..])?;
    Ok(head)
}

fn not_a_capture(source_id: &str, reason: impl std::fmt::Debug) -> PipelineError {
    PipelineError::unavailable(source_id, format!("not a pcap/pcapng capture: {:?}", reason))
}

/// Streams packets from a pcap or pcapng source.
pub struct CaptureReader {
    source_id: String,
    reader: Box<dyn PcapReaderIterator + Send>,
    links: LinkState,
    filter: Option<PacketFilter>,
    buffer_size: usize,
    done: bool,
    truncated: bool,
    filtered: u64,
}

impl CaptureReader {
    /// Open a capture file, detecting the format from its magic number.
    pub fn open_file(path: &Path, buffer_size: usize) -> Result<Self> {
        let source_id = path.display().to_string();
        let file = File::open(path).map_err(|e| PipelineError::unavailable(&source_id, e))?;
        let buf = BufReader::with_capacity(buffer_size, file);
        Self::from_reader(source_id, buf, buffer_size)
    }

    /// Read capture data from any byte stream, e.g. a live socket.
    pub fn from_reader<R>(source_id: impl Into<String>, input: R, buffer_size: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let source_id = source_id.into();
        let mut input = input;
        let head = read_preamble(&mut input).map_err(|e| not_a_capture(&source_id, e))?;
        let buffer_size = buffer_size.max(head.len());
        let pcapng = head[..4] == PCAPNG_SHB;
        // The parsers read once while constructing; that read returns just
        // the header already in hand.
        let input = Cursor::new(head).chain(input);
        let reader: Box<dyn PcapReaderIterator + Send> = if pcapng {
            Box::new(PcapNGReader::new(buffer_size, input).map_err(|e| not_a_capture(&source_id, e))?)
        } else {
            Box::new(LegacyPcapReader::new(buffer_size, input).map_err(|e| not_a_capture(&source_id, e))?)
        };
        Ok(Self {
            source_id,
            reader,
            links: LinkState::default(),
            filter: None,
            buffer_size,
            done: false,
            truncated: false,
            filtered: 0,
        })
    }

    /// Only yield packets matching `filter`.
    pub fn with_filter(mut self, filter: Option<PacketFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// True when the capture ended in the middle of a block.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Packets dropped by the filter so far.
    pub fn filtered(&self) -> u64 {
        self.filtered
    }

    fn admit(&mut self, record: &PacketRecord) -> bool {
        match &self.filter {
            Some(filter) if !filter.matches(&record.decode()) => {
                self.filtered += 1;
                false
            }
            _ => true,
        }
    }
}

impl Iterator for CaptureReader {
    type Item = anyhow::Result<PacketRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let record = self.links.record(&block);
                    self.reader.consume(offset);
                    match record {
                        Some(record) if self.admit(&record) => return Some(Ok(record)),
                        _ => continue,
                    }
                }
                Err(PcapError::Eof) => {
                    self.done = true;
                    return None;
                }
                Err(PcapError::UnexpectedEof) => {
                    // Capture cut off mid-block; keep what was read.
                    tracing::warn!(source = %self.source_id, "Capture truncated in the middle of a block");
                    self.truncated = true;
                    self.done = true;
                    return None;
                }
                Err(PcapError::Incomplete(_)) => {
                    if let Err(e) = self.reader.refill() {
                        self.done = true;
                        return Some(Err(anyhow!("capture refill error: {:?}", e)));
                    }
                }
                Err(PcapError::BufferTooSmall) => {
                    let grown = self.buffer_size * 2;
                    if grown > MAX_READ_BUFFER || !self.reader.grow(grown) {
                        self.done = true;
                        return Some(Err(anyhow!("capture block exceeds {} bytes", MAX_READ_BUFFER)));
                    }
                    self.buffer_size = grown;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow!("capture read error: {:?}", e)));
                }
            }
        }
    }
}
