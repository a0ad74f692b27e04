//! Link, network and transport header decoding.
//!
//! Zero-copy views over a captured frame: link layer (Ethernet with
//! 802.1Q/802.1ad tags, Linux cooked capture, BSD null/loopback, raw IP)
//! down to IPv4/IPv6 and TCP. Only what the pipeline needs is decoded;
//! anything malformed or unsupported simply yields `None`.
//!
//! Reference: RFC 791 (IPv4), RFC 8200 (IPv6), RFC 793 (TCP).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

/// Link-layer header type of a capture (libpcap LINKTYPE_* values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Null,
    Ethernet,
    /// Raw IP, version taken from the first nibble.
    RawIp,
    Ipv4,
    Ipv6,
    LinuxSll,
    Unsupported(i32),
}

impl From<i32> for LinkType {
    fn from(value: i32) -> Self {
        match value {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            12 | 101 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            228 => LinkType::Ipv4,
            229 => LinkType::Ipv6,
            other => LinkType::Unsupported(other),
        }
    }
}

/// TCP control bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }
    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }
    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, "S"),
            (Self::FIN, "F"),
            (Self::RST, "R"),
            (Self::PSH, "P"),
            (Self::ACK, "."),
        ];
        for (bit, name) in names {
            if self.0 & bit != 0 {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// IPv4 header view. `datagram` spans from the header to the end of the
/// datagram (bounded by both total length and captured bytes).
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub more_fragments: bool,
    /// Fragment offset in bytes.
    pub fragment_offset: usize,
    pub total_len: usize,
    pub header_len: usize,
    pub datagram: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    pub fn header(&self) -> &'a [u8] {
        &self.datagram[..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.datagram[self.header_len..]
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv6Header<'a> {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// Upper-layer protocol after skipping extension headers.
    pub protocol: u8,
    /// Set when a fragment extension header was found (never reassembled).
    pub fragmented: bool,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum Network<'a> {
    V4(Ipv4Header<'a>),
    V6(Ipv6Header<'a>),
}

impl Network<'_> {
    pub fn src(&self) -> IpAddr {
        match self {
            Network::V4(h) => IpAddr::V4(h.src),
            Network::V6(h) => IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Network::V4(h) => IpAddr::V4(h.dst),
            Network::V6(h) => IpAddr::V6(h.dst),
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            Network::V4(h) => h.protocol,
            Network::V6(h) => h.protocol,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp { src_port: u16, dst_port: u16 },
    Icmp,
    Other(u8),
}

impl Transport<'_> {
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Transport::Tcp(seg) => Some((seg.src_port, seg.dst_port)),
            Transport::Udp { src_port, dst_port } => Some((*src_port, *dst_port)),
            _ => None,
        }
    }
}

/// Decoded layers of one captured frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodedPacket<'a> {
    pub network: Option<Network<'a>>,
    pub transport: Option<Transport<'a>>,
}

impl<'a> DecodedPacket<'a> {
    /// Decode a frame captured with the given link type.
    pub fn decode(link: LinkType, frame: &'a [u8]) -> Self {
        let Some(ip) = strip_link(link, frame) else {
            return Self::default();
        };
        Self::decode_ip(ip)
    }

    /// Decode starting at an IP header (version from the first nibble).
    pub fn decode_ip(ip: &'a [u8]) -> Self {
        let network = match ip.first().map(|b| b >> 4) {
            Some(4) => parse_ipv4(ip).map(Network::V4),
            Some(6) => parse_ipv6(ip).map(Network::V6),
            _ => None,
        };
        let transport = network.and_then(|net| match net {
            // Non-first fragments carry no transport header.
            Network::V4(h) if h.fragment_offset != 0 => None,
            Network::V4(h) => Some(parse_transport(h.protocol, h.payload())),
            Network::V6(h) if h.fragmented => None,
            Network::V6(h) => Some(parse_transport(h.protocol, h.payload)),
        });
        Self { network, transport }
    }
}

// ── link layer ──

/// Strip the link-layer header, returning the IP packet it carries.
pub fn strip_link(link: LinkType, frame: &[u8]) -> Option<&[u8]> {
    match link {
        LinkType::Ethernet => parse_ethernet(frame),
        LinkType::LinuxSll => {
            if frame.len() < 16 {
                return None;
            }
            let protocol = u16::from_be_bytes([frame[14], frame[15]]);
            is_ip_ethertype(protocol).then(|| &frame[16..])
        }
        LinkType::Null => {
            if frame.len() < 4 {
                return None;
            }
            // Address family is in the capturing host's byte order.
            let family_le = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let family_be = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
            let known = |f: u32| matches!(f, 2 | 24 | 28 | 30);
            (known(family_le) || known(family_be)).then(|| &frame[4..])
        }
        LinkType::RawIp | LinkType::Ipv4 | LinkType::Ipv6 => Some(frame),
        LinkType::Unsupported(_) => None,
    }
}

fn is_ip_ethertype(ethertype: u16) -> bool {
    ethertype == ETHERTYPE_IPV4 || ethertype == ETHERTYPE_IPV6
}

fn parse_ethernet(data: &[u8]) -> Option<&[u8]> {
    if data.len() < 14 {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut rest = &data[14..];
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        if rest.len() < 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([rest[2], rest[3]]);
        rest = &rest[4..];
    }
    is_ip_ethertype(ethertype).then_some(rest)
}

// ── network layer ──

pub fn parse_ipv4(data: &[u8]) -> Option<Ipv4Header<'_>> {
    if data.len() < 20 || data[0] >> 4 != 4 {
        return None;
    }
    let header_len = (data[0] & 0x0F) as usize * 4;
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if header_len < 20 || data.len() < header_len || total_len < header_len {
        return None;
    }
    let identification = u16::from_be_bytes([data[4], data[5]]);
    let flags_frag = u16::from_be_bytes([data[6], data[7]]);
    let end = total_len.min(data.len());
    Some(Ipv4Header {
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        protocol: data[9],
        identification,
        more_fragments: flags_frag & 0x2000 != 0,
        fragment_offset: (flags_frag & 0x1FFF) as usize * 8,
        total_len,
        header_len,
        datagram: &data[..end],
    })
}

fn parse_ipv6(data: &[u8]) -> Option<Ipv6Header<'_>> {
    if data.len() < 40 || data[0] >> 4 != 6 {
        return None;
    }
    let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&data[8..24]).ok()?);
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&data[24..40]).ok()?);
    let end = (40 + payload_len).min(data.len());
    let mut next_header = data[6];
    let mut rest = &data[40..end];
    let mut fragmented = false;

    // Hop-by-hop, routing, fragment and destination options.
    loop {
        match next_header {
            0 | 43 | 60 => {
                if rest.len() < 8 {
                    return None;
                }
                let len = (rest[1] as usize + 1) * 8;
                if rest.len() < len {
                    return None;
                }
                next_header = rest[0];
                rest = &rest[len..];
            }
            44 => {
                if rest.len() < 8 {
                    return None;
                }
                fragmented = true;
                next_header = rest[0];
                rest = &rest[8..];
            }
            _ => break,
        }
    }

    Some(Ipv6Header {
        src,
        dst,
        protocol: next_header,
        fragmented,
        payload: rest,
    })
}

// ── transport layer ──

fn parse_transport(protocol: u8, data: &[u8]) -> Transport<'_> {
    match protocol {
        IPPROTO_TCP => match parse_tcp(data) {
            Some(seg) => Transport::Tcp(seg),
            None => Transport::Other(protocol),
        },
        IPPROTO_UDP if data.len() >= 8 => Transport::Udp {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
        },
        IPPROTO_ICMP | IPPROTO_ICMPV6 => Transport::Icmp,
        other => Transport::Other(other),
    }
}

pub fn parse_tcp(data: &[u8]) -> Option<TcpSegment<'_>> {
    if data.len() < 20 {
        return None;
    }
    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < 20 || data.len() < data_offset {
        return None;
    }
    Some(TcpSegment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: TcpFlags(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        payload: &data[data_offset..],
    })
}
