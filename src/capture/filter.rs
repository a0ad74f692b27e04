//! Packet filter expressions.
//!
//! A small subset of the BPF/tcpdump filter language, parsed with `nom`
//! and evaluated against decoded packets:
//!
//! ```text
//! expr    := and ( ("or" | "||") and )*
//! and     := unary ( [ "and" | "&&" ] unary )*
//! unary   := ("not" | "!") unary | "(" expr ")" | primitive
//! primitive := "ip" | "ip6" | "tcp" | "udp" | "icmp"
//!            | [dir] "host" ADDR | [dir] "net" ADDR "/" LEN
//!            | [dir] "port" NUM  | [dir] "portrange" NUM "-" NUM
//! dir     := "src" | "dst"
//! ```
//!
//! As in tcpdump, juxtaposed terms are conjoined: `tcp port 80` is
//! `tcp and port 80`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, digit1, multispace0, multispace1, satisfy};
use nom::combinator::{all_consuming, map, map_res, not, opt, peek, value};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated};
use nom::IResult;

use crate::decode::{DecodedPacket, Network, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Ip,
    Ip6,
    Tcp,
    Udp,
    Icmp,
    Host(Side, IpAddr),
    Net(Side, IpAddr, u8),
    Port(Side, u16),
    PortRange(Side, u16, u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Primitive(Primitive),
    Not(Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFilter {
    source: String,
    expr: FilterExpr,
}

impl PacketFilter {
    pub fn parse(source: &str) -> Result<Self, PipelineError> {
        let syntax = |reason: String| PipelineError::FilterSyntax {
            expr: source.to_string(),
            reason,
        };
        if source.trim().is_empty() {
            return Err(syntax("empty expression".to_string()));
        }
        match all_consuming(delimited(multispace0, expr, multispace0))(source) {
            Ok((_, expr)) => Ok(Self {
                source: source.to_string(),
                expr,
            }),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                let at = source.len() - e.input.len();
                Err(syntax(format!("unexpected input at offset {}: {:?}", at, e.input)))
            }
            Err(nom::Err::Incomplete(_)) => Err(syntax("incomplete expression".to_string())),
        }
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    /// Evaluate against a decoded packet. Every primitive is false for a
    /// packet without an IP layer, so only negations match those.
    pub fn matches(&self, packet: &DecodedPacket<'_>) -> bool {
        eval(&self.expr, packet)
    }
}

impl FromStr for PacketFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PacketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ── evaluation ──

fn eval(expr: &FilterExpr, packet: &DecodedPacket<'_>) -> bool {
    match expr {
        FilterExpr::Not(inner) => !eval(inner, packet),
        FilterExpr::And(a, b) => eval(a, packet) && eval(b, packet),
        FilterExpr::Or(a, b) => eval(a, packet) || eval(b, packet),
        FilterExpr::Primitive(p) => match &packet.network {
            Some(network) => primitive_matches(p, network, packet),
            None => false,
        },
    }
}

fn primitive_matches(p: &Primitive, network: &Network<'_>, packet: &DecodedPacket<'_>) -> bool {
    let (src, dst) = (network.src(), network.dst());
    match p {
        Primitive::Ip => matches!(network, Network::V4(_)),
        Primitive::Ip6 => matches!(network, Network::V6(_)),
        Primitive::Tcp => network.protocol() == IPPROTO_TCP,
        Primitive::Udp => network.protocol() == IPPROTO_UDP,
        Primitive::Icmp => matches!(network.protocol(), IPPROTO_ICMP | IPPROTO_ICMPV6),
        Primitive::Host(side, addr) => on_side(*side, src, dst, |a| a == *addr),
        Primitive::Net(side, net, len) => on_side(*side, src, dst, |a| in_net(a, *net, *len)),
        Primitive::Port(side, port) => match packet.transport.and_then(|t| t.ports()) {
            Some((sp, dp)) => on_side(*side, sp, dp, |p| p == *port),
            None => false,
        },
        Primitive::PortRange(side, lo, hi) => match packet.transport.and_then(|t| t.ports()) {
            Some((sp, dp)) => on_side(*side, sp, dp, |p| (*lo..=*hi).contains(&p)),
            None => false,
        },
    }
}

fn on_side<T: Copy>(side: Side, src: T, dst: T, pred: impl Fn(T) -> bool) -> bool {
    match side {
        Side::Src => pred(src),
        Side::Dst => pred(dst),
        Side::Either => pred(src) || pred(dst),
    }
}

fn in_net(addr: IpAddr, net: IpAddr, len: u8) -> bool {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let mask = u32::MAX.checked_shl(32 - len as u32).unwrap_or(0);
            u32::from(a) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let mask = u128::MAX.checked_shl(128 - len as u32).unwrap_or(0);
            u128::from(a) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

// ── grammar ──

/// Match `word` only when it is not followed by another identifier char.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), not(peek(satisfy(|c: char| c.is_alphanumeric() || c == '_'))))
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((keyword("or"), tag("||")))), and_expr))(input)?;
    let folded = rest
        .into_iter()
        .fold(first, |acc, e| FilterExpr::Or(Box::new(acc), Box::new(e)));
    Ok((input, folded))
}

fn and_expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(preceded(opt(ws(alt((keyword("and"), tag("&&"))))), unary))(input)?;
    let folded = rest
        .into_iter()
        .fold(first, |acc, e| FilterExpr::And(Box::new(acc), Box::new(e)));
    Ok((input, folded))
}

fn unary(input: &str) -> IResult<&str, FilterExpr> {
    alt((
        map(preceded(ws(alt((keyword("not"), tag("!")))), unary), |e| {
            FilterExpr::Not(Box::new(e))
        }),
        delimited(ws(char('(')), expr, ws(char(')'))),
        map(ws(primitive), FilterExpr::Primitive),
    ))(input)
}

fn primitive(input: &str) -> IResult<&str, Primitive> {
    alt((
        value(Primitive::Ip6, keyword("ip6")),
        value(Primitive::Ip, keyword("ip")),
        value(Primitive::Tcp, keyword("tcp")),
        value(Primitive::Udp, keyword("udp")),
        value(Primitive::Icmp, keyword("icmp")),
        qualified,
    ))(input)
}

fn qualified(input: &str) -> IResult<&str, Primitive> {
    let (input, side) = opt(terminated(
        alt((value(Side::Src, keyword("src")), value(Side::Dst, keyword("dst")))),
        multispace1,
    ))(input)?;
    let side = side.unwrap_or(Side::Either);
    alt((
        map(
            preceded(
                pair(keyword("portrange"), multispace1),
                map_res(separated_pair(port, char('-'), port), |(lo, hi)| {
                    if lo <= hi {
                        Ok((lo, hi))
                    } else {
                        Err("descending port range")
                    }
                }),
            ),
            move |(lo, hi)| Primitive::PortRange(side, lo, hi),
        ),
        map(preceded(pair(keyword("port"), multispace1), port), move |p| {
            Primitive::Port(side, p)
        }),
        map(preceded(pair(keyword("host"), multispace1), address), move |a| {
            Primitive::Host(side, a)
        }),
        map(preceded(pair(keyword("net"), multispace1), network), move |(a, len)| {
            Primitive::Net(side, a, len)
        }),
    ))(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse::<u16>)(input)
}

fn address(input: &str) -> IResult<&str, IpAddr> {
    map_res(
        take_while1(|c: char| c.is_ascii_hexdigit() || c == '.' || c == ':'),
        str::parse::<IpAddr>,
    )(input)
}

fn network(input: &str) -> IResult<&str, (IpAddr, u8)> {
    map_res(
        separated_pair(address, char('/'), map_res(digit1, str::parse::<u8>)),
        |(addr, len)| {
            let max = if addr.is_ipv4() { 32 } else { 128 };
            if len <= max {
                Ok((addr, len))
            } else {
                Err("prefix length out of range")
            }
        },
    )(input)
}
