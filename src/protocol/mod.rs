use std::fmt;
use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    RawIp,
}

impl LinkType {
    /// The pcap link-layer header type value (DLT_*).
    pub fn dlt(self) -> u32 {
        match self {
            LinkType::Ethernet => 1,    // DLT_EN10MB
            LinkType::RawIp => 101,     // DLT_RAW
            LinkType::LinuxSll => 113,  // DLT_LINUX_SLL
            LinkType::LinuxSll2 => 276, // DLT_LINUX_SLL2
        }
    }
}

/// Network-level endpoints of one flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl NetFlow {
    /// The opposite direction of the same connection.
    pub fn reverse(self) -> Self {
        NetFlow {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for NetFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Transport-level (TCP port) endpoints of one flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

impl TransportFlow {
    pub fn reverse(self) -> Self {
        TransportFlow {
            src: self.dst,
            dst: self.src,
        }
    }
}

impl fmt::Display for TransportFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// One endpoint of a flow. Decoders are registered under their flow's
/// source endpoint, so the paired flow is found by looking up this flow's
/// destination endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl FlowKey {
    /// Source endpoint of a flow (its registration key).
    pub fn source(net: NetFlow, transport: TransportFlow) -> Self {
        FlowKey {
            ip: net.src,
            port: transport.src,
        }
    }

    /// Destination endpoint of a flow (the paired flow's source).
    pub fn destination(net: NetFlow, transport: TransportFlow) -> Self {
        FlowKey {
            ip: net.dst,
            port: transport.dst,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// TCP fields extracted from one captured packet.
#[derive(Debug)]
pub struct ParsedTcp {
    pub net: NetFlow,
    pub transport: TransportFlow,
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

/// Parse raw packet bytes down to TCP. Non-TCP traffic yields `None`; the
/// BPF filter keeps that to a trickle on live captures.
pub fn parse_tcp(data: &[u8], link_type: LinkType) -> Option<ParsedTcp> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::LinuxSll | LinkType::LinuxSll2 => {
            SlicedPacket::from_ip(strip_cooked_header(data, link_type)?).ok()?
        }
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    // v6-mapped v4 endpoints (::ffff:a.b.c.d) collapse to plain v4 so both
    // directions of a dual-stack connection land on the same registry keys.
    let unmap = |ip: IpAddr| match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(ParsedTcp {
            net: NetFlow {
                src: unmap(src_ip),
                dst: unmap(dst_ip),
            },
            transport: TransportFlow {
                src: tcp.source_port(),
                dst: tcp.destination_port(),
            },
            seq: tcp.sequence_number(),
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            payload: tcp.payload().to_vec(),
        }),
        _ => None,
    }
}

/// Peel the pseudo header a Linux cooked capture (SLLv1/v2) prepends to the
/// IP packet, returning the IP bytes. The two versions differ only in where
/// the EtherType sits and how wide the header is; anything that is not IPv4
/// or IPv6 (ARP and friends) carries no TCP and is discarded here.
fn strip_cooked_header(data: &[u8], link_type: LinkType) -> Option<&[u8]> {
    let (header_len, proto_offset) = match link_type {
        LinkType::LinuxSll => (16, 14),
        LinkType::LinuxSll2 => (20, 0),
        _ => return None,
    };
    if data.len() < header_len {
        return None;
    }
    match u16::from_be_bytes([data[proto_offset], data[proto_offset + 1]]) {
        0x0800 | 0x86DD => Some(&data[header_len..]),
        _ => None,
    }
}

/// Map a pcap DLT_* value to a [`LinkType`].
pub fn link_type_from_pcap(dl: pcap::Linktype) -> LinkType {
    match dl.0 {
        1 => LinkType::Ethernet,     // DLT_EN10MB
        12 | 101 => LinkType::RawIp, // DLT_RAW
        113 => LinkType::LinuxSll,   // DLT_LINUX_SLL
        276 => LinkType::LinuxSll2,  // DLT_LINUX_SLL2
        _ => {
            tracing::warn!(
                "unsupported link type {} ({}), assuming Ethernet",
                dl.get_name().unwrap_or_default(),
                dl.0
            );
            LinkType::Ethernet
        }
    }
}
