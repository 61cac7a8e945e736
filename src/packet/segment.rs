//! Protocol filter: turns a captured frame into a TCP segment, or drops it.

use crate::source::{LinkLayer, RawPacket};
use bytes::Bytes;
use core::net::{IpAddr, SocketAddr};
use core::time::Duration;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// TCP control bits the reassembler cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    pub(crate) syn: bool,
    pub(crate) ack: bool,
    pub(crate) fin: bool,
    pub(crate) rst: bool,
}

/// One TCP segment with its sequencing metadata
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub(crate) src: SocketAddr,
    pub(crate) dst: SocketAddr,
    pub(crate) seq: u32,
    pub(crate) flags: Flags,
    pub(crate) payload: Bytes,
    pub(crate) timestamp: Duration,
}

impl Segment {
    /// Sequence number of the first payload byte; a SYN occupies one number
    pub(crate) fn data_seq(&self) -> u32 {
        if self.flags.syn {
            self.seq.wrapping_add(1)
        } else {
            self.seq
        }
    }

    pub(crate) fn ends_stream(&self) -> bool {
        self.flags.fin || self.flags.rst
    }
}

/// Outcome of filtering one frame
#[derive(Debug)]
pub(crate) enum Classified {
    /// No IP/TCP layers, another transport, or undecodable
    NotTcp,
    /// TCP without payload and without SYN/FIN/RST, such as a pure ACK
    Empty,
    /// A segment with payload, or a zero-payload SYN, FIN or RST: those still
    /// anchor, end or reset a stream, so they are not dropped with the other
    /// empty segments
    Segment(Segment),
}

pub(crate) fn classify(packet: &RawPacket) -> Classified {
    let sliced = match packet.link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(&packet.data),
        LinkLayer::LinuxSll => SlicedPacket::from_linux_sll(&packet.data),
        LinkLayer::RawIp => SlicedPacket::from_ip(&packet.data),
        LinkLayer::Loopback => match packet.data.get(4..) {
            Some(ip) => SlicedPacket::from_ip(ip),
            None => return Classified::NotTcp,
        },
    };
    let Ok(sliced) = sliced else {
        return Classified::NotTcp;
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ip)) => (
            IpAddr::V4(ip.header().source_addr()),
            IpAddr::V4(ip.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ip)) => (
            IpAddr::V6(ip.header().source_addr()),
            IpAddr::V6(ip.header().destination_addr()),
        ),
        _ => return Classified::NotTcp,
    };
    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return Classified::NotTcp;
    };

    let flags = Flags {
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
    };
    let payload = tcp.payload();
    if payload.is_empty() && !flags.syn && !flags.fin && !flags.rst {
        return Classified::Empty;
    }

    Classified::Segment(Segment {
        src: SocketAddr::new(src_ip, tcp.source_port()),
        dst: SocketAddr::new(dst_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        flags,
        payload: Bytes::copy_from_slice(payload),
        timestamp: packet.timestamp,
    })
}
