//! Frame builders shared by unit tests.

use crate::source::{LinkLayer, RawPacket};
use core::time::Duration;
use etherparse::PacketBuilder;

pub(crate) const CLIENT: ([u8; 4], u16) = ([192, 168, 1, 100], 54321);
pub(crate) const SERVER: ([u8; 4], u16) = ([10, 0, 0, 1], 80);

#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameBuilder {
    src: ([u8; 4], u16),
    dst: ([u8; 4], u16),
    seq: u32,
    syn: bool,
    ack: bool,
    fin: bool,
    rst: bool,
    timestamp: Duration,
}

impl FrameBuilder {
    pub(crate) fn client() -> Self {
        Self::between(CLIENT, SERVER)
    }

    pub(crate) fn server() -> Self {
        Self::between(SERVER, CLIENT)
    }

    pub(crate) fn between(src: ([u8; 4], u16), dst: ([u8; 4], u16)) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            syn: false,
            ack: false,
            fin: false,
            rst: false,
            timestamp: Duration::from_secs(1_700_000_000),
        }
    }

    pub(crate) fn client_port(mut self, port: u16) -> Self {
        if self.src.1 == CLIENT.1 {
            self.src.1 = port;
        } else {
            self.dst.1 = port;
        }
        self
    }

    pub(crate) fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub(crate) fn syn(mut self) -> Self {
        self.syn = true;
        self
    }

    pub(crate) fn ack(mut self) -> Self {
        self.ack = true;
        self
    }

    pub(crate) fn fin(mut self) -> Self {
        self.fin = true;
        self
    }

    pub(crate) fn rst(mut self) -> Self {
        self.rst = true;
        self
    }

    pub(crate) fn at(mut self, timestamp: Duration) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn build(&self, payload: &[u8]) -> RawPacket {
        let mut builder = PacketBuilder::ethernet2([0, 0x11, 0x22, 0x33, 0x44, 0x55], [
            0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
        ])
        .ipv4(self.src.0, self.dst.0, 64)
        .tcp(self.src.1, self.dst.1, self.seq, 65535);
        if self.syn {
            builder = builder.syn();
        }
        if self.ack {
            builder = builder.ack(1);
        }
        if self.fin {
            builder = builder.fin();
        }
        if self.rst {
            builder = builder.rst();
        }

        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder
            .write(&mut data, payload)
            .expect("frame should serialize");
        RawPacket {
            link: LinkLayer::Ethernet,
            timestamp: self.timestamp,
            data,
        }
    }
}

/// A client→server data frame
pub(crate) fn frame(seq: u32, payload: &[u8]) -> RawPacket {
    FrameBuilder::client().seq(seq).build(payload)
}
