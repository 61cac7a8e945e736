//! Packet sources.
//!
//! A `PacketSource` is a blocking pull of captured frames. The pcap-backed source
//! covers both replaying a stored capture and capturing live from an interface;
//! anything else (tests, embedders) can implement the trait directly.

use crate::config::CaptureConfig;
use crate::error::Error;
use core::time::Duration;
use pcap::{Active, Capture, Device, Direction, Linktype, Offline};
use std::path::Path;
use tracing::{info, warn};

/// How a frame's bytes begin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Linux cooked capture, produced by the `any` pseudo-device
    LinuxSll,
    /// Frames start directly with an IPv4 or IPv6 header
    RawIp,
    /// BSD loopback: a 4-byte address family followed by IP
    Loopback,
}

impl LinkLayer {
    /// Map a pcap data link type, `None` when frames of that type cannot be decoded
    #[must_use]
    pub fn from_linktype(linktype: Linktype) -> Option<Self> {
        match linktype.0 {
            1 => Some(Self::Ethernet),
            113 => Some(Self::LinuxSll),
            12 | 14 | 101 | 228 | 229 => Some(Self::RawIp),
            0 | 108 => Some(Self::Loopback),
            _ => None,
        }
    }
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub link: LinkLayer,
    /// Capture time, as a duration since the Unix epoch
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Result of one pull from a packet source
#[derive(Debug)]
pub enum Next {
    Packet(RawPacket),
    /// Nothing arrived within the source's read timeout; more may follow
    Timeout,
    /// The source is drained
    Exhausted,
}

/// A blocking pull of captured frames.
///
/// Implementations should return `Next::Timeout` periodically when idle, so the
/// caller gets a chance to run its housekeeping.
pub trait PacketSource {
    fn next_packet(&mut self) -> Next;

    /// Whether capture timestamps track the wall clock (live capture) or are
    /// historical (replay)
    fn is_live(&self) -> bool {
        false
    }
}

enum Handle {
    Live(Capture<Active>),
    Offline(Capture<Offline>),
}

/// pcap-backed packet source
pub struct PcapSource {
    handle: Handle,
    link: LinkLayer,
}

impl PcapSource {
    /// Replay a stored capture file
    pub fn open_file(path: &Path) -> Result<Self, Error> {
        let cap = Capture::from_file(path)?;
        let link = Self::link_of(cap.get_datalink())?;
        info!("Replaying capture file: {}", path.display());
        Ok(Self {
            handle: Handle::Offline(cap),
            link,
        })
    }

    /// Capture live from the interface named in `config`
    pub fn open_interface(config: &CaptureConfig) -> Result<Self, Error> {
        let device = Device::list()?
            .into_iter()
            .find(|d| d.name == config.interface)
            .ok_or_else(|| Error::NoDeviceFound(config.interface.clone()))?;

        info!(
            "Monitoring device: {} ({})",
            device.name,
            device.desc.as_deref().unwrap_or("no description")
        );

        let mut cap = Capture::from_device(device)?
            .snaplen(config.snaplen)
            .buffer_size(config.buffer_size)
            .timeout(config.timeout_ms)
            .immediate_mode(true)
            .open()?;

        let filter = config.filter_expression();
        cap.filter(&filter, true)?;
        if config.inbound_only {
            cap.direction(Direction::In)?;
        }
        info!(filter = %filter, snaplen = config.snaplen, "Capture started");

        let link = Self::link_of(cap.get_datalink())?;
        Ok(Self {
            handle: Handle::Live(cap),
            link,
        })
    }

    fn link_of(linktype: Linktype) -> Result<LinkLayer, Error> {
        LinkLayer::from_linktype(linktype).ok_or(Error::UnsupportedLinkType(linktype.0))
    }
}

impl PacketSource for PcapSource {
    fn next_packet(&mut self) -> Next {
        let result = match &mut self.handle {
            Handle::Live(cap) => cap.next_packet(),
            Handle::Offline(cap) => cap.next_packet(),
        };
        match result {
            Ok(packet) => {
                let ts = packet.header.ts;
                let secs = u64::try_from(ts.tv_sec).unwrap_or(0);
                let micros = u32::try_from(ts.tv_usec).unwrap_or(0);
                Next::Packet(RawPacket {
                    link: self.link,
                    timestamp: Duration::new(secs, 0) + Duration::from_micros(u64::from(micros)),
                    data: packet.data.to_vec(),
                })
            }
            Err(pcap::Error::TimeoutExpired) => Next::Timeout,
            Err(pcap::Error::NoMorePackets) => Next::Exhausted,
            Err(e) => {
                warn!("Error reading packet: {e}");
                Next::Exhausted
            }
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.handle, Handle::Live(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, Some(LinkLayer::Ethernet))]
    #[case(113, Some(LinkLayer::LinuxSll))]
    #[case(101, Some(LinkLayer::RawIp))]
    #[case(228, Some(LinkLayer::RawIp))]
    #[case(0, Some(LinkLayer::Loopback))]
    #[case(105, None)]
    fn test_link_layer_from_linktype(#[case] linktype: i32, #[case] expected: Option<LinkLayer>) {
        assert_eq!(LinkLayer::from_linktype(Linktype(linktype)), expected);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let result = PcapSource::open_file(Path::new("/nonexistent/capture.pcap"));
        assert!(matches!(result, Err(Error::PCap(_))));
    }
}
