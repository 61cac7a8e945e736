//! Bidirectional TCP flow identification
//!
//! A `FlowKey` identifies one TCP connection by its two endpoints. The endpoints
//! are stored in a normalized order, so the key for client→server traffic and the
//! key for server→client traffic are the same value.

use core::fmt;
use core::net::SocketAddr;

/// Symmetric identity of a TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    lo: SocketAddr,
    hi: SocketAddr,
}

impl FlowKey {
    /// Build the key for a segment travelling from `src` to `dst`.
    /// Swapping the arguments yields the same key.
    #[must_use]
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        if src <= dst {
            Self { lo: src, hi: dst }
        } else {
            Self { lo: dst, hi: src }
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.lo, self.hi)
    }
}

/// The two ends of a connection once the client side is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conversation {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl Conversation {
    #[must_use]
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.client, self.server)
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.server)
    }
}
