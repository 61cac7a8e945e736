//! Packet filtering and TCP flow identification.
//!
//! Captured frames are decoded once at the protocol filter boundary; everything
//! downstream works on `Segment`s keyed by a symmetric `FlowKey`.

mod flow_key;
mod segment;

pub use flow_key::{Conversation, FlowKey};
pub(crate) use segment::{Classified, Segment, classify};
