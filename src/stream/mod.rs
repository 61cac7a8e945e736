//! TCP stream reassembly and hand-off.
//!
//! `ReassemblyBuffer` orders the segments of one direction of a connection;
//! `stream()` creates the channel that carries the ordered bytes to the worker
//! parsing them.

mod buffer;
mod channel;

pub(crate) use buffer::{ReassemblyBuffer, Release, StreamEnd};
pub(crate) use channel::{StreamReader, StreamWriter, stream};
