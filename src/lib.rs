#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! Passive HTTP request capture.
//!
//! Packets are read from a live interface or a capture file, filtered down to
//! TCP segments, reassembled per connection and direction, and the client's
//! byte stream is decoded into HTTP/1.x requests on one worker thread per
//! connection.

mod barrier;
pub mod config;
mod error;
mod flow_table;
mod http;
mod packet;
mod session;
pub mod source;
mod stats;
mod stream;
#[cfg(test)]
mod testing;

pub use error::Error;
pub use http::{Headers, HttpRequest, Version};
pub use packet::{Conversation, FlowKey};
pub use session::{Capture, StopHandle};
pub use stats::CaptureStats;
