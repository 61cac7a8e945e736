//! HTTP request extraction.
//!
//! This module turns the reassembled client→server byte stream of a flow into
//! `HttpRequest`s: `parser` frames and decodes messages incrementally,
//! `extractor` is the per-flow worker loop driving it.

pub(crate) mod extractor;
mod parser;
mod request;

pub use request::{Headers, HttpRequest, Version};
