//! Per-flow request extraction worker.

use super::parser::RequestDecoder;
use super::request::HttpRequest;
use crate::barrier::CompletionBarrier;
use crate::packet::Conversation;
use crate::stats::Counters;
use crate::stream::{StreamEnd, StreamReader};
use core::panic::AssertUnwindSafe;
use std::panic;
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) type RequestHandler = Arc<dyn Fn(HttpRequest) + Send + Sync>;

/// State shared by the capture loop and every worker of one run
pub(crate) struct WorkerContext {
    pub(crate) handler: Option<RequestHandler>,
    pub(crate) counters: Counters,
    pub(crate) barrier: CompletionBarrier,
    pub(crate) max_head: usize,
}

impl WorkerContext {
    pub(crate) fn new(handler: Option<RequestHandler>, max_head: usize) -> Self {
        Self {
            handler,
            counters: Counters::default(),
            barrier: CompletionBarrier::new(),
            max_head,
        }
    }
}

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    EndOfStream(StreamEnd),
    /// The stream ended in the middle of a request
    Truncated,
    Malformed,
    HandlerPanicked,
}

/// Read the request direction of one flow until it ends, handing every
/// complete request to the handler.
pub(crate) fn extract_requests(
    conversation: Conversation,
    mut reader: StreamReader,
    ctx: &WorkerContext,
) -> Exit {
    let mut decoder = RequestDecoder::new(conversation, ctx.max_head);
    loop {
        match decoder.decode() {
            Ok(Some(request)) => {
                debug!(
                    flow = %conversation,
                    method = request.method(),
                    target = request.target(),
                    "Request complete"
                );
                Counters::incr(&ctx.counters.requests);
                if let Some(handler) = &ctx.handler {
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(request)));
                    if delivered.is_err() {
                        error!(flow = %conversation, "Request handler panicked, abandoning flow");
                        return Exit::HandlerPanicked;
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(flow = %conversation, "Abandoning flow: {e}");
                Counters::incr(&ctx.counters.malformed_flows);
                return Exit::Malformed;
            }
        }

        match reader.next_chunk() {
            Some(bytes) => decoder.extend(&bytes),
            None if decoder.has_partial() => {
                debug!(flow = %conversation, "Stream ended inside a request");
                return Exit::Truncated;
            }
            None => return Exit::EndOfStream(reader.end().unwrap_or(StreamEnd::Lossy)),
        }
    }
}
