//! Flow table: routing segments to their flow, and evicting idle flows.
//!
//! The table is owned by the capture loop, so routing and eviction never run
//! concurrently. Each flow owns the reassembly state of both directions and the
//! write half of its request stream; the worker parsing that stream only ever
//! sees the read half.

use crate::config::ReassemblyConfig;
use crate::http::extractor::{Exit, WorkerContext, extract_requests};
use crate::packet::{Conversation, FlowKey, Segment};
use crate::stats::Counters;
use crate::stream::{ReassemblyBuffer, Release, StreamEnd, StreamWriter, stream};
use core::mem;
use core::net::SocketAddr;
use core::sync::atomic::Ordering;
use core::time::Duration;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::thread::{self, Scope, ScopedJoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowState {
    Active,
    /// Both streams have ended, the worker may still be draining
    Flushing,
    /// The worker has exited
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowSettings {
    pub(crate) idle_timeout: Duration,
    pub(crate) start_grace: Duration,
    pub(crate) max_pending: usize,
}

impl From<&ReassemblyConfig> for FlowSettings {
    fn from(config: &ReassemblyConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            start_grace: config.start_grace(),
            max_pending: config.max_pending_bytes,
        }
    }
}

pub(crate) struct Flow<'scope> {
    conversation: Conversation,
    request: ReassemblyBuffer,
    response: ReassemblyBuffer,
    writer: StreamWriter,
    last_activity: Duration,
    state: FlowState,
    worker: Option<ScopedJoinHandle<'scope, Exit>>,
}

impl Flow<'_> {
    fn apply(&mut self, segment: Segment, counters: &Counters) {
        self.last_activity = self.last_activity.max(segment.timestamp);
        let direction = if segment.src == self.conversation.client {
            Direction::Request
        } else {
            Direction::Response
        };
        let buffer = match direction {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        };

        let mut release = Release::default();
        if segment.flags.syn {
            release.merge(buffer.syn(segment.seq));
        }
        let seq = segment.data_seq();
        #[allow(clippy::cast_possible_truncation)]
        let fin_seq = seq.wrapping_add(segment.payload.len() as u32);
        release.merge(buffer.insert(seq, segment.payload, segment.timestamp));
        if segment.flags.fin {
            release.merge(buffer.fin(fin_seq));
        }
        self.emit(direction, release, counters);

        if segment.flags.rst {
            debug!(flow = %self.conversation, "Connection reset");
            self.close_streams(counters);
        }
    }

    fn emit(&mut self, direction: Direction, release: Release, counters: &Counters) {
        if release.end == Some(StreamEnd::Lossy) {
            Counters::incr(&counters.lossy_streams);
        }
        match direction {
            Direction::Request => {
                for chunk in release.chunks {
                    self.writer.write(chunk);
                }
                if let Some(end) = release.end {
                    self.writer.close(end);
                }
            }
            Direction::Response => {
                counters
                    .response_bytes
                    .fetch_add(release.len() as u64, Ordering::Relaxed);
            }
        }
    }

    fn anchor_if_due(&mut self, now: Duration, counters: &Counters) {
        let release = self.request.anchor_if_due(now);
        self.emit(Direction::Request, release, counters);
        let release = self.response.anchor_if_due(now);
        self.emit(Direction::Response, release, counters);
    }

    /// End both directions, dropping whatever is still behind a gap
    fn close_streams(&mut self, counters: &Counters) {
        let release = self.request.close();
        self.emit(Direction::Request, release, counters);
        let release = self.response.close();
        self.emit(Direction::Response, release, counters);
        self.writer.close(StreamEnd::Complete);
    }

    fn is_done(&self) -> bool {
        self.request.is_ended() && self.response.is_ended()
    }

    fn worker_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(ScopedJoinHandle::is_finished)
    }

    /// Collect the worker. Blocks if it is still running.
    fn close(mut self) {
        debug!(
            flow = %self.conversation,
            request_bytes = self.request.delivered(),
            discarded = self.request.discarded() + self.response.discarded(),
            "Releasing flow"
        );
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(exit) => debug!(flow = %self.conversation, ?exit, "Flow worker exited"),
                Err(_) => error!(flow = %self.conversation, "Flow worker panicked"),
            }
        }
        self.state = FlowState::Closed;
        debug!(flow = %self.conversation, state = ?self.state, "Flow released");
    }
}

/// Where each direction of a retired flow ended, so late retransmissions of
/// already delivered bytes do not open a second flow
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    client: SocketAddr,
    request_end: Option<u32>,
    response_end: Option<u32>,
    retired_at: Duration,
}

impl Tombstone {
    /// Cut away the bytes the retired flow already covered. `None` when
    /// nothing new is left.
    fn trim(&self, mut segment: Segment) -> Option<Segment> {
        let end = if segment.src == self.client {
            self.request_end
        } else {
            self.response_end
        };
        let Some(end) = end else {
            return Some(segment);
        };
        let len = u32::try_from(segment.payload.len()).unwrap_or(u32::MAX);
        if !seq_before(end, segment.seq.wrapping_add(len)) {
            return None;
        }
        if seq_before(segment.seq, end) {
            let skip = end.wrapping_sub(segment.seq) as usize;
            segment.payload = segment.payload.slice(skip..);
            segment.seq = end;
        }
        Some(segment)
    }
}

/// `a` comes strictly before `b` in wrapping sequence space
#[allow(clippy::cast_possible_wrap)]
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) struct FlowTable<'scope, 'env> {
    scope: &'scope Scope<'scope, 'env>,
    ctx: &'env WorkerContext,
    settings: FlowSettings,
    flows: HashMap<FlowKey, Flow<'scope>>,
    retired: Vec<Flow<'scope>>,
    tombstones: HashMap<FlowKey, Tombstone>,
    /// Latest capture or tick time seen
    clock: Duration,
}

impl<'scope, 'env> FlowTable<'scope, 'env> {
    pub(crate) fn new(
        scope: &'scope Scope<'scope, 'env>,
        ctx: &'env WorkerContext,
        settings: FlowSettings,
    ) -> Self {
        Self {
            scope,
            ctx,
            settings,
            flows: HashMap::new(),
            retired: Vec::new(),
            tombstones: HashMap::new(),
            clock: Duration::ZERO,
        }
    }

    /// Flows still receiving traffic
    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }

    #[cfg(test)]
    pub(crate) fn tombstones(&self) -> usize {
        self.tombstones.len()
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, key: &FlowKey) -> Option<FlowState> {
        if let Some(flow) = self.flows.get(key) {
            return Some(flow.state);
        }
        self.retired
            .iter()
            .find(|f| f.conversation.key() == *key)
            .map(|f| {
                if f.worker_finished() {
                    FlowState::Closed
                } else {
                    f.state
                }
            })
    }

    /// Hand a segment to its flow, opening the flow on first sight
    pub(crate) fn route(&mut self, mut segment: Segment) {
        Counters::incr(&self.ctx.counters.segments);
        self.clock = self.clock.max(segment.timestamp);
        let key = FlowKey::new(segment.src, segment.dst);
        if !self.flows.contains_key(&key) {
            if segment.flags.syn {
                self.tombstones.remove(&key);
            } else if let Some(tombstone) = self.tombstones.get(&key) {
                match tombstone.trim(segment) {
                    Some(rest) => segment = rest,
                    None => {
                        debug!(flow = %key, "Dropping retransmission on a closed flow");
                        return;
                    }
                }
            }
        }

        let flow = match self.flows.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // a stray FIN or RST does not start a flow
                if segment.payload.is_empty() && segment.ends_stream() && !segment.flags.syn {
                    return;
                }
                entry.insert(open_flow(self.scope, self.ctx, self.settings, &segment))
            }
        };

        flow.apply(segment, &self.ctx.counters);
        if flow.is_done() {
            self.retire(key);
        }
    }

    /// Periodic housekeeping: flush flows idle since before `now - idle_timeout`,
    /// anchor streams whose start grace expired, release exited workers.
    pub(crate) fn tick(&mut self, now: Duration) {
        self.clock = self.clock.max(now);
        let cutoff = now.saturating_sub(self.settings.idle_timeout);
        self.tombstones.retain(|_, t| t.retired_at >= cutoff);
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.last_activity < cutoff)
            .map(|(key, _)| *key)
            .collect();
        for key in idle {
            if let Some(flow) = self.flows.get(&key) {
                debug!(
                    flow = %flow.conversation,
                    pending = flow.request.pending_bytes() + flow.response.pending_bytes(),
                    "Flushing idle flow"
                );
            }
            Counters::incr(&self.ctx.counters.idle_flushes);
            self.retire(key);
        }

        let counters = &self.ctx.counters;
        let mut done = Vec::new();
        for (key, flow) in &mut self.flows {
            flow.anchor_if_due(now, counters);
            if flow.is_done() {
                done.push(*key);
            }
        }
        for key in done {
            self.retire(key);
        }

        self.reap();
    }

    /// Force every flow into its terminal flush
    pub(crate) fn flush_all(&mut self) {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        for key in keys {
            self.retire(key);
        }
    }

    /// Join every remaining worker
    pub(crate) fn finish(mut self) {
        self.flush_all();
        for flow in mem::take(&mut self.retired) {
            flow.close();
        }
    }

    fn retire(&mut self, key: FlowKey) {
        let Some(mut flow) = self.flows.remove(&key) else {
            return;
        };
        flow.close_streams(&self.ctx.counters);
        flow.state = FlowState::Flushing;
        self.tombstones.insert(key, Tombstone {
            client: flow.conversation.client,
            request_end: flow.request.next_seq(),
            response_end: flow.response.next_seq(),
            retired_at: self.clock,
        });
        self.retired.push(flow);
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = mem::take(&mut self.retired)
            .into_iter()
            .partition(Flow::worker_finished);
        self.retired = running;
        for flow in finished {
            flow.close();
        }
    }
}

/// Pick the client side from the first segment of a flow. A handshake settles
/// it; without one the endpoint on the lower port is taken to be the server.
fn orient(first: &Segment) -> Conversation {
    let (client, server) = match (first.flags.syn, first.flags.ack) {
        (true, false) => (first.src, first.dst),
        (true, true) => (first.dst, first.src),
        _ if first.dst.port() < first.src.port() => (first.src, first.dst),
        _ if first.src.port() < first.dst.port() => (first.dst, first.src),
        _ => (first.src, first.dst),
    };
    Conversation { client, server }
}

fn open_flow<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    ctx: &'env WorkerContext,
    settings: FlowSettings,
    first: &Segment,
) -> Flow<'scope> {
    let conversation = orient(first);
    debug!(flow = %conversation, "New flow");
    Counters::incr(&ctx.counters.flows);

    let (writer, reader) = stream();
    let guard = ctx.barrier.register();
    let spawned = thread::Builder::new()
        .name(format!("flow-{}", conversation.client.port()))
        .spawn_scoped(scope, move || {
            let _guard = guard;
            let exit = extract_requests(conversation, reader, ctx);
            Counters::incr(&ctx.counters.workers_exited);
            exit
        });
    let worker = match spawned {
        Ok(handle) => {
            Counters::incr(&ctx.counters.workers_spawned);
            Some(handle)
        }
        Err(e) => {
            warn!(flow = %conversation, "Failed to spawn flow worker: {e}");
            None
        }
    };

    Flow {
        conversation,
        request: ReassemblyBuffer::new(settings.max_pending, settings.start_grace),
        response: ReassemblyBuffer::new(settings.max_pending, settings.start_grace),
        writer,
        last_activity: first.timestamp,
        state: FlowState::Active,
        worker,
    }
}
