use core::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

/// Counters shared between the capture loop and the flow workers
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) packets: AtomicU64,
    pub(crate) segments: AtomicU64,
    pub(crate) flows: AtomicU64,
    pub(crate) idle_flushes: AtomicU64,
    pub(crate) lossy_streams: AtomicU64,
    pub(crate) response_bytes: AtomicU64,
    pub(crate) requests: AtomicU64,
    pub(crate) malformed_flows: AtomicU64,
    pub(crate) workers_spawned: AtomicU64,
    pub(crate) workers_exited: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CaptureStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CaptureStats {
            packets: load(&self.packets),
            segments: load(&self.segments),
            flows: load(&self.flows),
            idle_flushes: load(&self.idle_flushes),
            lossy_streams: load(&self.lossy_streams),
            response_bytes: load(&self.response_bytes),
            requests: load(&self.requests),
            malformed_flows: load(&self.malformed_flows),
            workers_spawned: load(&self.workers_spawned),
            workers_exited: load(&self.workers_exited),
        }
    }
}

/// Totals for one capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames pulled from the source
    pub packets: u64,
    /// TCP segments that reached a flow
    pub segments: u64,
    pub flows: u64,
    /// Flows closed by the idle reaper
    pub idle_flushes: u64,
    /// Directions that ended with undelivered bytes
    pub lossy_streams: u64,
    /// Reassembled bytes sent by servers, observed but not decoded
    pub response_bytes: u64,
    pub requests: u64,
    /// Flows whose request stream stopped parsing
    pub malformed_flows: u64,
    pub workers_spawned: u64,
    pub workers_exited: u64,
}
