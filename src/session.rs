//! Capture session: the control loop tying a packet source to the flow table.

use crate::config::{CaptureConfig, Config, ReassemblyConfig};
use crate::error::Error;
use crate::flow_table::{FlowSettings, FlowTable};
use crate::http::HttpRequest;
use crate::http::extractor::{RequestHandler, WorkerContext};
use crate::packet::{Classified, classify};
use crate::source::{Next, PacketSource, PcapSource};
use crate::stats::{CaptureStats, Counters};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Cloneable handle ending a running capture at its next loop iteration
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A passive HTTP request capture over one packet source.
///
/// ```no_run
/// let mut capture = reqcap::Capture::from_port(8080)?;
/// capture.handle_request(|req| println!("{} {}", req.method(), req.target()));
/// let stats = capture.start();
/// println!("{} requests", stats.requests);
/// # Ok::<(), reqcap::Error>(())
/// ```
pub struct Capture<S = PcapSource> {
    source: S,
    config: ReassemblyConfig,
    handler: Option<RequestHandler>,
    stop: StopHandle,
}

impl Capture<PcapSource> {
    /// Replay a pcap file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let source = PcapSource::open_file(path.as_ref())?;
        Ok(Self::new(source, &ReassemblyConfig::default()))
    }

    /// Capture live on the configured interface
    pub fn from_interface(config: &CaptureConfig) -> Result<Self, Error> {
        let source = PcapSource::open_interface(config)?;
        Ok(Self::new(source, &ReassemblyConfig::default()))
    }

    /// Capture live TCP traffic to or from `port` on every interface
    pub fn from_port(port: u16) -> Result<Self, Error> {
        Self::from_interface(&CaptureConfig::for_port(port))
    }

    /// Open whichever source `config` names: a file if set, else an interface
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let source = match &config.capture.file {
            Some(file) => PcapSource::open_file(file)?,
            None => PcapSource::open_interface(&config.capture)?,
        };
        Ok(Self::new(source, &config.reassembly))
    }
}

impl<S: PacketSource> Capture<S> {
    pub fn new(source: S, config: &ReassemblyConfig) -> Self {
        Self {
            source,
            config: config.clone(),
            handler: None,
            stop: StopHandle::default(),
        }
    }

    /// Register the callback invoked for every complete request. It runs on the
    /// worker thread of the flow the request arrived on.
    pub fn handle_request<F>(&mut self, handler: F)
    where
        F: Fn(HttpRequest) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run until the source is exhausted or the capture is stopped. Returns once
    /// every flow worker has exited.
    pub fn start(&mut self) -> CaptureStats {
        let ctx = WorkerContext::new(self.handler.clone(), self.config.max_head_bytes);
        let settings = FlowSettings::from(&self.config);
        let flush_interval = self.config.flush_interval();
        let live = self.source.is_live();
        info!(live, "Starting capture");

        thread::scope(|scope| {
            let mut table = FlowTable::new(scope, &ctx, settings);
            let mut latest = Duration::ZERO;
            let mut last_tick = Instant::now();

            while !self.stop.is_stopped() {
                match self.source.next_packet() {
                    Next::Packet(packet) => {
                        Counters::incr(&ctx.counters.packets);
                        latest = latest.max(packet.timestamp);
                        if let Classified::Segment(segment) = classify(&packet) {
                            table.route(segment);
                        }
                    }
                    Next::Timeout => {}
                    Next::Exhausted => {
                        debug!("Packet source exhausted");
                        break;
                    }
                }

                if last_tick.elapsed() >= flush_interval {
                    let now = if live { wall_clock() } else { latest };
                    table.tick(now);
                    last_tick = Instant::now();
                    debug!(active = table.len(), "Flow table tick");
                }
            }

            debug!(active = table.len(), "Flushing remaining flows");
            table.flush_all();
            ctx.barrier.wait();
            table.finish();
        });

        let stats = ctx.counters.snapshot();
        info!(
            packets = stats.packets,
            flows = stats.flows,
            requests = stats.requests,
            malformed = stats.malformed_flows,
            idle_flushes = stats.idle_flushes,
            "Capture finished"
        );
        stats
    }
}

fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawPacket;
    use crate::testing::{FrameBuilder, frame};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Replay(VecDeque<Next>);

    impl Replay {
        fn packets(packets: impl IntoIterator<Item = RawPacket>) -> Self {
            Self(packets.into_iter().map(Next::Packet).collect())
        }
    }

    impl PacketSource for Replay {
        fn next_packet(&mut self) -> Next {
            self.0.pop_front().unwrap_or(Next::Exhausted)
        }
    }

    fn collect<S: PacketSource>(capture: &mut Capture<S>) -> Arc<Mutex<Vec<HttpRequest>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        capture.handle_request(move |req| sink.lock().unwrap().push(req));
        seen
    }

    #[test]
    fn test_replay_delivers_requests() {
        let source = Replay::packets([
            frame(0, b"GET / HTTP/1.1\r\nX:\r\n"),
            frame(20, b"\r\n"),
        ]);
        let mut capture = Capture::new(source, &ReassemblyConfig::default());
        let seen = collect(&mut capture);
        let stats = capture.start();

        assert_eq!(stats.packets, 2);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.workers_spawned, stats.workers_exited);
        assert_eq!(seen.lock().unwrap()[0].target(), "/");
    }

    #[test]
    fn test_timeouts_are_skipped() {
        let source = Replay(VecDeque::from([
            Next::Timeout,
            Next::Packet(frame(0, b"GET /t HTTP/1.1\r\n\r\n")),
            Next::Timeout,
        ]));
        let mut capture = Capture::new(source, &ReassemblyConfig::default());
        let seen = collect(&mut capture);
        let stats = capture.start();
        assert_eq!(stats.packets, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stopped_capture_reads_nothing() {
        let source = Replay::packets([frame(0, b"GET / HTTP/1.1\r\n\r\n")]);
        let mut capture = Capture::new(source, &ReassemblyConfig::default());
        capture.stop_handle().stop();
        let stats = capture.start();
        assert_eq!(stats.packets, 0);
        assert_eq!(stats.flows, 0);
    }

    #[test]
    fn test_idle_flush_uses_capture_clock() {
        let t0 = Duration::from_secs(1_700_000_000);
        let config = ReassemblyConfig {
            flush_interval_ms: 0,
            idle_timeout_secs: 5,
            ..ReassemblyConfig::default()
        };
        let source = Replay::packets([
            FrameBuilder::client().seq(0).syn().at(t0).build(b""),
            FrameBuilder::client().seq(1).at(t0).build(b"GET /x HTTP/1.1\r\n"),
            // unrelated flow, much later in capture time
            FrameBuilder::client()
                .client_port(40000)
                .seq(0)
                .at(t0 + Duration::from_secs(60))
                .build(b"GET /y HTTP/1.1\r\n\r\n"),
        ]);
        let mut capture = Capture::new(source, &config);
        let seen = collect(&mut capture);
        let stats = capture.start();

        assert_eq!(stats.idle_flushes, 1);
        assert_eq!(stats.flows, 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].target(), "/y");
    }
}
