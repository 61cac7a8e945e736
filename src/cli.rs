use clap::Parser;
use reqcap::config::Config;
use std::path::PathBuf;

/// reqcap: passive HTTP request capture
#[derive(Parser, Debug)]
#[command(name = "reqcap", version, about)]
pub(crate) struct Cli {
    /// Replay a pcap file instead of capturing live
    #[arg(short, long)]
    pub(crate) file: Option<PathBuf>,

    /// Interface to capture on ("any" for all interfaces)
    #[arg(short, long)]
    pub(crate) interface: Option<String>,

    /// Only capture TCP traffic on this port
    #[arg(short, long)]
    pub(crate) port: Option<u16>,

    /// BPF filter expression, overrides --port
    #[arg(long)]
    pub(crate) filter: Option<String>,

    /// Snapshot length (max bytes per packet to capture)
    #[arg(long)]
    pub(crate) snaplen: Option<i32>,

    /// Kernel capture buffer size in bytes
    #[arg(long)]
    pub(crate) buffer_size: Option<i32>,

    /// Seconds without traffic before a flow is flushed
    #[arg(long)]
    pub(crate) idle_timeout: Option<u64>,

    /// Milliseconds between idle-flow sweeps
    #[arg(long)]
    pub(crate) flush_interval: Option<u64>,

    /// TOML config file; flags given on the command line win
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,

    /// Print each request as a JSON line on stdout
    #[arg(long, default_value_t = false)]
    pub(crate) json: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,
}

impl Cli {
    /// Layer the command line over `config`
    pub(crate) fn apply(&self, config: &mut Config) {
        let capture = &mut config.capture;
        if let Some(file) = &self.file {
            capture.file = Some(file.clone());
        }
        if let Some(interface) = &self.interface {
            capture.interface.clone_from(interface);
        }
        if self.port.is_some() {
            capture.port = self.port;
        }
        if self.filter.is_some() {
            capture.filter.clone_from(&self.filter);
        }
        if let Some(snaplen) = self.snaplen {
            capture.snaplen = snaplen;
        }
        if let Some(buffer_size) = self.buffer_size {
            capture.buffer_size = buffer_size;
        }

        let reassembly = &mut config.reassembly;
        if let Some(secs) = self.idle_timeout {
            reassembly.idle_timeout_secs = secs;
        }
        if let Some(ms) = self.flush_interval {
            reassembly.flush_interval_ms = ms;
        }
    }
}
