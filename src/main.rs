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
mod cli;

use anyhow::Context;
use clap::Parser;
use reqcap::config::Config;
use reqcap::{Capture, HttpRequest};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "reqcap=debug,info",
        _ => "debug",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(default));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}

#[derive(Serialize)]
struct RequestRecord<'a> {
    client: String,
    server: String,
    method: &'a str,
    target: &'a str,
    version: String,
    url: Option<String>,
    headers: Vec<(&'a str, String)>,
    body: String,
}

impl<'a> From<&'a HttpRequest> for RequestRecord<'a> {
    fn from(req: &'a HttpRequest) -> Self {
        Self {
            client: req.client().to_string(),
            server: req.server().to_string(),
            method: req.method(),
            target: req.target(),
            version: req.version().to_string(),
            url: req.url(),
            headers: req
                .headers()
                .iter()
                .map(|(name, value)| (name, String::from_utf8_lossy(value).into_owned()))
                .collect(),
            body: String::from_utf8_lossy(req.body()).into_owned(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_tracing(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    let mut capture = Capture::from_config(&config).context("Failed to open packet source")?;
    let json = args.json;
    capture.handle_request(move |req| {
        if json {
            match serde_json::to_string(&RequestRecord::from(&req)) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Failed to serialize request: {e}"),
            }
        } else {
            info!(
                client = %req.client(),
                url = req.url().as_deref().unwrap_or(req.target()),
                body_len = req.body().len(),
                "{} {}",
                req.method(),
                req.target()
            );
        }
    });

    let stop = capture.stop_handle();
    ctrlc::set_handler(move || {
        info!("Interrupt received, stopping capture");
        stop.stop();
    })
    .context("Failed to set Ctrl-C handler")?;

    let stats = capture.start();
    if json {
        eprintln!("{}", serde_json::to_string(&stats)?);
    }
    Ok(())
}
