//! tvrelay-proxy: HTTP gateway for live TV channels.
//!
//! Every viewer of a channel shares a single upstream pull (a subprocess or
//! an upstream HTTP stream). Upstreams start on the first viewer and stop
//! when the last one leaves.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

mod config;
mod logging;
mod streamer;
mod web;

use config::{ConfigFile, DEFAULT_CONFIG_FILE, DEFAULT_LISTEN};
use tvrelay::StreamBroker;
use web::WebState;

/// tvrelay-proxy - share live TV upstreams between viewers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Maximum concurrent upstream pulls (0 = unlimited)
    #[arg(short = 'm', long)]
    max_upstreams: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match ConfigFile::load(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the config file
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs")));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    use log::{error, info};

    let listen_addr = match args.listen {
        Some(addr) => addr,
        None => file_config
            .server
            .listen
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN)
            .parse::<SocketAddr>()?,
    };
    let max_upstreams = args
        .max_upstreams
        .or(file_config.broker.max_upstreams)
        .unwrap_or(0);
    let broker_config = file_config.broker.broker_config();

    info!("tvrelay-proxy starting...");
    info!("  Listen address: {}", listen_addr);
    info!("  Channels: {}", file_config.channels.len());
    if max_upstreams > 0 {
        info!("  Max upstreams: {}", max_upstreams);
    } else {
        info!("  Max upstreams: unlimited");
    }
    info!(
        "  Replay buffer: {} KiB, queue depth: {}, acquire timeout: {:?}",
        broker_config.relay.replay_capacity / 1024,
        broker_config.relay.queue_depth,
        broker_config.acquire_timeout
    );
    for source in &file_config.sources {
        info!("  Source {}: max {} streams", source.name, source.max_streams);
    }

    let broker = StreamBroker::new(broker_config);
    let sweeper = broker.spawn_sweeper(file_config.broker.sweep_interval());

    let http = reqwest::Client::builder()
        .user_agent(concat!("tvrelay-proxy/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let web_state = Arc::new(WebState::new(broker.clone(), &file_config, max_upstreams, http));

    // Streams only end once the broker closes, so close it before the
    // server waits for open connections to drain.
    let shutdown_broker = broker.clone();
    let shutdown = async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown_broker.close().await;
    };

    let result = web::start_web_server(listen_addr, web_state, shutdown).await;
    if let Err(e) = &result {
        error!("Web server error: {}", e);
    }

    broker.close().await;
    sweeper.abort();
    info!("tvrelay-proxy stopped");

    result
}
