//! typeahead-server - serve live prefix search over WebSocket
//!
//! Usage: typeahead-server [--addr 127.0.0.1:4040] [--words words.txt] [--metrics]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use typeahead::config::{
    ServerConfig, SessionConfig, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_PAGE_SIZE, DEFAULT_READ_LIMIT,
};
use typeahead::metrics::Metrics;
use typeahead::prefix_index::PrefixIndex;
use typeahead::server::Server;
use typeahead::session_registry::SessionRegistry;

#[derive(Parser, Debug)]
#[command(name = "typeahead-server")]
#[command(about = "Live prefix search over WebSocket")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4040")]
    addr: SocketAddr,

    /// Newline-delimited dictionary to index
    #[arg(long, default_value = "words.txt")]
    words: PathBuf,

    /// Results per page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Drop a connection after this many seconds without a pong or data
    #[arg(long, default_value_t = 10)]
    pong_wait_secs: u64,

    /// Drop a connection whose socket accepts no data for this many seconds
    #[arg(long, default_value_t = 10)]
    write_wait_secs: u64,

    /// Rendered pages queued per connection before handlers wait
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    outbound_capacity: usize,

    /// Do not send the empty-prefix page when a client connects
    #[arg(long)]
    no_initial_search: bool,

    /// Collect metrics and log periodic snapshots
    #[arg(long)]
    metrics: bool,

    /// Seconds between metrics snapshots
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            addr: args.addr,
            words_path: args.words,
            session: SessionConfig {
                page_size: args.page_size,
                pong_wait: Duration::from_secs(args.pong_wait_secs.max(1)),
                write_wait: Duration::from_secs(args.write_wait_secs.max(1)),
                read_limit: DEFAULT_READ_LIMIT,
                outbound_capacity: args.outbound_capacity,
                initial_search: !args.no_initial_search,
            },
            metrics: args.metrics,
            metrics_interval: Duration::from_secs(args.metrics_interval_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from(Args::parse());
    info!("Starting typeahead-server v{}", env!("CARGO_PKG_VERSION"));

    let index = PrefixIndex::<()>::load(&config.words_path)
        .with_context(|| format!("failed to load dictionary {:?}", config.words_path))?;
    info!(keys = index.len(), path = ?config.words_path, "dictionary loaded");

    let mut registry = SessionRegistry::new(index, config.session.clone());
    if config.metrics {
        info!("Metrics collection enabled");
        let metrics = Arc::new(Metrics::new());
        spawn_metrics_reporter(Arc::clone(&metrics), config.metrics_interval);
        registry = registry.with_metrics(metrics);
    }
    let registry = Arc::new(registry);

    let server = Server::bind(config.addr, Arc::clone(&registry))
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone())?;

    server.run(shutdown).await;
    info!("Exiting");
    Ok(())
}

/// Cancel `shutdown` on the first SIGINT/SIGTERM; exit immediately on the
/// second.
fn install_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    thread::spawn(move || {
        for sig in signals.forever() {
            if shutdown.is_cancelled() {
                warn!(signal = sig, "second signal, exiting without cleanup");
                std::process::exit(1);
            }
            info!(signal = sig, "received signal, closing connections");
            shutdown.cancel();
        }
    });
    Ok(())
}

fn spawn_metrics_reporter(metrics: Arc<Metrics>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match serde_json::to_string(&metrics.snapshot()) {
                Ok(json) => info!(target: "typeahead::metrics", "{}", json),
                Err(e) => warn!("failed to serialize metrics: {}", e),
            }
        }
    });
}
