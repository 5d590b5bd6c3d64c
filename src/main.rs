use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use lobx_feed::config::FeedConfig;
use lobx_feed::dispatch::{DispatchPool, MarketDataExecutor};
use lobx_feed::market_data::adapters::hyperliquid::{HyperliquidQuery, HyperliquidTransport};
use lobx_feed::market_data::FeedRouter;
use lobx_feed::telemetry;

/// Normalized Hyperliquid book and trade feed, written to stdout as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "lobx-feed", version)]
struct Cli {
    /// Config file (toml/json/yaml). Defaults to ./lobx-feed.* when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Instrument to stream; repeat for several. Overrides the configured list.
    #[arg(long = "symbol")]
    symbols: Vec<String>,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,

    /// Prometheus listen address (only with the metrics-exporter feature).
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log);

    let mut cfg = FeedConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if !cli.symbols.is_empty() {
        cfg.instruments = cli.symbols.clone();
    }
    telemetry::init_metrics(cli.metrics_addr)?;

    let addresses = cfg.dispatch.workers.iter().map(|w| w.local_address).collect::<Vec<_>>();
    let egress = HyperliquidQuery::workers(&cfg.venue.info_url, &addresses).context("building REST workers")?;
    let pool = Arc::new(DispatchPool::new(egress, cfg.dispatch.limits, cfg.dispatch.request_timeout));
    let executor = MarketDataExecutor::spawn(pool, cfg.dispatch.weights);

    let transport = Arc::new(HyperliquidTransport::new(cfg.venue.ws_url.clone()));
    let mut router = FeedRouter::new(transport, executor, cfg.listener.clone());
    let (tx, mut rx) = mpsc::channel(cfg.listener.event_buffer);

    info!(instruments = ?cfg.instruments, workers = addresses.len(), "Starting feed");
    for (symbol, e) in router.start(&cfg.instruments, tx).await {
        warn!(instrument = %symbol, error = %e, "Skipped instrument");
    }
    if router.running() == 0 {
        anyhow::bail!("no instrument could be started");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                router.shutdown().await;
                break;
            }
            event = rx.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            exited = router.join_next() => match exited {
                Some((symbol, Err(e))) => error!(instrument = %symbol, error = %e, "Listener gave up"),
                Some((symbol, Ok(()))) => info!(instrument = %symbol, "Listener finished"),
                None => break,
            },
        }
        if router.running() == 0 {
            break;
        }
    }

    // whatever was published before the last listener exited
    while let Ok(event) = rx.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
