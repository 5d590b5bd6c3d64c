use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

pub const RESYNCS: &str = "lobx_feed_resyncs_total";
pub const EVENTS: &str = "lobx_feed_events_total";
pub const DISPATCH_REJECTIONS: &str = "lobx_feed_dispatch_rejections_total";
pub const LISTENER_STATE: &str = "lobx_feed_listener_state";

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
}

pub fn describe_metrics() {
    metrics::describe_counter!(RESYNCS, "Full resyncs per instrument, labelled by trigger");
    metrics::describe_counter!(EVENTS, "Refreshes published per instrument");
    metrics::describe_counter!(DISPATCH_REJECTIONS, "Pool requests rejected because every worker was rate limited");
    metrics::describe_gauge!(LISTENER_STATE, "Listener state: 0 disconnected .. 3 live, 4 resyncing, 5 stopped");
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    tracing::info!(%addr, "Prometheus exporter listening");
    metrics::gauge!("lobx_feed_up").set(1.0);
    describe_metrics();
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    tracing::debug!(%addr, "Built without metrics-exporter, metrics stay in-process");
    describe_metrics();
    Ok(())
}
