use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("installing prometheus exporter")?;

    tracing::info!(%listen, "Prometheus exporter serving /metrics");
    metrics::gauge!("mdfeed_up").set(1.0);
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    tracing::debug!(%listen, "Built without metrics-exporter; counters are not exported");
    Ok(())
}
