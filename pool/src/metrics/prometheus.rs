//! Process metrics, registered once in a private registry and served as
//! Prometheus text at `GET /metrics`.

use axum::{http::header, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

struct PoolMetrics {
    registry: Registry,
    shares_accepted: IntCounter,
    shares_rejected: IntCounterVec,
    blocks_found: IntCounter,
    block_submit_attempts: IntCounter,
    block_submit_rejected: IntCounter,
    vardiff_retargets: IntCounter,
    job_broadcasts: IntCounter,
    rpc_requests: IntCounter,
    rpc_errors: IntCounter,
    template_updates: IntCounter,
    template_fetch_errors: IntCounter,
    bans: IntCounter,
    flood_disconnects: IntCounter,
    storage_errors: IntCounter,
    connections: IntGauge,
    sessions: IntGauge,
    template_height: IntGauge,
}

static METRICS: OnceLock<PoolMetrics> = OnceLock::new();

impl PoolMetrics {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let shares_rejected =
            IntCounterVec::new(Opts::new("shares_rejected_total", "Rejected shares by reason"), &["reason"])?;
        registry.register(Box::new(shares_rejected.clone()))?;

        Ok(Self {
            shares_accepted: counter("shares_accepted_total", "Accepted shares")?,
            shares_rejected,
            blocks_found: counter("blocks_found_total", "Blocks accepted by the daemon")?,
            block_submit_attempts: counter("block_submit_attempts_total", "Block candidates submitted")?,
            block_submit_rejected: counter("block_submit_rejected_total", "Block submits the daemon refused")?,
            vardiff_retargets: counter("vardiff_retargets_total", "Difficulty retargets staged")?,
            job_broadcasts: counter("job_broadcasts_total", "Template promotions pushed to miners")?,
            rpc_requests: counter("daemon_rpc_requests_total", "Daemon RPC calls")?,
            rpc_errors: counter("daemon_rpc_errors_total", "Failed daemon RPC calls")?,
            template_updates: counter("block_template_updates_total", "Template promotions")?,
            template_fetch_errors: counter("block_template_fetch_errors_total", "Failed polling ticks")?,
            bans: counter("ip_bans_total", "Client addresses banned")?,
            flood_disconnects: counter("flood_disconnects_total", "Connections closed by the line-length guard")?,
            storage_errors: counter("storage_errors_total", "Failed stats store writes")?,
            connections: gauge("stratum_connections", "Open miner connections")?,
            sessions: gauge("stratum_sessions", "Logged-in miner sessions")?,
            template_height: gauge("block_template_height", "Height of the live block template")?,
            registry,
        })
    }
}

/// `None` only if a metric definition is rejected, which leaves metrics off
/// without affecting the pool.
fn metrics() -> Option<&'static PoolMetrics> {
    if let Some(m) = METRICS.get() {
        return Some(m);
    }
    match PoolMetrics::build() {
        Ok(m) => Some(METRICS.get_or_init(|| m)),
        Err(e) => {
            tracing::error!("Metrics disabled: {}", e);
            None
        }
    }
}

fn with(f: impl FnOnce(&PoolMetrics)) {
    if let Some(m) = metrics() {
        f(m);
    }
}

pub fn inc_accepted() {
    with(|m| m.shares_accepted.inc());
}

pub fn inc_rejected(reason: &str) {
    with(|m| m.shares_rejected.with_label_values(&[reason]).inc());
}

pub fn inc_blocks_found() {
    with(|m| m.blocks_found.inc());
}

pub fn inc_block_submit_attempts() {
    with(|m| m.block_submit_attempts.inc());
}

pub fn inc_block_submit_rejected() {
    with(|m| m.block_submit_rejected.inc());
}

pub fn inc_vardiff_retarget() {
    with(|m| m.vardiff_retargets.inc());
}

pub fn inc_job_broadcasts() {
    with(|m| m.job_broadcasts.inc());
}

pub fn inc_rpc_requests() {
    with(|m| m.rpc_requests.inc());
}

pub fn inc_rpc_errors() {
    with(|m| m.rpc_errors.inc());
}

pub fn inc_template_updates() {
    with(|m| m.template_updates.inc());
}

pub fn inc_template_fetch_errors() {
    with(|m| m.template_fetch_errors.inc());
}

pub fn inc_bans() {
    with(|m| m.bans.inc());
}

pub fn inc_flood_disconnects() {
    with(|m| m.flood_disconnects.inc());
}

pub fn inc_storage_errors() {
    with(|m| m.storage_errors.inc());
}

pub fn inc_connections() {
    with(|m| m.connections.inc());
}

pub fn dec_connections() {
    with(|m| m.connections.dec());
}

pub fn set_sessions(count: usize) {
    with(|m| m.sessions.set(count as i64));
}

pub fn set_template_height(height: u64) {
    with(|m| m.template_height.set(height as i64));
}

pub fn render() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&m.registry.gather(), &mut buf) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn metrics_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], render())
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve `GET /metrics` on `listen` until the process exits.
pub async fn serve(listen: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!("Metrics endpoint listening on {}", listen);
    axum::serve(listener, router()).await?;
    Ok(())
}
