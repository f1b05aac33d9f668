// CryptoNote pool: block template polling, job dispatch, share validation

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cn_pool::banning::{BanBus, BanManager, RedisBanBus};
use cn_pool::blockchain::{pow_hasher, BlockTemplateManager, CryptonoteCodec, DaemonClient};
use cn_pool::config::Config;
use cn_pool::metrics::prometheus as metrics;
use cn_pool::session::SessionRegistry;
use cn_pool::shares::RedisStatsStore;
use cn_pool::stratum::StratumServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = Config::load()?;
    tracing::info!(
        "Starting {} pool ({}), daemon {}:{}",
        cfg.coin,
        cfg.algo,
        cfg.daemon.host,
        cfg.daemon.port
    );

    let hasher = pow_hasher(&cfg.algo)?;
    let daemon = Arc::new(DaemonClient::new(&cfg.daemon));
    let stats = Arc::new(RedisStatsStore::new(&cfg.redis_url, &cfg.coin)?);
    if let Err(e) = stats.ping().await {
        // Share writes retry the connection lazily.
        tracing::warn!("Redis not reachable yet: {:#}", e);
    }

    let bus = Arc::new(RedisBanBus::new(&cfg.redis_url, &cfg.coin)?);
    let bans = Arc::new(BanManager::new(
        cfg.pool_server.banning.clone(),
        Some(bus.clone() as Arc<dyn BanBus>),
    ));
    if bans.enabled() {
        tokio::spawn(bus.clone().listen(bans.clone()));
    }

    let sessions = Arc::new(SessionRegistry::new());
    let templates = Arc::new(BlockTemplateManager::new(daemon.clone(), &cfg.pool_server));

    let server = Arc::new(StratumServer::new(
        &cfg,
        daemon,
        templates.clone(),
        Arc::new(CryptonoteCodec),
        hasher,
        stats,
        bans,
        sessions,
    )?);

    let weak = Arc::downgrade(&server);
    templates.on_template_change(move |template| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(server) = weak.upgrade() {
                server.broadcast_new_job(template).await;
            }
        })
    });

    if let Some(listen) = cfg.metrics_listen.clone() {
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(&listen).await {
                tracing::error!("Metrics endpoint failed: {:#}", e);
            }
        });
    }

    // Ports open only once a template is in hand.
    let ready = templates.startup_signal();
    templates.start();
    ready.await?;
    tracing::info!("Block template ready, opening miner ports");

    server.run().await
}
