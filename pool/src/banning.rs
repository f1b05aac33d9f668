/// IP banning by invalid/valid share ratio
///
/// Per-address counters are evaluated once their sum reaches the check
/// threshold; then either the address is banned or both counters reset.
/// Bans expire lazily on lookup and in the maintenance sweep, and are
/// broadcast to sibling pool processes over a Redis channel.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::config::BanningConfig;
use crate::metrics::prometheus as metrics;

/// Invalid-share count written for a hard infraction; enough to trip the
/// ratio check on the next evaluation.
const HARD_PENALTY: u64 = 999_999;

/// One-directional "ban this address" broadcast to sibling processes.
#[async_trait]
pub trait BanBus: Send + Sync {
    async fn publish_ban(&self, ip: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpStats {
    pub valid: u64,
    pub invalid: u64,
}

#[derive(Default)]
struct BanState {
    banned: HashMap<String, Instant>,
    stats: HashMap<String, IpStats>,
}

pub struct BanManager {
    cfg: BanningConfig,
    state: Mutex<BanState>,
    bus: Option<Arc<dyn BanBus>>,
}

impl BanManager {
    pub fn new(cfg: BanningConfig, bus: Option<Arc<dyn BanBus>>) -> Self {
        Self {
            cfg,
            state: Mutex::new(BanState::default()),
            bus,
        }
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    fn ban_time(&self) -> Duration {
        Duration::from_secs(self.cfg.time)
    }

    /// Whether `ip` is banned right now. An expired ban is dropped here.
    pub async fn is_banned(&self, ip: &str) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let mut state = self.state.lock().await;
        match state.banned.get(ip) {
            None => false,
            Some(at) if at.elapsed() < self.ban_time() => true,
            Some(_) => {
                state.banned.remove(ip);
                state.stats.remove(ip);
                tracing::info!("Ban dropped for {}", ip);
                false
            }
        }
    }

    /// Count one share for `ip`. Returns true when this share got the
    /// address banned; the caller then drops the session.
    pub async fn record_share(&self, ip: &str, valid: bool) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let banned = {
            let mut state = self.state.lock().await;
            let stats = state.stats.entry(ip.to_string()).or_default();
            if valid {
                stats.valid += 1;
            } else {
                stats.invalid += 1;
            }
            self.evaluate(&mut state, ip)
        };
        if banned {
            self.announce(ip);
        }
        banned
    }

    /// Hard infraction: the address goes straight over the ratio.
    pub async fn escalate(&self, ip: &str) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let banned = {
            let mut state = self.state.lock().await;
            state.stats.insert(ip.to_string(), IpStats { valid: 0, invalid: HARD_PENALTY });
            self.evaluate(&mut state, ip)
        };
        if banned {
            self.announce(ip);
        }
        banned
    }

    fn evaluate(&self, state: &mut BanState, ip: &str) -> bool {
        let Some(stats) = state.stats.get_mut(ip) else {
            return false;
        };
        if stats.valid + stats.invalid < self.cfg.check_threshold {
            return false;
        }
        // invalid / valid >= percent / 100, without dividing by zero
        if stats.invalid * 100 >= self.cfg.invalid_percent * stats.valid {
            state.banned.insert(ip.to_string(), Instant::now());
            true
        } else {
            *stats = IpStats::default();
            false
        }
    }

    fn announce(&self, ip: &str) {
        metrics::inc_bans();
        tracing::warn!("Banned {}", ip);
        if let Some(bus) = &self.bus {
            let bus = bus.clone();
            let ip = ip.to_string();
            tokio::spawn(async move {
                if let Err(e) = bus.publish_ban(&ip).await {
                    tracing::error!("Failed to broadcast ban for {}: {:#}", ip, e);
                }
            });
        }
    }

    /// Ban received from a sibling process.
    pub async fn apply_remote_ban(&self, ip: &str) {
        if !self.cfg.enabled {
            return;
        }
        self.state.lock().await.banned.insert(ip.to_string(), Instant::now());
        tracing::info!("Applied ban for {} from another pool process", ip);
    }

    /// Drop expired bans together with their counters, and counters of
    /// addresses that are neither banned nor behind a live session.
    pub async fn sweep(&self, live_ips: &HashSet<String>) -> usize {
        if !self.cfg.enabled {
            return 0;
        }
        let ban_time = self.ban_time();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .banned
            .iter()
            .filter(|(_, at)| at.elapsed() >= ban_time)
            .map(|(ip, _)| ip.clone())
            .collect();
        for ip in &expired {
            state.banned.remove(ip);
            state.stats.remove(ip);
            tracing::info!("Ban dropped for {}", ip);
        }

        let BanState { banned, stats } = &mut *state;
        let before = stats.len();
        stats.retain(|ip, _| banned.contains_key(ip) || live_ips.contains(ip));
        let orphaned = before - stats.len();
        if orphaned > 0 {
            tracing::debug!("Dropped share counters for {} departed addresses", orphaned);
        }
        expired.len()
    }

    pub async fn stats(&self, ip: &str) -> IpStats {
        self.state.lock().await.stats.get(ip).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BanMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: String,
    pub origin: String,
}

/// Ban bus over Redis pub/sub on `<coin>:bans`.
pub struct RedisBanBus {
    client: redis::Client,
    connection: RwLock<Option<redis::aio::ConnectionManager>>,
    channel: String,
    origin: String,
}

impl RedisBanBus {
    pub fn new(redis_url: &str, coin: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            channel: format!("{}:bans", coin),
            origin: uuid::Uuid::new_v4().to_string(),
        })
    }

    async fn get_connection(&self) -> Result<redis::aio::ConnectionManager> {
        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let manager = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("Failed to get connection manager: {}", e))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Apply bans published by other processes until the subscription
    /// drops; reconnects after a short pause.
    pub async fn listen(self: Arc<Self>, bans: Arc<BanManager>) {
        loop {
            if let Err(e) = self.listen_once(&bans).await {
                tracing::error!("Ban bus subscription failed: {:#}", e);
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn listen_once(&self, bans: &BanManager) -> Result<()> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(&self.channel).await?;
        tracing::info!("Subscribed to ban channel {}", self.channel);

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("Unreadable ban message: {}", e);
                    continue;
                }
            };
            match serde_json::from_str::<BanMessage>(&payload) {
                Ok(ban) if ban.kind == "banIP" && ban.origin != self.origin => {
                    bans.apply_remote_ban(&ban.ip).await;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Malformed ban message {}: {}", payload, e),
            }
        }
        Err(anyhow!("ban channel closed"))
    }
}

#[async_trait]
impl BanBus for RedisBanBus {
    async fn publish_ban(&self, ip: &str) -> Result<()> {
        let msg = BanMessage {
            kind: "banIP".to_string(),
            ip: ip.to_string(),
            origin: self.origin.clone(),
        };
        let mut conn = self.get_connection().await?;
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(serde_json::to_string(&msg)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to publish ban: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBus;

    fn cfg(threshold: u64, percent: u64) -> BanningConfig {
        BanningConfig {
            enabled: true,
            time: 600,
            invalid_percent: percent,
            check_threshold: threshold,
        }
    }

    #[tokio::test]
    async fn half_invalid_gets_banned() {
        let bus = Arc::new(RecordingBus::default());
        let bans = BanManager::new(cfg(10, 50), Some(bus.clone()));
        let mut banned = false;
        for i in 0..10 {
            banned = bans.record_share("1.2.3.4", i % 2 == 0).await;
        }
        assert!(banned);
        assert!(bans.is_banned("1.2.3.4").await);

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.published(), vec!["1.2.3.4".to_string()]);
    }

    #[tokio::test]
    async fn below_ratio_resets_counters() {
        let bans = BanManager::new(cfg(10, 50), None);
        for _ in 0..7 {
            assert!(!bans.record_share("1.2.3.4", true).await);
        }
        for _ in 0..3 {
            assert!(!bans.record_share("1.2.3.4", false).await);
        }
        assert!(!bans.is_banned("1.2.3.4").await);
        assert_eq!(bans.stats("1.2.3.4").await, IpStats::default());
    }

    #[tokio::test]
    async fn escalation_bans_immediately() {
        let bans = BanManager::new(cfg(30, 25), None);
        assert!(bans.escalate("5.6.7.8").await);
        assert!(bans.is_banned("5.6.7.8").await);
        assert!(!bans.is_banned("5.6.7.9").await);
    }

    #[tokio::test]
    async fn expired_ban_is_dropped() {
        let mut c = cfg(1, 50);
        c.time = 0;
        let bans = BanManager::new(c, None);
        assert!(bans.record_share("9.9.9.9", false).await);
        assert!(!bans.is_banned("9.9.9.9").await);

        assert!(bans.record_share("9.9.9.9", false).await);
        assert_eq!(bans.sweep(&HashSet::new()).await, 1);
        assert_eq!(bans.stats("9.9.9.9").await, IpStats::default());
    }

    #[tokio::test]
    async fn lapsed_ban_starts_from_clean_counters() {
        let mut c = cfg(1, 50);
        c.time = 0;
        let bans = BanManager::new(c, None);
        assert!(bans.escalate("4.4.4.4").await);

        assert!(!bans.is_banned("4.4.4.4").await);
        assert_eq!(bans.stats("4.4.4.4").await, IpStats::default());
        assert!(!bans.record_share("4.4.4.4", true).await);
        assert!(!bans.is_banned("4.4.4.4").await);
    }

    #[tokio::test]
    async fn sweep_forgets_counters_of_departed_addresses() {
        let bans = BanManager::new(cfg(100, 50), None);
        assert!(!bans.record_share("7.7.7.1", true).await);
        assert!(!bans.record_share("7.7.7.2", false).await);
        assert!(bans.escalate("7.7.7.3").await);

        let live: HashSet<String> = ["7.7.7.1".to_string()].into_iter().collect();
        assert_eq!(bans.sweep(&live).await, 0);

        assert_eq!(bans.stats("7.7.7.1").await, IpStats { valid: 1, invalid: 0 });
        assert_eq!(bans.stats("7.7.7.2").await, IpStats::default());
        assert_eq!(bans.stats("7.7.7.3").await.invalid, HARD_PENALTY);
        assert!(bans.is_banned("7.7.7.3").await);
    }

    #[tokio::test]
    async fn disabled_banning_is_inert() {
        let mut c = cfg(1, 1);
        c.enabled = false;
        let bans = BanManager::new(c, None);
        assert!(!bans.record_share("1.1.1.1", false).await);
        assert!(!bans.escalate("1.1.1.1").await);
        assert!(!bans.is_banned("1.1.1.1").await);
    }

    #[test]
    fn ban_message_wire_format() {
        let msg = BanMessage { kind: "banIP".into(), ip: "1.2.3.4".into(), origin: "a".into() };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v, serde_json::json!({"type": "banIP", "ip": "1.2.3.4", "origin": "a"}));
    }
}
