/// Redis share recording
///
/// Key layout (every key prefixed with `<coin>:`):
/// - `shares:roundCurrent` hash, login -> summed share difficulty
/// - `workerHashrate` zset of `difficulty:login:pass:millis:tag`, scored by unix seconds
/// - `hashrate` zset of `difficulty:login:millis`
/// - `workers:<login>` hash with `hashes` and `lastShare`; `workers` set
/// - on a block: `stats.lastBlockFound`, `shares:roundCurrent` renamed to
///   `shares:round<height>`, and `blocks:candidates` scored by height

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Tag appended to each worker hashrate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareTag {
    Accepted = 0,
    HashMismatch = 1,
    LowDifficulty = 2,
    Duplicate = 3,
    BlockExpired = 4,
    MalformedNonce = 6,
}

impl ShareTag {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Label used for the rejected-shares metric.
    pub fn reason(self) -> &'static str {
        match self {
            ShareTag::Accepted => "accepted",
            ShareTag::HashMismatch => "hash_mismatch",
            ShareTag::LowDifficulty => "low_difficulty",
            ShareTag::Duplicate => "duplicate",
            ShareTag::BlockExpired => "block_expired",
            ShareTag::MalformedNonce => "malformed_nonce",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareRecord {
    pub login: String,
    pub pass: String,
    /// Difficulty of the job the share was submitted against.
    pub difficulty: u64,
    pub height: u64,
    pub timestamp_ms: i64,
}

impl ShareRecord {
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms / 1000
    }

    /// Entry for the `workerHashrate` series.
    pub fn worker_entry(&self, tag: ShareTag) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.difficulty,
            self.login,
            self.pass,
            self.timestamp_ms,
            tag.code()
        )
    }

    pub fn pool_entry(&self) -> String {
        format!("{}:{}:{}", self.difficulty, self.login, self.timestamp_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub hash: String,
    pub height: u64,
    pub network_difficulty: u64,
}

/// Stats collaborator fed by share processing. Failures are logged by the
/// caller, never retried.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn add_worker(&self, login: &str) -> Result<()>;

    /// Accepted share; with `block`, also closes the round.
    async fn record_share(&self, share: &ShareRecord, block: Option<&BlockRecord>) -> Result<()>;

    /// Rejected share, tagged with why.
    async fn record_infraction(&self, share: &ShareRecord, tag: ShareTag) -> Result<()>;
}

pub struct RedisStatsStore {
    client: redis::Client,
    connection: RwLock<Option<redis::aio::ConnectionManager>>,
    coin: String,
}

impl RedisStatsStore {
    pub fn new(redis_url: &str, coin: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            coin: coin.to_string(),
        })
    }

    /// Get async connection (lazy initialization)
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

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.coin, suffix)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| anyhow!("Redis ping failed: {}", e))?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for RedisStatsStore {
    async fn add_worker(&self, login: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("SADD")
            .arg(self.key("workers"))
            .arg(login)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to add worker: {}", e))
    }

    async fn record_share(&self, share: &ShareRecord, block: Option<&BlockRecord>) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let secs = share.timestamp_secs();
        let worker_key = self.key(&format!("workers:{}", share.login));
        let round_current = self.key("shares:roundCurrent");

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HINCRBY").arg(&round_current).arg(&share.login).arg(share.difficulty).ignore()
            .cmd("ZADD").arg(self.key("workerHashrate")).arg(secs).arg(share.worker_entry(ShareTag::Accepted)).ignore()
            .cmd("ZADD").arg(self.key("hashrate")).arg(secs).arg(share.pool_entry()).ignore()
            .cmd("HINCRBY").arg(&worker_key).arg("hashes").arg(share.difficulty).ignore()
            .cmd("HSET").arg(&worker_key).arg("lastShare").arg(secs).ignore();

        let Some(block) = block else {
            return pipe
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow!("Failed to insert share data: {}", e));
        };

        let round_key = self.key(&format!("shares:round{}", share.height));
        pipe.cmd("HSET").arg(self.key("stats")).arg("lastBlockFound").arg(share.timestamp_ms).ignore()
            .cmd("RENAME").arg(&round_current).arg(&round_key).ignore()
            .cmd("HGETALL").arg(&round_key);

        let (round,): (HashMap<String, u64>,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to insert block share data: {}", e))?;
        let total_shares: u64 = round.values().sum();

        let candidate = format!("{}:{}:{}:{}", block.hash, secs, block.network_difficulty, total_shares);
        redis::cmd("ZADD")
            .arg(self.key("blocks:candidates"))
            .arg(block.height)
            .arg(candidate)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed inserting block candidate {}: {}", block.hash, e))
    }

    async fn record_infraction(&self, share: &ShareRecord, tag: ShareTag) -> Result<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("ZADD")
            .arg(self.key("workerHashrate"))
            .arg(share.timestamp_secs())
            .arg(share.worker_entry(tag))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to record share infraction: {}", e))
    }
}
