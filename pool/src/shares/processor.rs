/// Share Processing Pipeline
///
/// Complete flow for one `submit`:
/// 1. Job lookup, nonce format, duplicate guard
/// 2. Template lookup by job height (live or retained)
/// 3. Rebuild the block, hash it, compare with the miner's reported hash
/// 4. Block candidate: submit to the daemon, close the round on success
/// 5. Worker share: record, feed vardiff, update ban and trust counters
///
/// Stats writes are spawned and never block the reply.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;

use super::storage::{BlockRecord, ShareRecord, ShareTag, StatsStore};
use crate::banning::BanManager;
use crate::blockchain::codec::{BlockCodec, PowHasher};
use crate::blockchain::rpc_client::DaemonRpc;
use crate::blockchain::template_manager::{BlockTemplate, BlockTemplateManager};
use crate::config::ShareTrustConfig;
use crate::difficulty;
use crate::error::PoolError;
use crate::metrics::prometheus as metrics;
use crate::session::{unix_now, Job, MinerSession, SessionRegistry};
use crate::stratum::protocol::SubmitParams;

/// Exactly eight lowercase hex characters.
pub fn is_valid_nonce(nonce: &str) -> bool {
    nonce.len() == 8 && nonce.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Lowercase hex only, like the nonce.
fn parse_hash(result: &str) -> Option<[u8; 32]> {
    if result.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let bytes = hex::decode(result).ok()?;
    bytes.try_into().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    Valid,
    Trusted,
    Block,
}

pub struct ShareProcessor {
    templates: Arc<BlockTemplateManager>,
    daemon: Arc<dyn DaemonRpc>,
    codec: Arc<dyn BlockCodec>,
    hasher: Arc<dyn PowHasher>,
    stats: Arc<dyn StatsStore>,
    bans: Arc<BanManager>,
    sessions: Arc<SessionRegistry>,
    trust: ShareTrustConfig,
}

impl ShareProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        templates: Arc<BlockTemplateManager>,
        daemon: Arc<dyn DaemonRpc>,
        codec: Arc<dyn BlockCodec>,
        hasher: Arc<dyn PowHasher>,
        stats: Arc<dyn StatsStore>,
        bans: Arc<BanManager>,
        sessions: Arc<SessionRegistry>,
        trust: ShareTrustConfig,
    ) -> Self {
        if trust.enabled {
            tracing::info!(
                "Share trust enabled: threshold={}, min={}%, step={}%",
                trust.threshold,
                trust.min,
                trust.step_down
            );
        }
        Self {
            templates,
            daemon,
            codec,
            hasher,
            stats,
            bans,
            sessions,
            trust,
        }
    }

    /// Handle a `submit` for an authenticated session.
    pub async fn submit(&self, session: &mut MinerSession, params: &SubmitParams) -> Result<ShareKind, PoolError> {
        let nonce = params.nonce.as_deref().unwrap_or("");
        let job_id = params.job_id.as_deref().unwrap_or("");

        let Some((difficulty, height)) = session.find_job(job_id).map(|j| (j.difficulty, j.height)) else {
            return Err(PoolError::InvalidJobId);
        };

        if !is_valid_nonce(nonce) {
            tracing::warn!("Malformed nonce {:?} from {}", nonce, session.label());
            self.reject(session, difficulty, height, ShareTag::MalformedNonce);
            if self.bans.escalate(&session.ip).await {
                self.drop_session(session).await;
            }
            return Err(PoolError::DuplicateShare);
        }

        let job = {
            let Some(job) = session.find_job_mut(job_id) else {
                return Err(PoolError::InvalidJobId);
            };
            if job.submissions.iter().any(|n| n == nonce) {
                tracing::warn!("Duplicate share {} on job {} from {}", nonce, job_id, session.label());
                self.reject(session, difficulty, height, ShareTag::Duplicate);
                self.invalid(session).await;
                return Err(PoolError::DuplicateShare);
            }
            job.submissions.push(nonce.to_string());
            job.clone()
        };

        let Some(template) = self.templates.find(job.height).await else {
            tracing::warn!("Block expired, height {} from {}", job.height, session.label());
            self.reject(session, job.difficulty, job.height, ShareTag::BlockExpired);
            return Err(PoolError::BlockExpired);
        };

        if job.difficulty == 0 {
            tracing::info!("Invalid job difficulty from {}", session.label());
            return Err(PoolError::InvalidDifficulty);
        }

        let reported = params.result.as_deref().and_then(parse_hash);

        if let Some(reported) = &reported {
            if self.trusted(session) && !difficulty::meets_difficulty(reported, template.difficulty) {
                if !difficulty::meets_difficulty(reported, job.difficulty) {
                    tracing::warn!(
                        "Rejected trusted share of {} below difficulty {} from {}",
                        difficulty::hash_difficulty(reported),
                        job.difficulty,
                        session.label()
                    );
                    self.reject(session, job.difficulty, job.height, ShareTag::LowDifficulty);
                    self.invalid(session).await;
                    return Err(PoolError::BadShare);
                }
                self.accept(session, &job, None);
                if self.bans.record_share(&session.ip, true).await {
                    self.drop_session(session).await;
                }
                tracing::info!(
                    "Accepted trusted share at difficulty {} from {}",
                    job.difficulty,
                    session.label()
                );
                return Ok(ShareKind::Trusted);
            }
        }

        let (block_blob, hash) = match self.compute(&template, &job, nonce) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Could not rebuild block for {}: {:#}", session.label(), e);
                self.reject(session, job.difficulty, job.height, ShareTag::HashMismatch);
                self.invalid(session).await;
                return Err(PoolError::BadShare);
            }
        };

        if reported != Some(hash) {
            tracing::warn!("Bad hash from miner {}", session.label());
            self.reject(session, job.difficulty, job.height, ShareTag::HashMismatch);
            self.invalid(session).await;
            return Err(PoolError::BadShare);
        }

        let share_diff = difficulty::hash_difficulty(&hash);

        if difficulty::meets_difficulty(&hash, template.difficulty) {
            let block = self.submit_block(session, &template, &job, &block_blob).await;
            self.accept(session, &job, block);
            self.valid(session).await;
            return Ok(ShareKind::Block);
        }

        if !difficulty::meets_difficulty(&hash, job.difficulty) {
            tracing::warn!("Rejected low difficulty share of {} from {}", share_diff, session.label());
            self.reject(session, job.difficulty, job.height, ShareTag::LowDifficulty);
            self.invalid(session).await;
            return Err(PoolError::BadShare);
        }

        self.accept(session, &job, None);
        self.valid(session).await;
        tracing::info!(
            "Accepted valid share at difficulty {}/{} from {}",
            job.difficulty,
            share_diff,
            session.label()
        );
        Ok(ShareKind::Valid)
    }

    fn compute(&self, template: &BlockTemplate, job: &Job, nonce: &str) -> anyhow::Result<(Vec<u8>, [u8; 32])> {
        let nonce_bytes: [u8; 4] = hex::decode(nonce)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("nonce must be 4 bytes"))?;
        let blob = template.blob_with_extra_nonce(job.extra_nonce);
        let block = self.codec.construct_block_blob(&blob, &nonce_bytes)?;
        let converted = self.codec.convert_blob(&block)?;
        let seed = hex::decode(&template.seed_hash)?;
        let hash = self.hasher.hash(&converted, &seed)?;
        Ok((block, hash))
    }

    /// Submit a block candidate. Returns the block to record when the
    /// daemon accepted it.
    async fn submit_block(
        &self,
        session: &MinerSession,
        template: &BlockTemplate,
        job: &Job,
        block_blob: &[u8],
    ) -> Option<BlockRecord> {
        metrics::inc_block_submit_attempts();
        match self.daemon.submit_block(&hex::encode(block_blob)).await {
            Ok(()) => {
                let block_id = match self.codec.block_id(block_blob) {
                    Ok(id) => hex::encode(id),
                    Err(e) => {
                        tracing::error!("Could not compute block id: {:#}", e);
                        String::new()
                    }
                };
                tracing::info!(
                    "Block {} found at height {} by miner {} - submit",
                    block_id.get(..6).unwrap_or(&block_id),
                    job.height,
                    session.label()
                );
                metrics::inc_blocks_found();

                let templates = self.templates.clone();
                tokio::spawn(async move {
                    templates.refresh_now().await;
                });

                Some(BlockRecord {
                    hash: block_id,
                    height: job.height,
                    network_difficulty: template.difficulty,
                })
            }
            Err(e) => {
                // The hash was checked locally, so this is a valid share the
                // daemon turned down, usually a race with a new chain tip.
                metrics::inc_block_submit_rejected();
                tracing::error!(
                    "Error submitting block at height {} from {}, share type: valid - {:#}",
                    job.height,
                    session.label(),
                    e
                );
                None
            }
        }
    }

    fn trusted(&self, session: &MinerSession) -> bool {
        if !self.trust.enabled {
            return false;
        }
        match &session.trust {
            Some(trust) => trust.trusts(rand::random::<f64>()),
            None => false,
        }
    }

    fn record(&self, session: &MinerSession, difficulty: u64, height: u64) -> ShareRecord {
        ShareRecord {
            login: session.login.clone(),
            pass: session.pass.clone(),
            difficulty,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    fn accept(&self, session: &mut MinerSession, job: &Job, block: Option<BlockRecord>) {
        metrics::inc_accepted();
        let record = self.record(session, job.difficulty, job.height);
        let stats = self.stats.clone();
        spawn_stats(async move { stats.record_share(&record, block.as_ref()).await });
        session.record_share_time(unix_now());
    }

    fn reject(&self, session: &MinerSession, difficulty: u64, height: u64, tag: ShareTag) {
        metrics::inc_rejected(tag.reason());
        let record = self.record(session, difficulty, height);
        let stats = self.stats.clone();
        spawn_stats(async move { stats.record_infraction(&record, tag).await });
    }

    /// A locally verified good share.
    async fn valid(&self, session: &mut MinerSession) {
        if self.trust.enabled {
            if let Some(trust) = session.trust.as_mut() {
                trust.reward(&self.trust);
            }
        }
        if self.bans.record_share(&session.ip, true).await {
            self.drop_session(session).await;
        }
    }

    async fn invalid(&self, session: &mut MinerSession) {
        if self.trust.enabled {
            if let Some(trust) = session.trust.as_mut() {
                trust.penalize(&self.trust);
            }
        }
        if self.bans.record_share(&session.ip, false).await {
            self.drop_session(session).await;
        }
    }

    async fn drop_session(&self, session: &MinerSession) {
        tracing::warn!("Dropping session of banned miner {}", session.label());
        self.sessions.remove(&session.id).await;
    }
}

fn spawn_stats<F>(fut: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            metrics::inc_storage_errors();
            tracing::error!("Failed to record share data: {:#}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::banning::IpStats;
    use crate::blockchain::codec::{CryptonoteCodec, KeccakHasher};
    use crate::config::{BanningConfig, PoolServerConfig};
    use crate::session::ShareTrust;
    use crate::test_support::{
        hash_for_difficulty, raw_template, FailingHasher, FakeDaemon, FixedHasher, MemoryStats, StatsEvent,
    };

    struct Fixture {
        processor: ShareProcessor,
        templates: Arc<BlockTemplateManager>,
        daemon: Arc<FakeDaemon>,
        stats: Arc<MemoryStats>,
        bans: Arc<BanManager>,
        sessions: Arc<SessionRegistry>,
    }

    async fn fixture(hasher: Arc<dyn PowHasher>, banning: BanningConfig, trust: ShareTrustConfig) -> Fixture {
        let daemon = Arc::new(FakeDaemon::new(raw_template(500, 1, 1_000)));
        let templates = Arc::new(BlockTemplateManager::new(daemon.clone(), &PoolServerConfig::default()));
        assert!(templates.tick().await);
        let stats = Arc::new(MemoryStats::default());
        let bans = Arc::new(BanManager::new(banning, None));
        let sessions = Arc::new(SessionRegistry::new());
        let processor = ShareProcessor::new(
            templates.clone(),
            daemon.clone(),
            Arc::new(CryptonoteCodec),
            hasher,
            stats.clone(),
            bans.clone(),
            sessions.clone(),
            trust,
        );
        Fixture { processor, templates, daemon, stats, bans, sessions }
    }

    fn no_bans() -> BanningConfig {
        BanningConfig { enabled: false, ..BanningConfig::default() }
    }

    fn session(difficulty: u64) -> MinerSession {
        MinerSession::new("4Addr".into(), "77".into(), "10.1.1.1".into(), difficulty, false, 16, None)
    }

    async fn cut(f: &Fixture, s: &mut MinerSession) -> String {
        let tpl = f.templates.current().await.unwrap();
        s.cut_job(&tpl, &CryptonoteCodec, "rx/0").unwrap().job_id
    }

    fn submit(job_id: &str, nonce: &str, result: &str) -> SubmitParams {
        SubmitParams {
            id: None,
            job_id: Some(job_id.to_string()),
            nonce: Some(nonce.to_string()),
            result: Some(result.to_string()),
        }
    }

    #[test]
    fn nonce_format() {
        assert!(is_valid_nonce("0000abcd"));
        assert!(!is_valid_nonce("1234567"));
        assert!(!is_valid_nonce("0000ABCD"));
        assert!(!is_valid_nonce("0000abcd00"));
        assert!(!is_valid_nonce("0000abcg"));
    }

    #[test]
    fn result_hash_must_be_lowercase() {
        assert_eq!(parse_hash(&"ab".repeat(32)), Some([0xab; 32]));
        assert_eq!(parse_hash(&"AB".repeat(32)), None);
        assert_eq!(parse_hash("abcd"), None);
    }

    #[tokio::test]
    async fn threshold_hash_is_share_and_block() {
        let hash = hash_for_difficulty(1_000);
        let f = fixture(Arc::new(FixedHasher(hash)), no_bans(), ShareTrustConfig::default()).await;
        let mut s = session(100);
        let job_id = cut(&f, &mut s).await;

        let kind = f.processor.submit(&mut s, &submit(&job_id, "00000001", &hex::encode(hash))).await;
        assert_eq!(kind, Ok(ShareKind::Block));
        assert_eq!(f.daemon.submitted().len(), 1);
        assert_eq!(s.share_times.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let events = f.stats.events();
        assert!(events.iter().any(|e| matches!(e, StatsEvent::Share { block: Some(_), .. })));
    }

    #[tokio::test]
    async fn rejected_block_still_counts_as_share() {
        let hash = hash_for_difficulty(1_000);
        let f = fixture(Arc::new(FixedHasher(hash)), no_bans(), ShareTrustConfig::default()).await;
        f.daemon.set_submit_ok(false);
        let mut s = session(100);
        let job_id = cut(&f, &mut s).await;

        let kind = f.processor.submit(&mut s, &submit(&job_id, "00000001", &hex::encode(hash))).await;
        assert_eq!(kind, Ok(ShareKind::Block));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let events = f.stats.events();
        assert!(events.iter().any(|e| matches!(e, StatsEvent::Share { block: None, .. })));
    }

    #[tokio::test]
    async fn duplicate_nonce_penalized_once() {
        let cfg = BanningConfig { enabled: true, time: 600, invalid_percent: 50, check_threshold: 100 };
        let f = fixture(Arc::new(KeccakHasher), cfg, ShareTrustConfig::default()).await;
        let mut s = session(1);
        let job_id = cut(&f, &mut s).await;

        // Difficulty 1 accepts any correct hash.
        let tpl = f.templates.current().await.unwrap();
        let job = s.find_job(&job_id).unwrap().clone();
        let (_, hash) = f.processor.compute(&tpl, &job, "0000002a").unwrap();
        let params = submit(&job_id, "0000002a", &hex::encode(hash));

        assert!(f.processor.submit(&mut s, &params).await.is_ok());
        assert_eq!(f.processor.submit(&mut s, &params).await, Err(PoolError::DuplicateShare));

        let stats = f.bans.stats("10.1.1.1").await;
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.invalid, 1);
    }

    #[tokio::test]
    async fn malformed_nonce_bans_and_drops_session() {
        let cfg = BanningConfig { enabled: true, time: 600, invalid_percent: 25, check_threshold: 30 };
        let f = fixture(Arc::new(KeccakHasher), cfg, ShareTrustConfig::default()).await;
        let handle = f.sessions.insert(session(1)).await;
        let mut s = handle.lock().await;
        let id = s.id.clone();
        let job_id = cut(&f, &mut s).await;

        let res = f.processor.submit(&mut s, &submit(&job_id, "0000ABCD", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::DuplicateShare));
        assert!(f.bans.is_banned("10.1.1.1").await);
        assert!(f.sessions.get(&id).await.is_none());

        let res = f.processor.submit(&mut s, &submit(&job_id, "1234567", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::DuplicateShare));
    }

    #[tokio::test]
    async fn unknown_job_and_mismatched_hash() {
        let f = fixture(Arc::new(KeccakHasher), no_bans(), ShareTrustConfig::default()).await;
        let mut s = session(1);
        let job_id = cut(&f, &mut s).await;

        let res = f.processor.submit(&mut s, &submit("nope", "00000001", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::InvalidJobId));

        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &"ab".repeat(32))).await;
        assert_eq!(res, Err(PoolError::BadShare));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f
            .stats
            .events()
            .iter()
            .any(|e| matches!(e, StatsEvent::Infraction { tag: ShareTag::HashMismatch, .. })));
    }

    #[tokio::test]
    async fn low_difficulty_share_is_bad() {
        // Hash good for difficulty 10 only; job asks for 50.
        let hash = hash_for_difficulty(10);
        let f = fixture(Arc::new(FixedHasher(hash)), no_bans(), ShareTrustConfig::default()).await;
        let mut s = session(50);
        let job_id = cut(&f, &mut s).await;

        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &hex::encode(hash))).await;
        assert_eq!(res, Err(PoolError::BadShare));
    }

    #[tokio::test]
    async fn expired_template_rejected() {
        let f = fixture(Arc::new(KeccakHasher), no_bans(), ShareTrustConfig::default()).await;
        let mut s = session(1);
        let job_id = cut(&f, &mut s).await;

        for i in 0..4u8 {
            f.daemon.set_template(raw_template(501 + i as u64, 10 + i, 1_000));
            assert!(f.templates.refresh_now().await);
        }

        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::BlockExpired));
    }

    #[tokio::test]
    async fn trusted_share_skips_hashing() {
        let trust_cfg = ShareTrustConfig { enabled: true, min: 0.0, step_down: 100.0, threshold: 0, penalty: 0 };
        let f = fixture(Arc::new(KeccakHasher), no_bans(), trust_cfg.clone()).await;
        let mut s = session(1);
        s.trust = Some(ShareTrust { probability: -1.0, threshold: 0, penalty: 0 });
        let job_id = cut(&f, &mut s).await;

        // Wrong hash, but trusted and not a block candidate.
        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &"ff".repeat(32))).await;
        assert_eq!(res, Ok(ShareKind::Trusted));
    }

    #[tokio::test]
    async fn trusted_share_below_job_difficulty_is_bad() {
        let cfg = BanningConfig { enabled: true, time: 600, invalid_percent: 50, check_threshold: 100 };
        let trust_cfg = ShareTrustConfig { enabled: true, min: 0.0, step_down: 100.0, threshold: 0, penalty: 0 };
        let f = fixture(Arc::new(KeccakHasher), cfg, trust_cfg).await;
        let mut s = session(1_000_000);
        s.trust = Some(ShareTrust { probability: -1.0, threshold: 0, penalty: 0 });
        let job_id = cut(&f, &mut s).await;

        // ff..ff meets difficulty 1 only.
        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &"ff".repeat(32))).await;
        assert_eq!(res, Err(PoolError::BadShare));
        assert_eq!(f.bans.stats("10.1.1.1").await, IpStats { valid: 0, invalid: 1 });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let events = f.stats.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, StatsEvent::Infraction { tag: ShareTag::LowDifficulty, .. })));
        assert!(!events.iter().any(|e| matches!(e, StatsEvent::Share { .. })));
    }

    #[tokio::test]
    async fn unknown_job_with_bad_nonce_is_not_penalized() {
        let cfg = BanningConfig { enabled: true, time: 600, invalid_percent: 25, check_threshold: 1 };
        let f = fixture(Arc::new(KeccakHasher), cfg, ShareTrustConfig::default()).await;
        let handle = f.sessions.insert(session(1)).await;
        let mut s = handle.lock().await;
        let id = s.id.clone();
        cut(&f, &mut s).await;

        let res = f.processor.submit(&mut s, &submit("no-such-job", "XYZ", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::InvalidJobId));
        assert!(!f.bans.is_banned("10.1.1.1").await);
        assert_eq!(f.bans.stats("10.1.1.1").await, IpStats::default());
        assert!(f.sessions.get(&id).await.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f.stats.events().is_empty());
    }

    #[tokio::test]
    async fn hashing_failure_counts_against_miner() {
        let cfg = BanningConfig { enabled: true, time: 600, invalid_percent: 50, check_threshold: 100 };
        let f = fixture(Arc::new(FailingHasher), cfg, ShareTrustConfig::default()).await;
        let mut s = session(1);
        let job_id = cut(&f, &mut s).await;

        let res = f.processor.submit(&mut s, &submit(&job_id, "00000001", &"00".repeat(32))).await;
        assert_eq!(res, Err(PoolError::BadShare));
        assert_eq!(f.bans.stats("10.1.1.1").await.invalid, 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f
            .stats
            .events()
            .iter()
            .any(|e| matches!(e, StatsEvent::Infraction { tag: ShareTag::HashMismatch, .. })));
    }
}
