/// Miner sessions
///
/// One `MinerSession` per successful `login`. Each session sits behind its
/// own mutex so requests for the same session, and template broadcasts
/// touching it, are applied one at a time.

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::blockchain::codec::BlockCodec;
use crate::blockchain::template_manager::BlockTemplate;
use crate::config::ShareTrustConfig;
use crate::difficulty;
use crate::stratum::protocol::{MinerJob, StratumPush};
use crate::vardiff::{Retarget, ShareTimeRing, VarDiff};

/// Outstanding jobs remembered per session.
pub const MAX_JOBS: usize = 4;

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub extra_nonce: u32,
    pub height: u64,
    pub difficulty: u64,
    /// Nonces already submitted against this job.
    pub submissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareTrust {
    pub probability: f64,
    pub threshold: i64,
    pub penalty: i64,
}

impl ShareTrust {
    pub fn new(cfg: &ShareTrustConfig) -> Self {
        Self {
            probability: 1.0,
            threshold: cfg.threshold,
            penalty: 0,
        }
    }

    /// A locally verified valid share.
    pub fn reward(&mut self, cfg: &ShareTrustConfig) {
        let min = cfg.min / 100.0;
        self.probability = (self.probability - cfg.step_down / 100.0).max(min);
        self.threshold -= 1;
        self.penalty -= 1;
    }

    pub fn penalize(&mut self, cfg: &ShareTrustConfig) {
        self.probability = 1.0;
        self.penalty = cfg.penalty;
    }

    /// Whether a share may skip local hashing, given a uniform draw in `[0, 1)`.
    pub fn trusts(&self, draw: f64) -> bool {
        self.threshold <= 0 && self.penalty <= 0 && draw > self.probability
    }
}

#[derive(Debug)]
pub struct MinerSession {
    pub id: String,
    pub login: String,
    /// Hex-encoded password, used as the worker label.
    pub pass: String,
    pub ip: String,
    pub difficulty: u64,
    pub pending_difficulty: Option<u64>,
    pub last_difficulty: Option<u64>,
    /// Difficulty pinned by the login suffix; never retargeted.
    pub fixed_difficulty: bool,
    pub share_times: ShareTimeRing,
    /// Unix seconds of the last accepted share.
    pub last_share_time: u64,
    pub last_beat: Instant,
    pub last_job_height: Option<u64>,
    pub trust: Option<ShareTrust>,
    jobs: VecDeque<Job>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl MinerSession {
    pub fn new(
        login: String,
        pass: String,
        ip: String,
        difficulty: u64,
        fixed_difficulty: bool,
        ring_size: usize,
        trust: Option<ShareTrust>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            login,
            pass,
            ip,
            difficulty,
            pending_difficulty: None,
            last_difficulty: None,
            fixed_difficulty,
            share_times: ShareTimeRing::new(ring_size),
            last_share_time: unix_now(),
            last_beat: Instant::now(),
            last_job_height: None,
            trust,
            jobs: VecDeque::with_capacity(MAX_JOBS + 1),
            outbound: None,
        }
    }

    /// Attach the connection's writer so broadcasts can reach this miner.
    pub fn with_outbound(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.outbound = Some(tx);
        self
    }

    /// `login@ip`, for log lines.
    pub fn label(&self) -> String {
        format!("{}@{}", self.login, self.ip)
    }

    pub fn heartbeat(&mut self) {
        self.last_beat = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_beat.elapsed() > timeout
    }

    /// Stage a new difficulty if share timing calls for one.
    pub fn retarget(&mut self, vardiff: &VarDiff, now: u64) -> Option<u64> {
        let since_last = now.saturating_sub(self.last_share_time);
        match vardiff.retarget(&self.share_times, self.difficulty, since_last) {
            Retarget::Unchanged => None,
            Retarget::Staged { difficulty, reset_last_share } => {
                self.pending_difficulty = Some(difficulty);
                self.share_times.clear();
                if reset_last_share {
                    self.last_share_time = now;
                }
                Some(difficulty)
            }
        }
    }

    /// Apply any pending difficulty and return the job target for it.
    pub fn target_hex(&mut self) -> String {
        if let Some(pending) = self.pending_difficulty.take() {
            self.last_difficulty = Some(self.difficulty);
            self.difficulty = pending;
        }
        difficulty::target_hex(self.difficulty)
    }

    /// Job for `getjob`: a placeholder when the miner already works on this
    /// height and nothing changed.
    pub fn get_job(&mut self, template: &BlockTemplate, codec: &dyn BlockCodec, algo: &str) -> Result<MinerJob> {
        if self.last_job_height == Some(template.height) && self.pending_difficulty.is_none() {
            return Ok(MinerJob::placeholder());
        }
        self.cut_job(template, codec, algo)
    }

    /// Cut a fresh job from `template` and remember it in the ledger.
    pub fn cut_job(&mut self, template: &BlockTemplate, codec: &dyn BlockCodec, algo: &str) -> Result<MinerJob> {
        let (extra_nonce, blob) = template.next_blob(codec)?;
        self.last_job_height = Some(template.height);
        let target = self.target_hex();

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            extra_nonce,
            height: template.height,
            difficulty: self.difficulty,
            submissions: Vec::new(),
        };
        let job_id = job.id.clone();

        self.jobs.push_back(job);
        while self.jobs.len() > MAX_JOBS {
            self.jobs.pop_front();
        }

        Ok(MinerJob {
            id: Some(self.id.clone()),
            blob,
            seed_hash: Some(template.seed_hash.clone()),
            job_id,
            algo: Some(algo.to_string()),
            target,
        })
    }

    pub fn find_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn find_job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Feed an accepted share's arrival time into the vardiff ring.
    pub fn record_share_time(&mut self, now: u64) {
        self.share_times.append(now.saturating_sub(self.last_share_time));
        self.last_share_time = now;
    }

    /// Push an unsolicited job. Returns false once the connection is gone.
    pub fn push_job(&self, job: &MinerJob) -> bool {
        let Some(tx) = &self.outbound else {
            return false;
        };
        match serde_json::to_string(&StratumPush::job(job)) {
            Ok(line) => tx.send(line).is_ok(),
            Err(_) => false,
        }
    }
}

pub type SessionHandle = Arc<Mutex<MinerSession>>;

/// Process-wide session map.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, session: MinerSession) -> SessionHandle {
        let id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, handle.clone());
        handle
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All live sessions, taken without holding the map lock afterwards.
    pub async fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Drop sessions with no heartbeat within `timeout`.
    pub async fn sweep_timed_out(&self, timeout: Duration) -> usize {
        let entries: Vec<(String, SessionHandle)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, s)| (id.clone(), s.clone())).collect()
        };

        let mut to_remove = Vec::new();
        for (id, handle) in entries {
            let session = handle.lock().await;
            if session.is_timed_out(timeout) {
                tracing::debug!("Miner timed out {}", session.label());
                to_remove.push(id);
            }
        }

        let count = to_remove.len();
        if count > 0 {
            let mut sessions = self.sessions.write().await;
            for id in to_remove {
                sessions.remove(&id);
            }
            tracing::info!("Cleaned up {} timed-out sessions", count);
        }
        count
    }
}
