/// Block Template Manager - polls the daemon and owns the live template
///
/// Each timer tick walks a small state machine:
/// `CheckForce -> {GetTemplate | CheckCount} -> {GetTemplate | CheckHash} -> {GetTemplate | Done}`.
/// A template is promoted only when its previous-block hash differs from the
/// current one; the superseded template moves into a bounded history so
/// in-flight jobs can still be verified.

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time;

use super::codec::{BlockCodec, PREV_HASH_RANGE};
use super::rpc_client::{DaemonRpc, RawTemplate};
use crate::config::PoolServerConfig;
use crate::metrics::prometheus as metrics;

/// Superseded templates kept for share verification.
pub const TEMPLATE_HISTORY: usize = 3;

/// Bytes reserved in the template for extra-nonce (4) and instance id (3 + 1).
pub const RESERVE_SIZE: u32 = 8;

/// Callback type for template changes. The returned future is awaited
/// before the polling tick completes.
pub type TemplateChangeCallback = Arc<dyn Fn(Arc<BlockTemplate>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
pub struct BlockTemplate {
    /// Template blob with this process's instance id already written in.
    pub blob: Vec<u8>,
    pub difficulty: u64,
    pub height: u64,
    pub reserve_offset: usize,
    pub seed_hash: String,
    pub prev_hash: [u8; 32],
    extra_nonce: AtomicU32,
}

impl BlockTemplate {
    pub fn new(raw: &RawTemplate, instance_id: &[u8; 4]) -> Result<Self> {
        let mut blob = hex::decode(&raw.blocktemplate_blob)
            .map_err(|e| anyhow!("template blob is not hex: {}", e))?;

        let reserve_end = raw.reserved_offset + RESERVE_SIZE as usize;
        if blob.len() < PREV_HASH_RANGE.end || blob.len() < reserve_end {
            return Err(anyhow!(
                "template blob too short: {} bytes, reserved offset {}",
                blob.len(),
                raw.reserved_offset
            ));
        }

        let id_at = raw.reserved_offset + 4;
        blob[id_at..id_at + 3].copy_from_slice(&instance_id[..3]);

        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&blob[PREV_HASH_RANGE]);

        Ok(Self {
            blob,
            difficulty: raw.difficulty,
            height: raw.height,
            reserve_offset: raw.reserved_offset,
            seed_hash: raw.seed_hash.clone(),
            prev_hash,
            extra_nonce: AtomicU32::new(0),
        })
    }

    /// Template blob with `extra_nonce` written big-endian at the reserved offset.
    pub fn blob_with_extra_nonce(&self, extra_nonce: u32) -> Vec<u8> {
        let mut blob = self.blob.clone();
        blob[self.reserve_offset..self.reserve_offset + 4].copy_from_slice(&extra_nonce.to_be_bytes());
        blob
    }

    /// Reserve a fresh extra-nonce and return it with the hashing blob (hex)
    /// a miner should work on. Never hands out the same extra-nonce twice.
    pub fn next_blob(&self, codec: &dyn BlockCodec) -> Result<(u32, String)> {
        let extra_nonce = self.extra_nonce.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let converted = codec.convert_blob(&self.blob_with_extra_nonce(extra_nonce))?;
        Ok((extra_nonce, hex::encode(converted)))
    }

    pub fn extra_nonce(&self) -> u32 {
        self.extra_nonce.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct TemplateStore {
    current: Option<Arc<BlockTemplate>>,
    history: VecDeque<Arc<BlockTemplate>>,
}

/// Chain position last reported by the daemon.
#[derive(Default)]
struct PollState {
    counter: u64,
    height: u64,
    hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStep {
    CheckForce,
    CheckCount,
    CheckHash,
    GetTemplate,
    Done,
}

pub struct BlockTemplateManager {
    daemon: Arc<dyn DaemonRpc>,
    pool_address: String,
    update_interval: Duration,
    force_every: u64,
    instance_id: [u8; 4],
    templates: RwLock<TemplateStore>,
    poll: Mutex<PollState>,
    on_change: OnceLock<TemplateChangeCallback>,
    startup: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl BlockTemplateManager {
    pub fn new(daemon: Arc<dyn DaemonRpc>, cfg: &PoolServerConfig) -> Self {
        let instance_id: [u8; 4] = rand::random();
        let update_interval = Duration::from_millis(cfg.block_refresh_interval_ms);

        tracing::info!(
            "BlockTemplateManager: interval={}ms, force every {} ticks, instance {}",
            update_interval.as_millis(),
            cfg.block_refresh_force,
            hex::encode(instance_id)
        );

        Self {
            daemon,
            pool_address: cfg.pool_address.clone(),
            update_interval,
            force_every: cfg.block_refresh_force.max(1),
            instance_id,
            templates: RwLock::new(TemplateStore::default()),
            poll: Mutex::new(PollState::default()),
            on_change: OnceLock::new(),
            startup: std::sync::Mutex::new(None),
        }
    }

    /// Register the callback run on every promotion. Only the first
    /// registration takes effect.
    pub fn on_template_change<F>(&self, callback: F)
    where
        F: Fn(Arc<BlockTemplate>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        if self.on_change.set(Arc::new(callback)).is_err() {
            tracing::warn!("Template change callback already registered");
        }
    }

    /// Resolves after the first successful polling tick.
    pub fn startup_signal(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.startup.lock() {
            *slot = Some(tx);
        }
        rx
    }

    /// Start the polling loop. Ticks never overlap: a tick waiting on the
    /// daemon delays the next one.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(manager.update_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.tick().await;
            }
        })
    }

    /// One full pass of the polling state machine.
    pub async fn tick(&self) -> bool {
        let res = self.run(PollStep::CheckForce).await;
        self.finish(res)
    }

    /// Fetch a template right away, skipping the change checks.
    pub async fn refresh_now(&self) -> bool {
        let res = self.run(PollStep::GetTemplate).await;
        self.finish(res)
    }

    fn finish(&self, res: Result<()>) -> bool {
        match res {
            Ok(()) => {
                let gate = self.startup.lock().ok().and_then(|mut slot| slot.take());
                if let Some(tx) = gate {
                    let _ = tx.send(());
                }
                true
            }
            Err(e) => {
                metrics::inc_template_fetch_errors();
                tracing::error!("Block template polling failed: {:#}", e);
                let waiting = self.startup.lock().map(|slot| slot.is_some()).unwrap_or(false);
                if waiting {
                    tracing::error!("Could not start pool");
                }
                false
            }
        }
    }

    async fn run(&self, mut step: PollStep) -> Result<()> {
        let mut poll = self.poll.lock().await;
        while step != PollStep::Done {
            step = self.step(&mut poll, step).await?;
        }
        Ok(())
    }

    async fn step(&self, poll: &mut PollState, step: PollStep) -> Result<PollStep> {
        match step {
            PollStep::CheckForce => {
                let forced = poll.counter % self.force_every == 0;
                poll.counter = poll.counter.wrapping_add(1);
                Ok(if forced { PollStep::GetTemplate } else { PollStep::CheckCount })
            }
            PollStep::CheckCount => {
                let count = self
                    .daemon
                    .get_block_count()
                    .await
                    .map_err(|e| anyhow!("error polling getblockcount: {:#}", e))?;
                if count == poll.height {
                    return Ok(PollStep::CheckHash);
                }
                tracing::info!("Blockchain height changed to {}, updating template", count);
                Ok(PollStep::GetTemplate)
            }
            PollStep::CheckHash => {
                let hash = self
                    .daemon
                    .get_block_hash(poll.height.saturating_sub(1))
                    .await
                    .map_err(|e| anyhow!("error polling on_getblockhash: {:#}", e))?;
                if hash == poll.hash {
                    return Ok(PollStep::Done);
                }
                tracing::info!("Blockchain hash changed to {}, updating template", hash);
                Ok(PollStep::GetTemplate)
            }
            PollStep::GetTemplate => {
                let raw = self
                    .daemon
                    .get_block_template(RESERVE_SIZE, &self.pool_address)
                    .await
                    .map_err(|e| anyhow!("error polling getblocktemplate: {:#}", e))?;
                poll.height = raw.height;
                poll.hash = raw.prev_hash.clone();
                self.maybe_promote(&raw).await?;
                Ok(PollStep::Done)
            }
            PollStep::Done => Ok(PollStep::Done),
        }
    }

    /// Promote `raw` unless it builds on the same previous block as the
    /// current template.
    async fn maybe_promote(&self, raw: &RawTemplate) -> Result<()> {
        let template = Arc::new(BlockTemplate::new(raw, &self.instance_id)?);

        {
            let mut store = self.templates.write().await;
            if let Some(current) = &store.current {
                if current.prev_hash == template.prev_hash {
                    return Ok(());
                }
            }
            if let Some(old) = store.current.take() {
                store.history.push_back(old);
            }
            while store.history.len() > TEMPLATE_HISTORY {
                store.history.pop_front();
            }
            store.current = Some(template.clone());
        }

        tracing::info!(
            "New block to mine at height {} w/ difficulty of {}",
            template.height,
            template.difficulty
        );
        metrics::set_template_height(template.height);
        metrics::inc_template_updates();

        if let Some(callback) = self.on_change.get() {
            callback(template).await;
        }
        Ok(())
    }

    pub async fn current(&self) -> Option<Arc<BlockTemplate>> {
        self.templates.read().await.current.clone()
    }

    /// Live or retained template at `height`.
    pub async fn find(&self, height: u64) -> Option<Arc<BlockTemplate>> {
        let store = self.templates.read().await;
        match &store.current {
            Some(t) if t.height == height => Some(t.clone()),
            _ => store.history.iter().rev().find(|t| t.height == height).cloned(),
        }
    }

    pub async fn current_height(&self) -> Option<u64> {
        self.templates.read().await.current.as_ref().map(|t| t.height)
    }

    pub async fn history_len(&self) -> usize {
        self.templates.read().await.history.len()
    }

    pub fn instance_id(&self) -> [u8; 4] {
        self.instance_id
    }
}
