//! In-memory stand-ins for the daemon, stats store and ban bus.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use std::sync::Mutex;

use crate::banning::BanBus;
use crate::blockchain::codec::{write_varint, PowHasher};
use crate::blockchain::rpc_client::{DaemonRpc, RawTemplate};
use crate::difficulty::diff1;
use crate::shares::storage::{BlockRecord, ShareRecord, ShareTag, StatsStore};

/// Well-formed block: 43-byte header, a version 2 coinbase whose extra
/// carries an 8-byte reserve, then `tx_count` transaction hashes. Returns the
/// blob and the reserve offset.
pub fn block_blob(height: u64, marker: u8, tx_count: u8) -> (Vec<u8>, usize) {
    let mut blob = vec![16, 16];
    blob.extend(write_varint(1_700_000_000));
    blob.extend_from_slice(&[marker; 32]);
    blob.extend_from_slice(&[0; 4]);

    blob.extend(write_varint(2));
    blob.extend(write_varint(height + 60));
    blob.extend_from_slice(&[1, 0xff]);
    blob.extend(write_varint(height));
    blob.push(1);
    blob.extend(write_varint(600_000_000_000));
    blob.push(0x03);
    blob.extend_from_slice(&[0xaa; 32]);
    blob.push(0x5c);
    blob.extend(write_varint(43));
    blob.push(0x01);
    blob.extend_from_slice(&[0xbb; 32]);
    blob.extend_from_slice(&[0x02, 0x08]);
    let reserved_offset = blob.len();
    blob.extend_from_slice(&[0; 8]);
    blob.push(0);

    blob.extend(write_varint(u64::from(tx_count)));
    for i in 0..tx_count {
        blob.extend_from_slice(&[i + 1; 32]);
    }
    (blob, reserved_offset)
}

/// Template whose previous-block hash is `[marker; 32]`.
pub fn raw_template(height: u64, marker: u8, difficulty: u64) -> RawTemplate {
    let (blob, reserved_offset) = block_blob(height, marker, 2);
    RawTemplate {
        blocktemplate_blob: hex::encode(&blob),
        difficulty,
        height,
        reserved_offset,
        seed_hash: hex::encode([0x5e; 32]),
        prev_hash: hex::encode([marker; 32]),
    }
}

/// Little-endian hash whose difficulty is exactly `difficulty`.
pub fn hash_for_difficulty(difficulty: u64) -> [u8; 32] {
    let value = diff1() / BigUint::from(difficulty);
    let mut out = [0u8; 32];
    let bytes = value.to_bytes_le();
    out[..bytes.len()].copy_from_slice(&bytes);
    out
}

pub struct FixedHasher(pub [u8; 32]);

impl PowHasher for FixedHasher {
    fn hash(&self, _blob: &[u8], _seed: &[u8]) -> Result<[u8; 32]> {
        Ok(self.0)
    }
}

pub struct FailingHasher;

impl PowHasher for FailingHasher {
    fn hash(&self, _blob: &[u8], _seed: &[u8]) -> Result<[u8; 32]> {
        Err(anyhow!("hashing backend unavailable"))
    }
}

struct DaemonState {
    template: RawTemplate,
    count: u64,
    hash: String,
    failing: bool,
    submit_ok: bool,
    template_calls: usize,
    submitted: Vec<String>,
}

pub struct FakeDaemon {
    state: Mutex<DaemonState>,
}

impl FakeDaemon {
    pub fn new(template: RawTemplate) -> Self {
        Self {
            state: Mutex::new(DaemonState {
                count: template.height,
                hash: template.prev_hash.clone(),
                template,
                failing: false,
                submit_ok: true,
                template_calls: 0,
                submitted: Vec::new(),
            }),
        }
    }

    pub fn set_template(&self, template: RawTemplate) {
        self.state.lock().unwrap().template = template;
    }

    pub fn set_chain(&self, count: u64, hash: String) {
        let mut state = self.state.lock().unwrap();
        state.count = count;
        state.hash = hash;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    pub fn set_submit_ok(&self, ok: bool) {
        self.state.lock().unwrap().submit_ok = ok;
    }

    pub fn template_calls(&self) -> usize {
        self.state.lock().unwrap().template_calls
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl DaemonRpc for FakeDaemon {
    async fn get_block_template(&self, _reserve_size: u32, _wallet_address: &str) -> Result<RawTemplate> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(anyhow!("daemon offline"));
        }
        state.template_calls += 1;
        Ok(state.template.clone())
    }

    async fn get_block_count(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(anyhow!("daemon offline"));
        }
        Ok(state.count)
    }

    async fn get_block_hash(&self, _height: u64) -> Result<String> {
        let state = self.state.lock().unwrap();
        if state.failing {
            return Err(anyhow!("daemon offline"));
        }
        Ok(state.hash.clone())
    }

    async fn submit_block(&self, blob_hex: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(blob_hex.to_string());
        if state.submit_ok {
            Ok(())
        } else {
            Err(anyhow!("Block not accepted"))
        }
    }
}

#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<String>>,
}

impl RecordingBus {
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BanBus for RecordingBus {
    async fn publish_ban(&self, ip: &str) -> Result<()> {
        self.published.lock().unwrap().push(ip.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    Worker(String),
    Share { share: ShareRecord, block: Option<BlockRecord> },
    Infraction { share: ShareRecord, tag: ShareTag },
}

#[derive(Default)]
pub struct MemoryStats {
    events: Mutex<Vec<StatsEvent>>,
}

impl MemoryStats {
    pub fn events(&self) -> Vec<StatsEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatsStore for MemoryStats {
    async fn add_worker(&self, login: &str) -> Result<()> {
        self.events.lock().unwrap().push(StatsEvent::Worker(login.to_string()));
        Ok(())
    }

    async fn record_share(&self, share: &ShareRecord, block: Option<&BlockRecord>) -> Result<()> {
        self.events.lock().unwrap().push(StatsEvent::Share {
            share: share.clone(),
            block: block.cloned(),
        });
        Ok(())
    }

    async fn record_infraction(&self, share: &ShareRecord, tag: ShareTag) -> Result<()> {
        self.events.lock().unwrap().push(StatsEvent::Infraction { share: share.clone(), tag });
        Ok(())
    }
}
