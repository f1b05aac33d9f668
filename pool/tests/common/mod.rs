#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use futures::StreamExt;

use cn_pool::banning::BanManager;
use cn_pool::blockchain::codec::{encode_address, write_varint, PowHasher, NONCE_OFFSET};
use cn_pool::blockchain::{BlockTemplateManager, CryptonoteCodec, DaemonRpc, RawTemplate};
use cn_pool::config::{Config, PortConfig};
use cn_pool::session::SessionRegistry;
use cn_pool::shares::{BlockRecord, ShareRecord, ShareTag, StatsStore};
use cn_pool::stratum::StratumServer;

/// Block with a version 2 coinbase whose extra ends in an 8-byte reserve,
/// followed by one transaction hash.
pub fn template(height: u64, marker: u8, difficulty: u64) -> RawTemplate {
    let mut blob = vec![16, 16];
    blob.extend(write_varint(1_710_000_000));
    blob.extend_from_slice(&[marker; 32]);
    blob.extend_from_slice(&[0; 4]);
    blob.extend(write_varint(2));
    blob.extend(write_varint(height + 60));
    blob.extend_from_slice(&[1, 0xff]);
    blob.extend(write_varint(height));
    blob.push(1);
    blob.extend(write_varint(350_000_000_000));
    blob.push(0x02);
    blob.extend_from_slice(&[0x11; 32]);
    blob.extend(write_varint(43));
    blob.push(0x01);
    blob.extend_from_slice(&[0x22; 32]);
    blob.extend_from_slice(&[0x02, 0x08]);
    let reserved_offset = blob.len();
    blob.extend_from_slice(&[0; 8]);
    blob.push(0);
    blob.push(1);
    blob.extend_from_slice(&[0x33; 32]);

    RawTemplate {
        blocktemplate_blob: hex::encode(&blob),
        difficulty,
        height,
        reserved_offset,
        seed_hash: hex::encode([0x42; 32]),
        prev_hash: hex::encode([marker; 32]),
    }
}

pub fn wallet() -> String {
    encode_address(18, &[3; 32], &[4; 32])
}

pub struct StaticDaemon {
    template: Mutex<RawTemplate>,
    pub submitted: Mutex<Vec<String>>,
}

impl StaticDaemon {
    pub fn new(template: RawTemplate) -> Self {
        Self {
            template: Mutex::new(template),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_template(&self, template: RawTemplate) {
        *self.template.lock().unwrap() = template;
    }
}

#[async_trait]
impl DaemonRpc for StaticDaemon {
    async fn get_block_template(&self, _reserve_size: u32, _wallet: &str) -> Result<RawTemplate> {
        Ok(self.template.lock().unwrap().clone())
    }

    async fn get_block_count(&self) -> Result<u64> {
        Ok(self.template.lock().unwrap().height)
    }

    async fn get_block_hash(&self, _height: u64) -> Result<String> {
        Ok(self.template.lock().unwrap().prev_hash.clone())
    }

    async fn submit_block(&self, blob_hex: &str) -> Result<()> {
        if blob_hex.is_empty() {
            return Err(anyhow!("empty block"));
        }
        self.submitted.lock().unwrap().push(blob_hex.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingStats {
    pub shares: Mutex<Vec<(ShareRecord, Option<BlockRecord>)>>,
    pub infractions: Mutex<Vec<ShareTag>>,
}

#[async_trait]
impl StatsStore for CountingStats {
    async fn add_worker(&self, _login: &str) -> Result<()> {
        Ok(())
    }

    async fn record_share(&self, share: &ShareRecord, block: Option<&BlockRecord>) -> Result<()> {
        self.shares.lock().unwrap().push((share.clone(), block.cloned()));
        Ok(())
    }

    async fn record_infraction(&self, _share: &ShareRecord, tag: ShareTag) -> Result<()> {
        self.infractions.lock().unwrap().push(tag);
        Ok(())
    }
}

pub struct Pool {
    pub addr: SocketAddr,
    pub daemon: Arc<StaticDaemon>,
    pub stats: Arc<CountingStats>,
    pub templates: Arc<BlockTemplateManager>,
    pub server: Arc<StratumServer>,
}

/// Start a pool on an ephemeral localhost port with the given hasher.
pub async fn start_pool(port_difficulty: u64, network_difficulty: u64, hasher: Arc<dyn PowHasher>) -> Pool {
    let mut cfg = Config::default();
    cfg.pool_server.host = "127.0.0.1".to_string();
    cfg.pool_server.ports = vec![PortConfig {
        port: 0,
        difficulty: port_difficulty,
        desc: "test".to_string(),
        tls: false,
    }];
    cfg.pool_server.var_diff.min_diff = 1;

    let daemon = Arc::new(StaticDaemon::new(template(1_000, 1, network_difficulty)));
    let templates = Arc::new(BlockTemplateManager::new(daemon.clone(), &cfg.pool_server));
    assert!(templates.tick().await);

    let stats = Arc::new(CountingStats::default());
    let server = Arc::new(
        StratumServer::new(
            &cfg,
            daemon.clone(),
            templates.clone(),
            Arc::new(CryptonoteCodec),
            hasher,
            stats.clone(),
            Arc::new(BanManager::new(cfg.pool_server.banning.clone(), None)),
            Arc::new(SessionRegistry::new()),
        )
        .unwrap(),
    );

    let weak = Arc::downgrade(&server);
    templates.on_template_change(move |template| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(server) = weak.upgrade() {
                server.broadcast_new_job(template).await;
            }
        })
    });

    let listeners = server.bind_ports().unwrap();
    let addr = listeners[0].listener.local_addr().unwrap();
    server.spawn_listeners(listeners);

    Pool { addr, daemon, stats, templates, server }
}

pub struct Miner {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Miner {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: FramedRead::new(reader, LinesCodec::new()),
            writer,
            next_id: 1,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    pub async fn read(&mut self) -> Value {
        let line = self.lines.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send_raw(&json!({"id": id, "jsonrpc": "2.0", "method": method, "params": params}).to_string())
            .await;
        loop {
            let msg = self.read().await;
            if msg["id"] == json!(id) {
                return msg;
            }
        }
    }
}

/// Hash a miner would report for `nonce`: the nonce goes straight into the
/// job's hashing blob.
pub fn solve(job: &Value, nonce: &str, hasher: &dyn PowHasher) -> String {
    let mut blob = hex::decode(job["blob"].as_str().unwrap()).unwrap();
    let nonce_bytes = hex::decode(nonce).unwrap();
    blob[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce_bytes);
    let seed = hex::decode(job["seed_hash"].as_str().unwrap()).unwrap();
    hex::encode(hasher.hash(&blob, &seed).unwrap())
}
