/// Stratum Server - miner-facing listeners
///
/// Handles XMRig-style connections with:
/// - Plain TCP or TLS per configured port
/// - Newline framing with a flood guard on unterminated input
/// - login / getjob / submit / keepalived dispatch
/// - Job broadcast on template promotion
/// - Periodic sweep of idle sessions and expired bans

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::protocol::{
    http_response, parse_params, LoginParams, SessionParams, StratumRequest, StratumResponse, SubmitParams,
};
use crate::banning::BanManager;
use crate::blockchain::codec::{BlockCodec, PowHasher};
use crate::blockchain::rpc_client::DaemonRpc;
use crate::blockchain::template_manager::{BlockTemplate, BlockTemplateManager};
use crate::config::{Config, PoolServerConfig, PortConfig, TlsConfig};
use crate::error::PoolError;
use crate::metrics::prometheus as metrics;
use crate::session::{unix_now, MinerSession, SessionRegistry, ShareTrust};
use crate::shares::processor::ShareProcessor;
use crate::shares::storage::StatsStore;
use crate::vardiff::VarDiff;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// State owned by one miner connection.
pub struct Connection {
    pub ip: String,
    /// Starting difficulty of the port the miner connected to.
    pub port_difficulty: u64,
    outbound: mpsc::UnboundedSender<String>,
    sessions: Vec<String>,
}

impl Connection {
    pub fn new(ip: String, port_difficulty: u64, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            ip,
            port_difficulty,
            outbound,
            sessions: Vec::new(),
        }
    }

    fn send(&self, line: String) -> bool {
        self.outbound.send(line).is_ok()
    }
}

/// A bound listening port.
pub struct Listener {
    pub port: PortConfig,
    pub listener: TcpListener,
}

pub struct StratumServer {
    cfg: PoolServerConfig,
    algo: String,
    templates: Arc<BlockTemplateManager>,
    codec: Arc<dyn BlockCodec>,
    stats: Arc<dyn StatsStore>,
    bans: Arc<BanManager>,
    sessions: Arc<SessionRegistry>,
    processor: ShareProcessor,
    vardiff: VarDiff,
    tls: Option<TlsAcceptor>,
}

impl StratumServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        daemon: Arc<dyn DaemonRpc>,
        templates: Arc<BlockTemplateManager>,
        codec: Arc<dyn BlockCodec>,
        hasher: Arc<dyn PowHasher>,
        stats: Arc<dyn StatsStore>,
        bans: Arc<BanManager>,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let cfg = config.pool_server.clone();

        let tls = if cfg.ports.iter().any(|p| p.tls) {
            let tls_cfg = cfg
                .tls
                .as_ref()
                .ok_or_else(|| anyhow!("TLS port configured without pool_server.tls"))?;
            Some(load_tls(tls_cfg)?)
        } else {
            None
        };

        let processor = ShareProcessor::new(
            templates.clone(),
            daemon,
            codec.clone(),
            hasher,
            stats.clone(),
            bans.clone(),
            sessions.clone(),
            cfg.share_trust.clone(),
        );
        let vardiff = VarDiff::from_config(&cfg.var_diff);

        Ok(Self {
            algo: config.algo.clone(),
            cfg,
            templates,
            codec,
            stats,
            bans,
            sessions,
            processor,
            vardiff,
            tls,
        })
    }

    /// Bind every configured port. Any failure is fatal to startup.
    pub fn bind_ports(&self) -> Result<Vec<Listener>> {
        self.cfg
            .ports
            .iter()
            .map(|port| {
                let listener = bind(&self.cfg.host, port.port)?;
                Ok(Listener { port: port.clone(), listener })
            })
            .collect()
    }

    /// Bind all ports, then serve until the accept loops end.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listeners = self.bind_ports()?;
        let mut handles = self.spawn_listeners(listeners);
        handles.push(self.spawn_maintenance());
        futures::future::join_all(handles).await;
        Ok(())
    }

    pub fn spawn_listeners(self: &Arc<Self>, listeners: Vec<Listener>) -> Vec<JoinHandle<()>> {
        listeners
            .into_iter()
            .map(|l| {
                let server = self.clone();
                tokio::spawn(async move { server.accept_loop(l).await })
            })
            .collect()
    }

    async fn accept_loop(self: Arc<Self>, l: Listener) {
        let addr = l.listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
        tracing::info!(
            "Started server listening on {} (difficulty {}, {}{})",
            addr,
            l.port.difficulty,
            if l.port.tls { "TLS" } else { "plain" },
            if l.port.desc.is_empty() { String::new() } else { format!(", {}", l.port.desc) }
        );

        loop {
            let (socket, peer) = match l.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Failed to accept connection on {}: {}", addr, e);
                    continue;
                }
            };
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }

            let server = self.clone();
            let difficulty = l.port.difficulty;
            match (&self.tls, l.port.tls) {
                (Some(acceptor), true) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(socket).await {
                            Ok(stream) => server.serve_stream(stream, peer, difficulty).await,
                            Err(e) => tracing::warn!("TLS handshake with {} failed: {}", peer, e),
                        }
                    });
                }
                _ => {
                    tokio::spawn(async move { server.serve_stream(socket, peer, difficulty).await });
                }
            }
        }
    }

    /// Read newline-delimited requests from one miner until it disconnects,
    /// floods, or sends something unparsable.
    pub async fn serve_stream<S>(self: Arc<Self>, stream: S, peer: SocketAddr, port_difficulty: u64)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        metrics::inc_connections();
        let ip = peer.ip().to_string();
        tracing::debug!("New connection from {}", peer);

        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(mut msg) = rx.recv().await {
                msg.push('\n');
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let mut conn = Connection::new(ip, port_difficulty, tx);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(self.cfg.max_line_bytes));

        while let Some(next) = lines.next().await {
            let line = match next {
                Ok(line) => line,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    metrics::inc_flood_disconnects();
                    tracing::warn!("Socket flooding detected and prevented from {}", conn.ip);
                    break;
                }
                Err(LinesCodecError::Io(e)) => {
                    tracing::debug!("Socket error from {}: {}", conn.ip, e);
                    break;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(_) => {
                    if let Some(resp) = http_response(line) {
                        conn.send(resp);
                    } else {
                        tracing::warn!("Malformed message from {}: {}", conn.ip, line);
                    }
                    break;
                }
            };

            let request = match StratumRequest::from_value(value) {
                Ok(req) => req,
                Err(field) => {
                    tracing::warn!("Miner RPC request missing RPC {} from {}", field, conn.ip);
                    continue;
                }
            };

            let response = self.handle(&mut conn, request).await;
            match serde_json::to_string(&response) {
                Ok(text) => {
                    if !conn.send(text) {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode reply for {}: {}", conn.ip, e),
            }
        }

        for id in &conn.sessions {
            self.sessions.remove(id).await;
        }
        metrics::dec_connections();
        tracing::debug!("Connection closed: {}", peer);

        drop(conn);
        let _ = writer_task.await;
    }

    /// Dispatch one request. The ban check runs before any method.
    pub async fn handle(&self, conn: &mut Connection, req: StratumRequest) -> StratumResponse {
        let id = req.id.clone();
        if self.bans.is_banned(&conn.ip).await {
            return StratumResponse::error(id, &PoolError::Banned);
        }

        let result = match req.method.as_str() {
            "login" => self.login(conn, parse_params(&req.params)).await,
            "getjob" => self.getjob(parse_params(&req.params)).await,
            "submit" => self.submit(parse_params(&req.params)).await,
            "keepalived" => self.keepalived(parse_params(&req.params)).await,
            other => {
                tracing::warn!("Invalid method {} from {}", other, conn.ip);
                Err(PoolError::InvalidMethod)
            }
        };
        StratumResponse::from_result(id, result)
    }

    async fn login(&self, conn: &mut Connection, params: LoginParams) -> Result<Value, PoolError> {
        let login = params.login.unwrap_or_default();
        if login.is_empty() {
            return Err(PoolError::MissingLogin);
        }

        let (address, fixed) = self.split_login(&login);
        let accepted = self
            .codec
            .address_prefix(address)
            .map(|prefix| self.cfg.address_prefixes.accepts(prefix))
            .unwrap_or(false);
        if !accepted {
            tracing::warn!("Invalid address {} from {}", address, conn.ip);
            return Err(PoolError::InvalidAddress);
        }

        let template = self.templates.current().await.ok_or(PoolError::NoTemplate)?;

        let difficulty = fixed.unwrap_or(conn.port_difficulty);
        let trust = self.cfg.share_trust.enabled.then(|| ShareTrust::new(&self.cfg.share_trust));
        let pass = hex::encode(params.pass.unwrap_or_default());

        let mut session = MinerSession::new(
            address.to_string(),
            pass,
            conn.ip.clone(),
            difficulty,
            fixed.is_some(),
            self.vardiff.buffer_size,
            trust,
        )
        .with_outbound(conn.outbound.clone());

        let job = session.cut_job(&template, self.codec.as_ref(), &self.algo).map_err(|e| {
            tracing::error!("Failed to cut job for {}: {:#}", session.label(), e);
            PoolError::NoTemplate
        })?;

        let session_id = session.id.clone();
        let label = session.label();
        self.sessions.insert(session).await;
        conn.sessions.push(session_id.clone());

        let stats = self.stats.clone();
        let worker = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = stats.add_worker(&worker).await {
                metrics::inc_storage_errors();
                tracing::error!("Failed to add worker {}: {:#}", worker, e);
            }
        });

        match fixed {
            Some(d) => tracing::info!("Miner connected {} with fixed difficulty {}", label, d),
            None => tracing::info!("Miner connected {}", label),
        }

        Ok(json!({ "id": session_id, "job": job, "status": "OK" }))
    }

    /// Split `address<sep>difficulty`. The difficulty falls back to the
    /// vardiff floor when it does not parse and never goes below it.
    fn split_login<'a>(&self, login: &'a str) -> (&'a str, Option<u64>) {
        let fixed = &self.cfg.fixed_diff;
        if !fixed.enabled || fixed.address_separator.is_empty() {
            return (login, None);
        }
        match login.split_once(fixed.address_separator.as_str()) {
            Some((address, diff)) => {
                let min = self.cfg.var_diff.min_diff;
                let d = diff.parse::<u64>().unwrap_or(min).max(min);
                (address, Some(d))
            }
            None => (login, None),
        }
    }

    async fn getjob(&self, params: SessionParams) -> Result<Value, PoolError> {
        let handle = self.session(params.id.as_deref()).await?;
        let mut session = handle.lock().await;
        session.heartbeat();

        let template = self.templates.current().await.ok_or(PoolError::NoTemplate)?;
        let job = session.get_job(&template, self.codec.as_ref(), &self.algo).map_err(|e| {
            tracing::error!("Failed to cut job for {}: {:#}", session.label(), e);
            PoolError::NoTemplate
        })?;
        serde_json::to_value(job).map_err(|_| PoolError::NoTemplate)
    }

    async fn submit(&self, params: SubmitParams) -> Result<Value, PoolError> {
        let handle = self.session(params.id.as_deref()).await?;
        let mut session = handle.lock().await;
        session.heartbeat();

        self.processor.submit(&mut session, &params).await?;
        Ok(json!({ "status": "OK" }))
    }

    async fn keepalived(&self, params: SessionParams) -> Result<Value, PoolError> {
        if let Ok(handle) = self.session(params.id.as_deref()).await {
            handle.lock().await.heartbeat();
        }
        Ok(json!({ "status": "KEEPALIVED" }))
    }

    async fn session(&self, id: Option<&str>) -> Result<crate::session::SessionHandle, PoolError> {
        let id = id.ok_or(PoolError::Unauthenticated)?;
        self.sessions.get(id).await.ok_or(PoolError::Unauthenticated)
    }

    /// Retarget every session and push it a job cut from `template`.
    pub async fn broadcast_new_job(&self, template: Arc<BlockTemplate>) {
        let now = unix_now();
        let mut sent = 0usize;

        for handle in self.sessions.snapshot().await {
            let mut session = handle.lock().await;
            if !session.fixed_difficulty {
                if let Some(d) = session.retarget(&self.vardiff, now) {
                    metrics::inc_vardiff_retarget();
                    tracing::info!("Retargetting difficulty {} to {} for {}", session.difficulty, d, session.label());
                }
            }
            match session.cut_job(&template, self.codec.as_ref(), &self.algo) {
                Ok(job) => {
                    if session.push_job(&job) {
                        sent += 1;
                    }
                }
                Err(e) => tracing::error!("Failed to cut job for {}: {:#}", session.label(), e),
            }
        }

        metrics::inc_job_broadcasts();
        tracing::info!("Pushed job at height {} to {} miners", template.height, sent);
    }

    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                server.sweep().await;
            }
        })
    }

    /// Drop idle sessions and expired bans.
    pub async fn sweep(&self) {
        let timeout = Duration::from_secs(self.cfg.miner_timeout_secs);
        self.sessions.sweep_timed_out(timeout).await;
        let mut live_ips = HashSet::new();
        for handle in self.sessions.snapshot().await {
            live_ips.insert(handle.lock().await.ip.clone());
        }
        self.bans.sweep(&live_ips).await;
        metrics::set_sessions(self.sessions.len().await);
    }
}

/// Listening socket with SO_REUSEADDR so restarts do not trip over TIME_WAIT.
fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| anyhow!("Invalid address '{}:{}': {}", host, port, e))?;

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Could not bind {}", addr))?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

fn load_tls(cfg: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&cfg.cert_path)
        .with_context(|| format!("Could not open TLS certificate {}", cfg.cert_path))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file)).collect::<Result<_, _>>()?;

    let key_file = std::fs::File::open(&cfg.key_path)
        .with_context(|| format!("Could not open TLS key {}", cfg.key_path))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| anyhow!("No private key found in {}", cfg.key_path))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
