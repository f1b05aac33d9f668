use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "pool_config.json";

#[derive(Deserialize, Clone, Debug)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_path")]
    pub path: String,
    #[serde(default = "default_daemon_timeout")]
    pub timeout_secs: u64,
}

fn default_daemon_host() -> String { "127.0.0.1".to_string() }
fn default_daemon_port() -> u16 { 18081 }
fn default_daemon_path() -> String { "/json_rpc".to_string() }
fn default_daemon_timeout() -> u64 { 10 }

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_daemon_host(),
            port: default_daemon_port(),
            path: default_daemon_path(),
            timeout_secs: default_daemon_timeout(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PortConfig {
    pub port: u16,
    pub difficulty: u64,
    #[serde(default)]
    pub desc: String,
    /// Serve this port over TLS (`pool_server.tls` must be set).
    #[serde(default)]
    pub tls: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VarDiffConfig {
    #[serde(default = "default_min_diff")]
    pub min_diff: u64,
    #[serde(default = "default_max_diff")]
    pub max_diff: u64,
    /// Desired seconds between shares.
    #[serde(default = "default_target_time")]
    pub target_time: u64,
    /// Window (seconds) used to size the share-interval ring.
    #[serde(default = "default_retarget_time")]
    pub retarget_time: u64,
    #[serde(default = "default_variance_percent")]
    pub variance_percent: f64,
    /// Largest single retarget step, in percent of current difficulty.
    #[serde(default = "default_max_jump")]
    pub max_jump: f64,
}

fn default_min_diff() -> u64 { 2_000 }
fn default_max_diff() -> u64 { 100_000_000 }
fn default_target_time() -> u64 { 15 }
fn default_retarget_time() -> u64 { 60 }
fn default_variance_percent() -> f64 { 30.0 }
fn default_max_jump() -> f64 { 100.0 }

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min_diff: default_min_diff(),
            max_diff: default_max_diff(),
            target_time: default_target_time(),
            retarget_time: default_retarget_time(),
            variance_percent: default_variance_percent(),
            max_jump: default_max_jump(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct FixedDiffConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_address_separator")]
    pub address_separator: String,
}

fn default_true() -> bool { true }
fn default_address_separator() -> String { ".".to_string() }

impl Default for FixedDiffConfig {
    fn default() -> Self {
        Self { enabled: true, address_separator: default_address_separator() }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ShareTrustConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Floor for the verification probability, percent.
    #[serde(default = "default_trust_min")]
    pub min: f64,
    /// Probability decrease per verified share, percent.
    #[serde(default = "default_trust_step_down")]
    pub step_down: f64,
    /// Verified shares required before any share may be trusted.
    #[serde(default = "default_trust_threshold")]
    pub threshold: i64,
    /// Verified shares required again after an invalid share.
    #[serde(default = "default_trust_penalty")]
    pub penalty: i64,
}

fn default_trust_min() -> f64 { 20.0 }
fn default_trust_step_down() -> f64 { 3.0 }
fn default_trust_threshold() -> i64 { 30 }
fn default_trust_penalty() -> i64 { 30 }

impl Default for ShareTrustConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min: default_trust_min(),
            step_down: default_trust_step_down(),
            threshold: default_trust_threshold(),
            penalty: default_trust_penalty(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct BanningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ban duration in seconds.
    #[serde(default = "default_ban_time")]
    pub time: u64,
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: u64,
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u64,
}

fn default_ban_time() -> u64 { 600 }
fn default_invalid_percent() -> u64 { 25 }
fn default_check_threshold() -> u64 { 30 }

impl Default for BanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            time: default_ban_time(),
            invalid_percent: default_invalid_percent(),
            check_threshold: default_check_threshold(),
        }
    }
}

/// Accepted wallet address network prefixes.
#[derive(Deserialize, Clone, Debug)]
pub struct AddressPrefixConfig {
    #[serde(default = "default_address_prefix")]
    pub address: u64,
    #[serde(default = "default_integrated_prefix")]
    pub integrated: u64,
    #[serde(default = "default_subaddress_prefix")]
    pub subaddress: u64,
}

fn default_address_prefix() -> u64 { 18 }
fn default_integrated_prefix() -> u64 { 19 }
fn default_subaddress_prefix() -> u64 { 42 }

impl Default for AddressPrefixConfig {
    fn default() -> Self {
        Self {
            address: default_address_prefix(),
            integrated: default_integrated_prefix(),
            subaddress: default_subaddress_prefix(),
        }
    }
}

impl AddressPrefixConfig {
    pub fn accepts(&self, prefix: u64) -> bool {
        prefix == self.address || prefix == self.integrated || prefix == self.subaddress
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub pool_address: String,
    #[serde(default = "default_block_refresh_interval")]
    pub block_refresh_interval_ms: u64,
    /// Every Nth polling tick fetches a template unconditionally.
    #[serde(default = "default_block_refresh_force")]
    pub block_refresh_force: u64,
    #[serde(default = "default_miner_timeout")]
    pub miner_timeout_secs: u64,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    #[serde(default = "default_ports")]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub var_diff: VarDiffConfig,
    #[serde(default)]
    pub fixed_diff: FixedDiffConfig,
    #[serde(default)]
    pub share_trust: ShareTrustConfig,
    #[serde(default)]
    pub banning: BanningConfig,
    #[serde(default)]
    pub address_prefixes: AddressPrefixConfig,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_block_refresh_interval() -> u64 { 1_000 }
fn default_block_refresh_force() -> u64 { 10 }
fn default_miner_timeout() -> u64 { 900 }
fn default_max_line_bytes() -> usize { 10_240 }
fn default_ports() -> Vec<PortConfig> {
    vec![PortConfig { port: 3333, difficulty: 20_000, desc: "Low end hardware".to_string(), tls: false }]
}

impl Default for PoolServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            pool_address: String::new(),
            block_refresh_interval_ms: default_block_refresh_interval(),
            block_refresh_force: default_block_refresh_force(),
            miner_timeout_secs: default_miner_timeout(),
            max_line_bytes: default_max_line_bytes(),
            ports: default_ports(),
            tls: None,
            var_diff: VarDiffConfig::default(),
            fixed_diff: FixedDiffConfig::default(),
            share_trust: ShareTrustConfig::default(),
            banning: BanningConfig::default(),
            address_prefixes: AddressPrefixConfig::default(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_coin")]
    pub coin: String,
    /// Value of the `algo` field in every job; also picks the share hasher
    /// (`rx/0`, or `keccak` for test networks).
    #[serde(default = "default_algo")]
    pub algo: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Prometheus `/metrics` listener; disabled when unset.
    #[serde(default)]
    pub metrics_listen: Option<String>,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub pool_server: PoolServerConfig,
}

fn default_coin() -> String { "monero".to_string() }
fn default_algo() -> String { "rx/0".to_string() }
fn default_redis_url() -> String { "redis://127.0.0.1/".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            coin: default_coin(),
            algo: default_algo(),
            redis_url: default_redis_url(),
            metrics_listen: None,
            daemon: DaemonConfig::default(),
            pool_server: PoolServerConfig::default(),
        }
    }
}

impl Config {
    /// Load settings from `POOL_CONFIG` (or `pool_config.json`), apply env
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("POOL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", path);
            Self::default()
        };

        if let Ok(r) = std::env::var("POOL_REDIS_URL") {
            cfg.redis_url = r;
        }
        if let Ok(h) = std::env::var("POOL_DAEMON_HOST") {
            cfg.daemon.host = h;
        }
        if let Ok(p) = std::env::var("POOL_DAEMON_PORT") {
            cfg.daemon.port = p
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("POOL_DAEMON_PORT is not a port: {}", p)))?;
        }
        if let Ok(a) = std::env::var("POOL_ADDRESS") {
            cfg.pool_server.pool_address = a;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ps = &self.pool_server;
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if ps.ports.is_empty() {
            return invalid("pool_server.ports must not be empty");
        }
        if ps.ports.iter().any(|p| p.difficulty == 0) {
            return invalid("port difficulty must be greater than zero");
        }
        if ps.ports.iter().any(|p| p.tls) && ps.tls.is_none() {
            return invalid("TLS ports require pool_server.tls");
        }
        if ps.block_refresh_force == 0 {
            return invalid("block_refresh_force must be greater than zero");
        }
        if ps.block_refresh_interval_ms == 0 {
            return invalid("block_refresh_interval_ms must be greater than zero");
        }
        if ps.max_line_bytes == 0 {
            return invalid("max_line_bytes must be greater than zero");
        }

        let vd = &ps.var_diff;
        if vd.min_diff == 0 || vd.min_diff > vd.max_diff {
            return invalid("var_diff requires 0 < min_diff <= max_diff");
        }
        if vd.target_time == 0 {
            return invalid("var_diff.target_time must be greater than zero");
        }
        if vd.retarget_time < vd.target_time {
            return invalid("var_diff.retarget_time must be at least target_time");
        }
        if !(vd.max_jump > 0.0) || !(vd.variance_percent >= 0.0) {
            return invalid("var_diff.max_jump and variance_percent must be positive");
        }

        if ps.fixed_diff.enabled && ps.fixed_diff.address_separator.is_empty() {
            return invalid("fixed_diff.address_separator must not be empty");
        }
        if ps.banning.enabled && ps.banning.check_threshold == 0 {
            return invalid("banning.check_threshold must be greater than zero");
        }
        if ps.share_trust.enabled && !(0.0..=100.0).contains(&ps.share_trust.min) {
            return invalid("share_trust.min must be a percentage");
        }

        Ok(())
    }
}
