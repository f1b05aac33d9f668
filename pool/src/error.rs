/// Pool error types
///
/// `PoolError` values travel back to the miner as JSON-RPC errors; the
/// `Display` text is the exact message written on the wire.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("your IP is banned")]
    Banned,

    #[error("missing login")]
    MissingLogin,

    #[error("invalid address used")]
    InvalidAddress,

    #[error("Unauthenticated")]
    Unauthenticated,

    #[error("Invalid job id")]
    InvalidJobId,

    /// Also returned for malformed nonces.
    #[error("Duplicate share")]
    DuplicateShare,

    #[error("Block expired")]
    BlockExpired,

    #[error("Invalid difficulty share")]
    InvalidDifficulty,

    #[error("Bad share")]
    BadShare,

    #[error("invalid method")]
    InvalidMethod,

    #[error("no block template available")]
    NoTemplate,
}

impl PoolError {
    /// Every reply error uses the same JSON-RPC code.
    pub const CODE: i32 = -1;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
