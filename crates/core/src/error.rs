//! Error types for the NovaBackup agent engine.

use thiserror::Error;

/// Top-level error for backup operations.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("quota exceeded: usage={usage} + pending={pending} > quota={quota}")]
    QuotaExceeded {
        usage: u64,
        pending: u64,
        quota: u64,
    },

    #[error("retention error: {0}")]
    Retention(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the SFTP transport layer (see spec §4.3).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("chunk missing: expected index {0} before the last declared chunk")]
    ChunkMissing(u32),

    #[error("frame invalid: length prefix {0} is non-positive or exceeds the {1}-byte cap")]
    FrameInvalid(i64, u64),

    #[error("integrity mismatch for {name}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("passphrase required: stream is encrypted but no passphrase is configured")]
    PassphraseRequired,

    #[error("ssh/sftp session error: {0}")]
    Session(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the AES-256-CBC/PBKDF2 encrypted container format.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid header: expected magic 5A494D45")]
    InvalidMagic,

    #[error("input too short to contain a header")]
    ShortHeader,

    #[error("padding or authentication failure during decryption")]
    BadPadding,

    #[error("passphrase required but not configured")]
    PassphraseRequired,
}

/// Errors from the file index / diff step.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("invalid relative path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

/// Errors from configuration loading and sync.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid cron expression in {field}: {reason}")]
    InvalidCron { field: &'static str, reason: String },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result alias for agent-level operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result alias for crypto operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
