//! Error types shared across the bridge.
//!
//! Codec errors live next to the codec ([`crate::ocpp::DecodeError`]); rule
//! failures are not errors at all but [`crate::pipeline::RuleOutcome::Skipped`].

use thiserror::Error;

/// Configuration could not be loaded or is inconsistent.
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
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure while pairing a device connection with the backend.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection path {0:?} does not name a charge point")]
    InvalidPath(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend did not accept the connection within {0} ms")]
    Timeout(u64),

    /// Descriptor exhaustion; fatal for the whole process.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl ConnectError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("device disconnected")]
    DeviceDisconnect,

    #[error("device socket error: {0}")]
    DeviceSocket(String),

    #[error("backend disconnected")]
    BackendDisconnect,

    #[error("backend socket error: {0}")]
    BackendUnavailable(String),

    #[error("{0} consecutive undecodable frames")]
    DecodeLoop(u32),

    #[error("session closed")]
    Cancelled,
}

/// Dashboard command could not be delivered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("commands must be Calls")]
    NotACall,
}

/// The server could not start or had to stop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open message log: {0}")]
    Journal(#[source] std::io::Error),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    /// Raised through the session manager's fatal channel.
    #[error("fatal: {0}")]
    Fatal(String),
}
