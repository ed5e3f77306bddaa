//! Error types shared across the feed session subsystem.

use thiserror::Error;

/// Errors raised while establishing or holding a broker session.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Bookmaker identity could not be resolved into a connection target.
    #[error("identity resolution failed: {0}")]
    Identity(String),

    /// Broker transport failure (dial, TLS, channel, topology).
    #[error("transport error: {0}")]
    Transport(String),

    /// Connect attempt exceeded its time budget.
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Configured reconnect ceiling exhausted.
    #[error("giving up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Connector was stopped while an operation was in flight.
    #[error("connector stopped")]
    Stopped,
}

impl FeedError {
    /// Identity failures before the first connect are not worth retrying.
    pub fn is_identity(&self) -> bool {
        matches!(self, FeedError::Identity(_))
    }
}

impl From<lapin::Error> for FeedError {
    fn from(e: lapin::Error) -> Self {
        FeedError::Transport(e.to_string())
    }
}

/// Errors from the vendor's HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("unexpected status {status} from {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

/// Errors surfaced by the recovery coordinator.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Vendor rejected the request for a reason other than rate limiting.
    #[error("recovery for {product} rejected with status {status}: {body}")]
    Rejected { product: String, status: u16, body: String },

    /// Request never got an answer (transport failure or timeout).
    #[error("recovery for {product} failed: {source}")]
    Api {
        product: String,
        #[source]
        source: ApiError,
    },

    #[error("unknown recovery product '{0}'")]
    UnknownProduct(String),

    /// Aggregate failure from a full recovery run.
    #[error("recovery failed for {} product(s): {}", failures.len(), failures.join("; "))]
    Partial { failures: Vec<String> },
}

/// Errors persisting recovery audit records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("store task failed: {0}")]
    Task(String),
}

#[cfg(feature = "postgres")]
impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse YAML: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("missing required setting {0}")]
    Missing(String),
}
