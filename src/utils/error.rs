//! Error types for cache-ha-client

use std::io;
use thiserror::Error;

/// Top-level client error
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(ConnectionError),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("No connection available to {0}")]
    NoConnectionAvailable(String),

    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Server exception {class}: {message}")]
    ServerException { class: String, message: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("No locators available")]
    NoLocatorsAvailable,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Errors that abort redundancy and failover loops instead of moving on
    /// to the next endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Config(_)
                | ClientError::AuthenticationRequired(_)
                | ClientError::AuthenticationFailed(_)
                | ClientError::ServerException { .. }
                | ClientError::IllegalState(_)
        )
    }

    /// Fatal errors caused by the client itself (credentials); these abort
    /// pool creation.
    pub fn is_fatal_client(&self) -> bool {
        matches!(
            self,
            ClientError::AuthenticationRequired(_) | ClientError::AuthenticationFailed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// Map transport failures to `NotConnected` before they reach a caller.
    pub fn into_top_level(self) -> Self {
        match self {
            ClientError::Io(e) => ClientError::NotConnected(e.to_string()),
            ClientError::NoConnectionAvailable(ep) => {
                ClientError::NotConnected(format!("no connection available to {}", ep))
            }
            other => other,
        }
    }
}

impl From<ConnectionError> for ClientError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout(ms) => ClientError::Timeout(format!("no reply after {}ms", ms)),
            other => ClientError::Io(other),
        }
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed { endpoint: String, source: io::Error },

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("Handshake rejected by {endpoint}: {reason}")]
    HandshakeFailed { endpoint: String, reason: String },

    #[error("Connection closed unexpectedly")]
    Closed,

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// IO failures worth one more attempt on a fresh connection.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Classify a read/write failure, folding socket timeouts into `Timeout`.
    pub fn from_io(e: io::Error, timeout_ms: u64) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(timeout_ms),
            io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
            _ => ConnectionError::Io(e),
        }
    }
}

/// Frame codec errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown verb: {0}")]
    UnknownVerb(String),

    #[error("Unexpected frame: expected {expected}, got {actual}")]
    UnexpectedFrame { expected: String, actual: String },

    #[error("Transaction id mismatch: sent {sent}, received {received}")]
    TransactionMismatch { sent: i64, received: i64 },

    #[error("Parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
