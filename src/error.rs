use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::ErrorStatus;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("invalid listen address: {0}")]
    InvalidListenAddress(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to generate key pair: {0}")]
    Entropy(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("request to {0} timed out")]
    Timeout(SocketAddr),

    #[error("peer answered {status}: {message}")]
    Remote { status: ErrorStatus, message: String },

    #[error("unexpected response payload")]
    UnexpectedResponse,

    #[error("no contacts in routing table")]
    NoContacts,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("node is not running")]
    NotRunning,
}

impl DhtError {
    /// Returns `true` if the error was caused by a malformed request on our side.
    pub fn is_client_error(&self) -> bool {
        match self {
            DhtError::Remote { status, .. } => *status == ErrorStatus::BadRequest,
            _ => false,
        }
    }
}
