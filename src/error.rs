//! Error types for the probe engine.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result alias for probe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Errors that can end (or prevent) a probe run.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send failed for seq {seq} to {target}: {source}")]
    Send {
        seq: u64,
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0} task failed: {1}")]
    Task(&'static str, String),
}

impl ProbeError {
    /// Bind conflicts are recoverable by falling back to an ephemeral port
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, ProbeError::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Snapshot sink failures (always swallowed by the publisher).
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("snapshot write failed: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
