//! Message layer error types.

use std::io;

use thiserror::Error;
use weave_wire::WireError;

/// Errors raised by the message layer
#[derive(Error, Debug)]
pub enum LayerError {
    /// Encoding, decoding or framing failed
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Socket operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Object is not in a state that allows the operation
    #[error("incorrect state")]
    IncorrectState,

    /// Connection or tunnel pool is full
    #[error("no memory: pool exhausted")]
    NoMemory,

    /// No bound endpoint can carry the message
    #[error("no endpoint available")]
    NoEndpoint,

    /// No handler is registered for the event
    #[error("no handler registered")]
    NoHandler,

    /// Received message is addressed to another node
    #[error("invalid destination node id {0:016X}")]
    InvalidDestinationNodeId(u64),

    /// Connection handle is stale or unknown
    #[error("invalid connection")]
    InvalidConnection,

    /// Layer was shut down or never initialized
    #[error("message layer not initialized")]
    NotInitialized,

    /// Configuration is inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LayerError {
    /// Whether an upper layer may answer the peer with a key error
    pub fn is_key_error(&self) -> bool {
        matches!(self, LayerError::Wire(e) if e.is_key_error())
    }
}

/// Per-interface multicast failures that do not abort a fan-out
pub fn is_benign_multicast_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::AddrNotAvailable
    )
}
