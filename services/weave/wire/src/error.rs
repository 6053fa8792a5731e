//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or framing Weave messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message version is not V1 or V2
    #[error("unsupported message version {0}")]
    UnsupportedMessageVersion(u8),

    /// Encryption type is not understood by this layer
    #[error("unsupported encryption type {0}")]
    UnsupportedEncryptionType(u8),

    /// Message is truncated or has an impossible length
    #[error("invalid message length")]
    InvalidMessageLength,

    /// Encoded message would exceed the permitted length
    #[error("message too long: {len} > {max}")]
    MessageTooLong {
        /// Length the message would have
        len: usize,
        /// Maximum allowed for the target
        max: usize,
    },

    /// Buffer lacks head reserve or tail room
    #[error("buffer too small")]
    BufferTooSmall,

    /// Reserved bits set in the header field
    #[error("invalid message flag in header field {0:#06x}")]
    InvalidMessageFlag(u16),

    /// HMAC over the message did not match the trailer
    #[error("message integrity check failed")]
    IntegrityCheckFailed,

    /// Stream buffer does not yet hold a complete frame
    #[error("message incomplete")]
    MessageIncomplete,

    /// Caller supplied an inconsistent argument
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No key material for the peer/key pair
    #[error("key {key_id:#06x} not found for peer {peer:016X}")]
    KeyNotFound {
        /// Peer node id used for the lookup
        peer: u64,
        /// Requested key id
        key_id: u16,
    },

    /// Key id has an unknown type or is not usable for the encryption type
    #[error("invalid key id {0:#06x}")]
    InvalidKeyId(u16),
}

impl WireError {
    /// Errors for which an upper layer may answer the peer with a key error
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            WireError::IntegrityCheckFailed
                | WireError::KeyNotFound { .. }
                | WireError::InvalidKeyId(_)
        )
    }

    /// Framing errors that leave a stream unusable
    pub fn is_fatal_framing_error(&self) -> bool {
        !matches!(self, WireError::MessageIncomplete)
    }
}
