//! Weave message header encoding, message protection and stream framing.
//!
//! This crate implements the message format shared by every Weave
//! transport: the packed header field, optional node and key ids,
//! AES-128-CTR encryption with an HMAC-SHA1 integrity trailer, and the
//! 2-byte length prefix used on stream connections.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 length (stream)  | bytes that follow          |
//! +----------------------+----------------------------+
//! | u16 header field     | version / flags / enc type |
//! +----------------------+----------------------------+
//! | u32 message id       | per-session counter        |
//! +----------------------+----------------------------+
//! | u64 source id (opt)  | SOURCE_NODE_ID flag        |
//! +----------------------+----------------------------+
//! | u64 dest id (opt)    | DEST_NODE_ID flag          |
//! +----------------------+----------------------------+
//! | u16 key id (opt)     | present when encrypted     |
//! +----------------------+----------------------------+
//! | payload              | encrypted with trailer     |
//! +----------------------+----------------------------+
//! | HMAC-SHA1 (opt, 20B) | integrity trailer          |
//! +----------------------+----------------------------+
//! ```
//!
//! Key material and message counters live outside this crate behind the
//! [`SessionKeyResolver`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod buffer;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod header;
pub mod message_info;
pub mod session;

// Re-export main types
pub use address::{apply_address_policy, fabric_ula, is_fabric_address, source_node_id_hint, WEAVE_PORT};
pub use buffer::{PacketBuffer, DEFAULT_HEADER_RESERVE, DEFAULT_TRAILER_RESERVE};
pub use codec::{MessageCodec, MAX_FRAMED_MESSAGE_LEN};
pub use crypto::{AuthenticatedCipher, SessionKeys, HMAC_SHA1_DIGEST_LEN};
pub use error::WireError;
pub use header::{
    EncryptionType, HeaderFlags, MessageVersion, FIXED_HEADER_LEN, LENGTH_PREFIX_LEN,
};
pub use message_info::{
    KeyId, MessageFlags, MessageInfo, PeerAuthMode, ANY_NODE_ID, NODE_ID_NOT_SPECIFIED,
};
pub use session::{ConnectionRef, SessionKeyResolver, SessionState};
