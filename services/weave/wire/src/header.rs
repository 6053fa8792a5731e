//! Message header field and stream length prefix.
//!
//! The 16-bit header field packs three sub-fields:
//!
//! ```text
//!  15      12 11      8 7       4 3       0
//! +----------+---------+---------+---------+
//! | version  |  flags  | enc type| reserved|
//! +----------+---------+---------+---------+
//! ```
//!
//! All multi-byte integers on the wire are little-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Size of the header field plus message id
pub const FIXED_HEADER_LEN: usize = 6;
/// Size of an encoded node id
pub const NODE_ID_LEN: usize = 8;
/// Size of an encoded key id
pub const KEY_ID_LEN: usize = 2;
/// Size of the stream length prefix
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Bits of the header field carrying flags (including reserved)
pub const FLAGS_MASK: u16 = 0x0F0F;
/// Bits of the header field carrying the encryption type
pub const ENCRYPTION_TYPE_MASK: u16 = 0x00F0;
/// Shift of the encryption type sub-field
pub const ENCRYPTION_TYPE_SHIFT: u16 = 4;
/// Bits of the header field carrying the message version
pub const VERSION_MASK: u16 = 0xF000;
/// Shift of the message version sub-field
pub const VERSION_SHIFT: u16 = 12;
/// Flag bits that must be zero
pub const RESERVED_FLAGS_MASK: u16 = FLAGS_MASK & !HeaderFlags::all().bits();

/// Header bits excluded from the V2 integrity check.
///
/// Id presence and the counter sync request may be rewritten by relays.
pub const HMAC_HEADER_MASK: u16 = !(HeaderFlags::DEST_NODE_ID.bits()
    | HeaderFlags::SOURCE_NODE_ID.bits()
    | HeaderFlags::MSG_COUNTER_SYNC_REQ.bits());

bitflags! {
    /// Flags carried in the header field
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct HeaderFlags: u16 {
        /// Destination node id follows the source node id
        const DEST_NODE_ID = 0x0100;
        /// Source node id follows the message id
        const SOURCE_NODE_ID = 0x0200;
        /// Payload is tunneled data for a tunnel agent
        const TUNNELED_DATA = 0x0400;
        /// Sender requests group message counter synchronization
        const MSG_COUNTER_SYNC_REQ = 0x0800;
    }
}

/// Message encryption type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EncryptionType {
    /// Plaintext
    #[default]
    None = 0,
    /// AES-128-CTR encryption with an HMAC-SHA1 integrity trailer
    Aes128CtrSha1 = 1,
}

impl TryFrom<u8> for EncryptionType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EncryptionType::None),
            1 => Ok(EncryptionType::Aes128CtrSha1),
            _ => Err(WireError::UnsupportedEncryptionType(value)),
        }
    }
}

impl EncryptionType {
    /// Length of the trailer appended after the payload
    pub fn trailer_len(self) -> usize {
        match self {
            EncryptionType::None => 0,
            EncryptionType::Aes128CtrSha1 => crate::crypto::HMAC_SHA1_DIGEST_LEN,
        }
    }
}

/// Message format version
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageVersion {
    /// Original format
    #[default]
    V1 = 1,
    /// Adds header field and message id to the integrity check
    V2 = 2,
}

impl TryFrom<u8> for MessageVersion {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageVersion::V1),
            2 => Ok(MessageVersion::V2),
            _ => Err(WireError::UnsupportedMessageVersion(value)),
        }
    }
}

/// Raw sub-fields unpacked from a header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderField {
    /// Known flag bits
    pub flags: HeaderFlags,
    /// Encryption type value, not yet validated
    pub encryption_type: u8,
    /// Message version value, not yet validated
    pub version: u8,
}

/// Pack flags, encryption type and version into a header field
pub fn encode_header_field(
    flags: HeaderFlags,
    encryption_type: EncryptionType,
    version: MessageVersion,
) -> u16 {
    (flags.bits() & FLAGS_MASK)
        | (((encryption_type as u16) << ENCRYPTION_TYPE_SHIFT) & ENCRYPTION_TYPE_MASK)
        | (((version as u16) << VERSION_SHIFT) & VERSION_MASK)
}

/// Reserved bits set in a header field, zero when the field is well formed
pub fn reserved_bits(field: u16) -> u16 {
    field & RESERVED_FLAGS_MASK
}

/// Unpack a header field.
///
/// Reserved bits are dropped; callers reject them with [`reserved_bits`] first.
pub fn decode_header_field(field: u16) -> HeaderField {
    HeaderField {
        flags: HeaderFlags::from_bits_truncate(field & FLAGS_MASK),
        encryption_type: ((field & ENCRYPTION_TYPE_MASK) >> ENCRYPTION_TYPE_SHIFT) as u8,
        version: ((field & VERSION_MASK) >> VERSION_SHIFT) as u8,
    }
}

/// Write the 2-byte stream length prefix
pub fn encode_length_prefix(len: usize, mut out: &mut [u8]) -> Result<(), WireError> {
    let len = u16::try_from(len).map_err(|_| WireError::MessageTooLong {
        len,
        max: u16::MAX as usize,
    })?;
    if out.len() < LENGTH_PREFIX_LEN {
        return Err(WireError::BufferTooSmall);
    }
    out.put_u16_le(len);
    Ok(())
}

/// Read the 2-byte stream length prefix, `None` if fewer than two bytes are present
pub fn decode_length_prefix(mut data: &[u8]) -> Option<u16> {
    if data.len() < LENGTH_PREFIX_LEN {
        return None;
    }
    Some(data.get_u16_le())
}
