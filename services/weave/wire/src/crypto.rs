//! AES-128-CTR + HMAC-SHA1 message protection.
//!
//! The integrity check covers
//! `source_id ‖ dest_id ‖ [masked_header ‖ message_id] ‖ payload`, where the
//! bracketed part is present for V2 messages only. The digest is appended to
//! the payload and both are encrypted with a keystream whose initial counter
//! block is `source_id (BE) ‖ message_id (BE) ‖ 0u32`.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::header::{MessageVersion, HMAC_HEADER_MASK};
use crate::message_info::MessageInfo;
use crate::WireError;

type HmacSha1 = Hmac<Sha1>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// HMAC-SHA1 output length
pub const HMAC_SHA1_DIGEST_LEN: usize = 20;
/// AES-128 data key length
pub const DATA_KEY_LEN: usize = 16;
/// HMAC-SHA1 integrity key length
pub const INTEGRITY_KEY_LEN: usize = 20;

/// Symmetric key material of one session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Encryption key
    pub data_key: [u8; DATA_KEY_LEN],
    /// Integrity key
    pub integrity_key: [u8; INTEGRITY_KEY_LEN],
}

impl SessionKeys {
    /// Build from raw key material
    pub fn new(data_key: [u8; DATA_KEY_LEN], integrity_key: [u8; INTEGRITY_KEY_LEN]) -> Self {
        Self {
            data_key,
            integrity_key,
        }
    }

    /// Split a 36-byte blob into data key followed by integrity key
    pub fn from_slice(material: &[u8]) -> Result<Self, WireError> {
        if material.len() != DATA_KEY_LEN + INTEGRITY_KEY_LEN {
            return Err(WireError::InvalidArgument("session key material must be 36 bytes"));
        }
        let mut data_key = [0u8; DATA_KEY_LEN];
        let mut integrity_key = [0u8; INTEGRITY_KEY_LEN];
        data_key.copy_from_slice(&material[..DATA_KEY_LEN]);
        integrity_key.copy_from_slice(&material[DATA_KEY_LEN..]);
        Ok(Self::new(data_key, integrity_key))
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Stream cipher plus keyed MAC applied to a message region
pub struct AuthenticatedCipher<'a> {
    keys: &'a SessionKeys,
}

impl<'a> AuthenticatedCipher<'a> {
    /// Cipher over the given session keys
    pub fn new(keys: &'a SessionKeys) -> Self {
        Self { keys }
    }

    /// Compute the integrity digest of a plaintext payload
    pub fn integrity_check(
        &self,
        info: &MessageInfo,
        header_field: u16,
        payload: &[u8],
    ) -> Result<[u8; HMAC_SHA1_DIGEST_LEN], WireError> {
        let mut mac = HmacSha1::new_from_slice(&self.keys.integrity_key)
            .map_err(|_| WireError::InvalidArgument("integrity key"))?;

        mac.update(&info.source_node_id.to_le_bytes());
        mac.update(&info.dest_node_id.to_le_bytes());
        if info.message_version == MessageVersion::V2 {
            mac.update(&(header_field & HMAC_HEADER_MASK).to_le_bytes());
            mac.update(&info.message_id.to_le_bytes());
        }
        mac.update(payload);

        let mut digest = [0u8; HMAC_SHA1_DIGEST_LEN];
        digest.copy_from_slice(&mac.finalize().into_bytes());
        Ok(digest)
    }

    /// XOR `data` with the keystream for `(source_node_id, message_id)`.
    ///
    /// Encryption and decryption are the same operation.
    pub fn apply_keystream(&self, source_node_id: u64, message_id: u32, data: &mut [u8]) {
        let mut counter = [0u8; 16];
        counter[..8].copy_from_slice(&source_node_id.to_be_bytes());
        counter[8..12].copy_from_slice(&message_id.to_be_bytes());

        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(&self.keys.data_key),
            GenericArray::from_slice(&counter),
        );
        cipher.apply_keystream(data);
    }

    /// Constant-time digest comparison
    pub fn verify(expected: &[u8], received: &[u8]) -> bool {
        expected.len() == received.len() && bool::from(expected.ct_eq(received))
    }
}
