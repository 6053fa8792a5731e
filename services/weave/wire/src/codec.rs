//! Message encoding and decoding.
//!
//! Encoding works in place on a [`PacketBuffer`] holding only the payload:
//! the integrity trailer is appended into the tail room, payload and trailer
//! are encrypted, and the header is written into the head reserve. Decoding
//! reverses this and narrows the buffer to the payload without copying.
//!
//! ```text
//! +-----------+--------+-----------+-----------+--------+---------+-------------+
//! | hdr field | msg id | source id | dest id   | key id | payload | HMAC-SHA1   |
//! | u16       | u32    | u64 (opt) | u64 (opt) | u16    |         | 20B (opt)   |
//! +-----------+--------+-----------+-----------+--------+---------+-------------+
//! ```

use bytes::{Buf, BufMut};
use tracing::{debug, trace};

use crate::buffer::PacketBuffer;
use crate::crypto::{AuthenticatedCipher, SessionKeys, HMAC_SHA1_DIGEST_LEN};
use crate::header::{
    decode_header_field, decode_length_prefix, encode_header_field, encode_length_prefix,
    reserved_bits, EncryptionType, MessageVersion, FIXED_HEADER_LEN, KEY_ID_LEN,
    LENGTH_PREFIX_LEN, NODE_ID_LEN,
};
use crate::message_info::{KeyId, MessageFlags, MessageInfo, NODE_ID_NOT_SPECIFIED};
use crate::session::{ConnectionRef, SessionKeyResolver};
use crate::WireError;

/// Largest message a stream frame can carry
pub const MAX_FRAMED_MESSAGE_LEN: usize = u16::MAX as usize;

const HEADER_FLAG_BITS: MessageFlags = MessageFlags::SOURCE_NODE_ID
    .union(MessageFlags::DEST_NODE_ID)
    .union(MessageFlags::TUNNELED_DATA)
    .union(MessageFlags::MSG_COUNTER_SYNC_REQ);

/// Encoder/decoder bound to the local node and its session key table
#[derive(Debug)]
pub struct MessageCodec<R> {
    local_node_id: u64,
    resolver: R,
}

impl<R: SessionKeyResolver> MessageCodec<R> {
    /// Create a codec for the given node
    pub fn new(local_node_id: u64, resolver: R) -> Self {
        Self {
            local_node_id,
            resolver,
        }
    }

    /// Node id assumed for messages without a destination id
    pub fn local_node_id(&self) -> u64 {
        self.local_node_id
    }

    /// Change the local node id
    pub fn set_local_node_id(&mut self, node_id: u64) {
        self.local_node_id = node_id;
    }

    /// Session key table
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Session key table, mutable
    pub fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }

    /// Encode the payload held in `buf` into a complete message.
    ///
    /// `max_len` bounds the encoded message; `reserve` bytes of head room
    /// must remain in front of the header (for a length prefix). Buffers
    /// already flagged [`MessageFlags::MESSAGE_ENCODED`] are left untouched
    /// apart from re-deriving the destination node id from their header.
    pub fn encode_message(
        &mut self,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
        connection: Option<&ConnectionRef>,
        max_len: usize,
        reserve: usize,
    ) -> Result<(), WireError> {
        if info.flags.contains(MessageFlags::MESSAGE_ENCODED) {
            let mut existing = MessageInfo::default();
            self.decode_header(buf.data(), &mut existing, None)?;
            info.dest_node_id = existing.dest_node_id;
            return Ok(());
        }

        let encryption_type = info.encryption_type;
        let key_present = encryption_type != EncryptionType::None;
        if key_present {
            info.key_id.validate()?;
            if info.key_id.is_none() {
                return Err(WireError::InvalidKeyId(info.key_id.0));
            }
        }

        let payload_len = buf.len();
        let head_len = FIXED_HEADER_LEN
            + if info.flags.contains(MessageFlags::SOURCE_NODE_ID) { NODE_ID_LEN } else { 0 }
            + if info.flags.contains(MessageFlags::DEST_NODE_ID) { NODE_ID_LEN } else { 0 }
            + if key_present { KEY_ID_LEN } else { 0 };
        let tail_len = encryption_type.trailer_len();

        if encryption_type == EncryptionType::Aes128CtrSha1 && payload_len == 0 {
            return Err(WireError::InvalidMessageLength);
        }

        let total_len = head_len + payload_len + tail_len;
        if total_len > max_len {
            return Err(WireError::MessageTooLong {
                len: total_len,
                max: max_len,
            });
        }
        buf.ensure_head_reserve(head_len + reserve)?;
        buf.ensure_tail_capacity(tail_len)?;

        let peer = info.session_peer();
        let key_id = if key_present { info.key_id } else { KeyId::NONE };
        let (keys, request_sync) = {
            let state = self
                .resolver
                .session_state(peer, key_id, encryption_type, connection)?;
            let keys = if key_present {
                Some(
                    state
                        .keys()
                        .cloned()
                        .ok_or(WireError::KeyNotFound { peer, key_id: key_id.0 })?,
                )
            } else {
                None
            };
            if !info.flags.contains(MessageFlags::REUSE_MESSAGE_ID) {
                info.message_id = state.new_message_id();
            }
            let request_sync =
                key_id.is_app_group_key() && state.is_peer_group_msg_id_not_synchronized();
            (keys, request_sync)
        };

        if request_sync {
            info.flags |= MessageFlags::MSG_COUNTER_SYNC_REQ;
            self.resolver.on_msg_counter_sync_req_sent(peer);
        }

        let header_field = encode_header_field(
            info.flags.header_flags(),
            encryption_type,
            info.message_version,
        );
        if reserved_bits(header_field) != 0 {
            return Err(WireError::InvalidArgument("reserved header bits set"));
        }

        if let Some(keys) = keys.as_ref() {
            seal_payload(keys, info, header_field, buf)?;
        }

        buf.grow_front(head_len)?;
        let mut out = &mut buf.data_mut()[..head_len];
        out.put_u16_le(header_field);
        out.put_u32_le(info.message_id);
        if info.flags.contains(MessageFlags::SOURCE_NODE_ID) {
            out.put_u64_le(info.source_node_id);
        }
        if info.flags.contains(MessageFlags::DEST_NODE_ID) {
            out.put_u64_le(info.dest_node_id);
        }
        if key_present {
            out.put_u16_le(key_id.0);
        }

        info.flags |= MessageFlags::MESSAGE_ENCODED;
        trace!(
            msg_id = info.message_id,
            len = total_len,
            encrypted = key_present,
            "encoded message"
        );
        Ok(())
    }

    /// Parse the header at the front of `data` into `info`.
    ///
    /// Returns the header length. A missing source id is taken from
    /// `source_hint`; a missing destination id is assumed to be the local
    /// node, which is what V1 peers expect even when the datagram was
    /// addressed elsewhere.
    pub fn decode_header(
        &self,
        data: &[u8],
        info: &mut MessageInfo,
        source_hint: Option<u64>,
    ) -> Result<usize, WireError> {
        let mut cur = data;
        if cur.remaining() < FIXED_HEADER_LEN {
            return Err(WireError::InvalidMessageLength);
        }

        let field = cur.get_u16_le();
        if reserved_bits(field) != 0 {
            return Err(WireError::InvalidMessageFlag(field));
        }
        let header = decode_header_field(field);
        info.message_version = MessageVersion::try_from(header.version)?;
        info.encryption_type = EncryptionType::try_from(header.encryption_type)?;
        info.flags = (info.flags - HEADER_FLAG_BITS) | MessageFlags::from_header_flags(header.flags);
        info.message_id = cur.get_u32_le();

        if info.flags.contains(MessageFlags::SOURCE_NODE_ID) {
            if cur.remaining() < NODE_ID_LEN {
                return Err(WireError::InvalidMessageLength);
            }
            info.source_node_id = cur.get_u64_le();
        } else {
            info.source_node_id = source_hint.unwrap_or(NODE_ID_NOT_SPECIFIED);
        }

        if info.flags.contains(MessageFlags::DEST_NODE_ID) {
            if cur.remaining() < NODE_ID_LEN {
                return Err(WireError::InvalidMessageLength);
            }
            info.dest_node_id = cur.get_u64_le();
        } else {
            info.dest_node_id = self.local_node_id;
        }

        if info.encryption_type != EncryptionType::None {
            if cur.remaining() < KEY_ID_LEN {
                return Err(WireError::InvalidMessageLength);
            }
            info.key_id = KeyId(cur.get_u16_le());
        } else {
            info.key_id = KeyId::NONE;
        }

        Ok(data.len() - cur.remaining())
    }

    /// Decode a complete message held in `buf`, narrowing `buf` to the payload.
    ///
    /// On an integrity failure the ciphertext is restored before returning.
    pub fn decode_message(
        &mut self,
        buf: &mut PacketBuffer,
        source_hint: Option<u64>,
        connection: Option<&ConnectionRef>,
        info: &mut MessageInfo,
    ) -> Result<(), WireError> {
        info.flags
            .remove(MessageFlags::DUPLICATE_MESSAGE | MessageFlags::PEER_GROUP_MSG_ID_NOT_SYNCHRONIZED);
        let header_len = self.decode_header(buf.data(), info, source_hint)?;
        let header_field = u16::from_le_bytes([buf.data()[0], buf.data()[1]]);
        let body_len = buf.len() - header_len;

        match info.encryption_type {
            EncryptionType::None => {
                buf.shrink_front(header_len)?;
            }
            EncryptionType::Aes128CtrSha1 => {
                if body_len < 1 + HMAC_SHA1_DIGEST_LEN {
                    return Err(WireError::InvalidMessageLength);
                }
                let peer = info.source_node_id;
                let keys = self
                    .resolver
                    .session_state(peer, info.key_id, info.encryption_type, connection)?
                    .keys()
                    .cloned()
                    .ok_or(WireError::KeyNotFound {
                        peer,
                        key_id: info.key_id.0,
                    })?;
                open_payload(&keys, info, header_field, &mut buf.data_mut()[header_len..])?;
                buf.shrink_front(header_len)?;
                buf.set_len(body_len - HMAC_SHA1_DIGEST_LEN)?;
            }
        }

        let state = self.resolver.session_state(
            info.source_node_id,
            info.key_id,
            info.encryption_type,
            connection,
        )?;
        if state.is_duplicate_message(info.message_id) {
            info.flags |= MessageFlags::DUPLICATE_MESSAGE;
        }
        if state.is_peer_group_msg_id_not_synchronized() {
            info.flags |= MessageFlags::PEER_GROUP_MSG_ID_NOT_SYNCHRONIZED;
        }
        info.peer_auth_mode = state.auth_mode();

        debug!(
            msg_id = info.message_id,
            src = format_args!("{:016X}", info.source_node_id),
            len = buf.len(),
            duplicate = info.is_duplicate(),
            "decoded message"
        );
        Ok(())
    }

    /// Encode a message and prefix it with its 2-byte length for stream transports
    pub fn encode_message_with_length(
        &mut self,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
        connection: Option<&ConnectionRef>,
        max_len: usize,
    ) -> Result<(), WireError> {
        if info.flags.contains(MessageFlags::MESSAGE_ENCODED) {
            let framed = buf.data().get(LENGTH_PREFIX_LEN..).ok_or(WireError::InvalidMessageLength)?;
            let mut existing = MessageInfo::default();
            self.decode_header(framed, &mut existing, None)?;
            info.dest_node_id = existing.dest_node_id;
            return Ok(());
        }

        let max_len = max_len.min(MAX_FRAMED_MESSAGE_LEN);
        self.encode_message(info, buf, connection, max_len, LENGTH_PREFIX_LEN)?;

        let msg_len = buf.len();
        buf.grow_front(LENGTH_PREFIX_LEN)?;
        encode_length_prefix(msg_len, &mut buf.data_mut()[..LENGTH_PREFIX_LEN])
    }

    /// Decode the first length-prefixed message of a stream buffer.
    ///
    /// The frame is decoded in place inside `buf`. On success its bytes are
    /// consumed, leaving any pipelined data, and a copy of the payload is
    /// returned. On failure the window of `buf` is restored, as is the
    /// ciphertext after an integrity failure. [`WireError::MessageIncomplete`]
    /// means more data is needed.
    pub fn decode_message_with_length(
        &mut self,
        buf: &mut PacketBuffer,
        source_hint: Option<u64>,
        connection: Option<&ConnectionRef>,
        info: &mut MessageInfo,
    ) -> Result<PacketBuffer, WireError> {
        let msg_len = decode_length_prefix(buf.data()).ok_or(WireError::MessageIncomplete)? as usize;
        let frame_len = LENGTH_PREFIX_LEN + msg_len;

        if buf.len() < frame_len {
            if frame_len > buf.capacity() {
                return Err(WireError::MessageTooLong {
                    len: frame_len,
                    max: buf.capacity(),
                });
            }
            return Err(WireError::MessageIncomplete);
        }

        let (start, len) = (buf.start(), buf.len());
        buf.shrink_front(LENGTH_PREFIX_LEN)?;
        buf.set_len(msg_len)?;
        if let Err(e) = self.decode_message(buf, source_hint, connection, info) {
            buf.set_window(start, len)?;
            return Err(e);
        }
        let payload = PacketBuffer::from_received(buf.data());
        buf.set_window(start + frame_len, len - frame_len)?;
        Ok(payload)
    }
}

/// Append the digest to the payload and encrypt both in place
fn seal_payload(
    keys: &SessionKeys,
    info: &MessageInfo,
    header_field: u16,
    buf: &mut PacketBuffer,
) -> Result<(), WireError> {
    let cipher = AuthenticatedCipher::new(keys);
    let digest = cipher.integrity_check(info, header_field, buf.data())?;
    buf.extend_from_slice(&digest)?;
    cipher.apply_keystream(info.source_node_id, info.message_id, buf.data_mut());
    Ok(())
}

/// Decrypt payload and digest in place and verify the digest
fn open_payload(
    keys: &SessionKeys,
    info: &MessageInfo,
    header_field: u16,
    body: &mut [u8],
) -> Result<(), WireError> {
    let cipher = AuthenticatedCipher::new(keys);
    cipher.apply_keystream(info.source_node_id, info.message_id, body);

    let (payload, digest) = body.split_at(body.len() - HMAC_SHA1_DIGEST_LEN);
    let expected = cipher.integrity_check(info, header_field, payload)?;
    if !AuthenticatedCipher::verify(&expected, digest) {
        cipher.apply_keystream(info.source_node_id, info.message_id, body);
        return Err(WireError::IntegrityCheckFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{apply_address_policy, fabric_ula};
    use crate::crypto::{DATA_KEY_LEN, INTEGRITY_KEY_LEN};
    use crate::message_info::PeerAuthMode;
    use crate::session::SessionState;
    use std::collections::{HashMap, HashSet};
    use std::net::IpAddr;

    const KEY: KeyId = KeyId(0x2001);

    #[derive(Default)]
    struct TestState {
        keys: Option<SessionKeys>,
        next_id: u32,
        seen: HashSet<u32>,
        unsynchronized: bool,
    }

    impl SessionState for TestState {
        fn keys(&self) -> Option<&SessionKeys> {
            self.keys.as_ref()
        }
        fn new_message_id(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id
        }
        fn is_duplicate_message(&mut self, message_id: u32) -> bool {
            !self.seen.insert(message_id)
        }
        fn is_peer_group_msg_id_not_synchronized(&self) -> bool {
            self.unsynchronized
        }
        fn auth_mode(&self) -> PeerAuthMode {
            if self.keys.is_some() {
                PeerAuthMode::Case
            } else {
                PeerAuthMode::Unauthenticated
            }
        }
    }

    #[derive(Default)]
    struct TestResolver {
        states: HashMap<(u64, u16), TestState>,
        sync_requests: Vec<u64>,
    }

    impl SessionKeyResolver for TestResolver {
        fn session_state(
            &mut self,
            peer_node_id: u64,
            key_id: KeyId,
            _encryption_type: EncryptionType,
            _connection: Option<&ConnectionRef>,
        ) -> Result<&mut dyn SessionState, WireError> {
            let state = self.states.entry((peer_node_id, key_id.0)).or_default();
            if key_id != KeyId::NONE && state.keys.is_none() {
                state.keys = Some(SessionKeys::new([7; DATA_KEY_LEN], [9; INTEGRITY_KEY_LEN]));
            }
            Ok(state as &mut dyn SessionState)
        }

        fn on_msg_counter_sync_req_sent(&mut self, peer_node_id: u64) {
            self.sync_requests.push(peer_node_id);
        }
    }

    fn codec(local: u64) -> MessageCodec<TestResolver> {
        MessageCodec::new(local, TestResolver::default())
    }

    fn encrypted(src: u64, dst: u64) -> MessageInfo {
        let mut info = MessageInfo::new(src, dst).with_encryption(EncryptionType::Aes128CtrSha1, KEY);
        info.flags |= MessageFlags::SOURCE_NODE_ID | MessageFlags::DEST_NODE_ID;
        info
    }

    #[test]
    fn test_plain_encode_layout() {
        let mut sender = codec(1);
        let mut info = MessageInfo::new(1, 2);
        let dest = IpAddr::V6(fabric_ula(0xBEEF, 1, 2));
        apply_address_policy(&mut info, &dest, 0x1234);

        let mut buf = PacketBuffer::for_payload(&[0xAA, 0xBB]);
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();

        let data = buf.data();
        assert_eq!(data.len(), 6 + 8 + 2);
        assert_eq!(&data[..2], &[0x00, 0x12]);
        assert_eq!(&data[2..6], &1u32.to_le_bytes());
        assert_eq!(&data[6..14], &1u64.to_le_bytes());
        assert_eq!(&data[14..], &[0xAA, 0xBB]);
        assert!(info.flags.contains(MessageFlags::MESSAGE_ENCODED));
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let mut sender = codec(1);
        let mut receiver = codec(2);
        let mut info = encrypted(1, 2).with_version(MessageVersion::V2);

        let mut buf = PacketBuffer::for_payload(b"hello weave");
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();
        assert_eq!(buf.len(), 6 + 8 + 8 + 2 + 11 + 20);
        assert!(!buf.data().windows(11).any(|w| w == b"hello weave"));

        let mut rx = PacketBuffer::from_received(buf.data());
        let mut decoded = MessageInfo::default();
        receiver.decode_message(&mut rx, None, None, &mut decoded).unwrap();
        assert_eq!(rx.data(), b"hello weave");
        assert_eq!(decoded.source_node_id, 1);
        assert_eq!(decoded.dest_node_id, 2);
        assert_eq!(decoded.message_id, info.message_id);
        assert_eq!(decoded.key_id, KEY);
        assert_eq!(decoded.message_version, MessageVersion::V2);
        assert_eq!(decoded.peer_auth_mode, PeerAuthMode::Case);
        assert!(!decoded.is_duplicate());
    }

    #[test]
    fn test_tampered_message_rejected_and_restored() {
        let mut sender = codec(1);
        let mut receiver = codec(2);
        let mut info = encrypted(1, 2);
        let mut buf = PacketBuffer::for_payload(b"payload");
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();

        let mut wire = buf.data().to_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let mut rx = PacketBuffer::from_received(&wire);
        let mut decoded = MessageInfo::default();
        assert_eq!(
            receiver.decode_message(&mut rx, None, None, &mut decoded),
            Err(WireError::IntegrityCheckFailed)
        );
        assert_eq!(rx.data(), &wire[..]);
    }

    #[test]
    fn test_encrypted_empty_payload_rejected() {
        let mut sender = codec(1);
        let mut info = encrypted(1, 2);
        let mut buf = PacketBuffer::for_payload(&[]);
        assert_eq!(
            sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0),
            Err(WireError::InvalidMessageLength)
        );
    }

    #[test]
    fn test_length_and_reserve_limits() {
        let mut sender = codec(1);
        let mut info = MessageInfo::new(1, 2);
        let mut buf = PacketBuffer::for_payload(&[0u8; 100]);
        assert!(matches!(
            sender.encode_message(&mut info, &mut buf, None, 100, 0),
            Err(WireError::MessageTooLong { len: 106, max: 100 })
        ));

        let mut buf = PacketBuffer::from_payload(&[0u8; 4], 5, 0);
        assert_eq!(
            sender.encode_message(&mut info, &mut buf, None, 1000, 0),
            Err(WireError::BufferTooSmall)
        );

        let mut info = encrypted(1, 2);
        let mut buf = PacketBuffer::from_payload(&[0u8; 4], 32, 10);
        assert_eq!(
            sender.encode_message(&mut info, &mut buf, None, 1000, 0),
            Err(WireError::BufferTooSmall)
        );
        assert_eq!(buf.data(), &[0u8; 4]);
    }

    #[test]
    fn test_reencode_is_noop() {
        let mut sender = codec(1);
        let mut info = encrypted(1, 2);
        let mut buf = PacketBuffer::for_payload(b"retransmit me");
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();
        let first = buf.data().to_vec();
        let msg_id = info.message_id;

        info.dest_node_id = 99;
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();
        assert_eq!(buf.data(), &first[..]);
        assert_eq!(info.dest_node_id, 2);
        assert_eq!(info.message_id, msg_id);
    }

    #[test]
    fn test_reused_message_id_flagged_duplicate() {
        let mut sender = codec(1);
        let mut receiver = codec(2);
        let mut results = Vec::new();
        for _ in 0..2 {
            let mut info = encrypted(1, 2);
            info.message_id = 500;
            info.flags |= MessageFlags::REUSE_MESSAGE_ID;
            let mut buf = PacketBuffer::for_payload(b"again");
            sender
                .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
                .unwrap();
            let mut decoded = MessageInfo::default();
            receiver.decode_message(&mut buf, None, None, &mut decoded).unwrap();
            results.push(decoded.is_duplicate());
        }
        assert_eq!(results, vec![false, true]);
    }

    #[test]
    fn test_group_key_requests_counter_sync() {
        let mut sender = codec(1);
        sender
            .resolver_mut()
            .states
            .entry((2, 0x4001))
            .or_default()
            .unsynchronized = true;
        let mut info = encrypted(1, 2).with_encryption(EncryptionType::Aes128CtrSha1, KeyId(0x4001));
        let mut buf = PacketBuffer::for_payload(b"group");
        sender
            .encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0)
            .unwrap();
        assert!(info.flags.contains(MessageFlags::MSG_COUNTER_SYNC_REQ));
        assert_eq!(sender.resolver().sync_requests, vec![2]);
        assert_eq!(buf.data()[1] & 0x08, 0x08);
    }

    #[test]
    fn test_decode_header_defaults_and_errors() {
        let receiver = codec(0x42);
        let mut info = MessageInfo::default();

        let data = [0x00, 0x10, 5, 0, 0, 0];
        assert_eq!(receiver.decode_header(&data, &mut info, Some(7)), Ok(6));
        assert_eq!(info.source_node_id, 7);
        assert_eq!(info.dest_node_id, 0x42);
        assert_eq!(info.message_id, 5);

        let reserved = [0x01, 0x10, 5, 0, 0, 0];
        assert_eq!(
            receiver.decode_header(&reserved, &mut info, None),
            Err(WireError::InvalidMessageFlag(0x1001))
        );

        let bad_version = [0x00, 0x30, 5, 0, 0, 0];
        assert_eq!(
            receiver.decode_header(&bad_version, &mut info, None),
            Err(WireError::UnsupportedMessageVersion(3))
        );

        let truncated_source = [0x00, 0x12, 5, 0, 0, 0, 1, 2, 3];
        assert_eq!(
            receiver.decode_header(&truncated_source, &mut info, None),
            Err(WireError::InvalidMessageLength)
        );

        let missing_key = [0x10, 0x10, 5, 0, 0, 0, 1];
        assert_eq!(
            receiver.decode_header(&missing_key, &mut info, None),
            Err(WireError::InvalidMessageLength)
        );

        let bad_encryption = [0x20, 0x10, 5, 0, 0, 0, 1, 0];
        assert_eq!(
            receiver.decode_header(&bad_encryption, &mut info, None),
            Err(WireError::UnsupportedEncryptionType(2))
        );
    }

    #[test]
    fn test_stream_framing_pipeline() {
        let mut sender = codec(1);
        let mut receiver = codec(2);

        let mut stream = PacketBuffer::with_capacity(256, 0);
        for payload in [&b"first"[..], &b"second"[..]] {
            let mut info = encrypted(1, 2);
            let mut buf = PacketBuffer::for_payload(payload);
            sender
                .encode_message_with_length(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN)
                .unwrap();
            let declared = u16::from_le_bytes([buf.data()[0], buf.data()[1]]) as usize;
            assert_eq!(declared, buf.len() - LENGTH_PREFIX_LEN);
            stream.extend_from_slice(buf.data()).unwrap();
        }
        stream.extend_from_slice(&[0xEE; 3]).unwrap();

        let mut info = MessageInfo::default();
        let first = receiver
            .decode_message_with_length(&mut stream, None, None, &mut info)
            .unwrap();
        assert_eq!(first.data(), b"first");

        let second = receiver
            .decode_message_with_length(&mut stream, None, None, &mut info)
            .unwrap();
        assert_eq!(second.data(), b"second");
        assert_eq!(stream.data(), &[0xEE; 3]);
    }

    #[test]
    fn test_stream_framing_decodes_in_place() {
        let mut sender = codec(1);
        let mut receiver = codec(2);
        let mut info = encrypted(1, 2);
        let mut buf = PacketBuffer::for_payload(b"in place");
        sender
            .encode_message_with_length(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN)
            .unwrap();
        let frame_len = buf.len();

        let mut stream = PacketBuffer::with_capacity(128, 4);
        stream.extend_from_slice(buf.data()).unwrap();
        stream.extend_from_slice(b"next").unwrap();

        let mut decoded = MessageInfo::default();
        let payload = receiver
            .decode_message_with_length(&mut stream, None, None, &mut decoded)
            .unwrap();
        assert_eq!(payload.data(), b"in place");
        assert_eq!(stream.start(), 4 + frame_len);
        assert_eq!(stream.data(), b"next");
        assert_eq!(stream.capacity(), 128);

        // The plaintext was written over the received ciphertext.
        stream.set_window(4, frame_len).unwrap();
        assert!(stream.data().windows(8).any(|w| w == b"in place"));
    }

    #[test]
    fn test_stream_framing_incomplete_and_oversized() {
        let mut sender = codec(1);
        let mut receiver = codec(2);
        let mut info = MessageInfo::new(1, 2);
        info.flags |= MessageFlags::SOURCE_NODE_ID;
        let mut buf = PacketBuffer::for_payload(b"partial frame");
        sender
            .encode_message_with_length(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN)
            .unwrap();

        let mut stream = PacketBuffer::with_capacity(64, 0);
        stream.extend_from_slice(&buf.data()[..10]).unwrap();
        let before = stream.clone();
        let mut decoded = MessageInfo::default();
        assert_eq!(
            receiver.decode_message_with_length(&mut stream, None, None, &mut decoded),
            Err(WireError::MessageIncomplete)
        );
        assert_eq!(stream, before);

        let mut small = PacketBuffer::with_capacity(8, 0);
        small.extend_from_slice(&[0xFF, 0x00, 1, 2]).unwrap();
        assert!(matches!(
            receiver.decode_message_with_length(&mut small, None, None, &mut decoded),
            Err(WireError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_stream_framing_restores_on_decode_failure() {
        let mut receiver = codec(2);
        let mut stream = PacketBuffer::with_capacity(64, 0);
        stream
            .extend_from_slice(&[0x06, 0x00, 0x0F, 0x10, 1, 0, 0, 0])
            .unwrap();
        let before = stream.clone();
        let mut decoded = MessageInfo::default();
        assert_eq!(
            receiver.decode_message_with_length(&mut stream, None, None, &mut decoded),
            Err(WireError::InvalidMessageFlag(0x100F))
        );
        assert_eq!(stream, before);
    }
}
