//! Property-based tests for the message codec running against the key table
//!
//! Uses proptest to check round-trips, tamper detection, duplicate detection
//! and stream framing over random ids, flags and payloads.

use proptest::prelude::*;

use weave_keys::SessionKeyTable;
use weave_wire::crypto::{DATA_KEY_LEN, INTEGRITY_KEY_LEN};
use weave_wire::{
    EncryptionType, KeyId, MessageCodec, MessageFlags, MessageInfo, MessageVersion, PacketBuffer,
    PeerAuthMode, SessionKeys, WireError, MAX_FRAMED_MESSAGE_LEN,
};

const KEY: KeyId = KeyId(0x2042);

fn session_keys() -> SessionKeys {
    SessionKeys::new([0x5A; DATA_KEY_LEN], [0xC3; INTEGRITY_KEY_LEN])
}

/// Sender and receiver codecs sharing a session key
fn codec_pair(src: u64, dst: u64) -> (MessageCodec<SessionKeyTable>, MessageCodec<SessionKeyTable>) {
    let mut sender_keys = SessionKeyTable::new();
    sender_keys
        .add_session_key(dst, KEY, session_keys(), PeerAuthMode::Case)
        .unwrap();
    let mut receiver_keys = SessionKeyTable::new();
    receiver_keys
        .add_session_key(src, KEY, session_keys(), PeerAuthMode::Case)
        .unwrap();
    (
        MessageCodec::new(src, sender_keys),
        MessageCodec::new(dst, receiver_keys),
    )
}

fn message_info(
    src: u64,
    dst: u64,
    encrypted: bool,
    v2: bool,
    with_source: bool,
    with_dest: bool,
) -> MessageInfo {
    let mut info = MessageInfo::new(src, dst);
    if encrypted {
        info = info.with_encryption(EncryptionType::Aes128CtrSha1, KEY);
    }
    if v2 {
        info = info.with_version(MessageVersion::V2);
    }
    if with_source {
        info.flags |= MessageFlags::SOURCE_NODE_ID;
    }
    if with_dest {
        info.flags |= MessageFlags::DEST_NODE_ID;
    }
    info
}

fn node_id() -> impl Strategy<Value = u64> {
    1u64..u64::MAX - 1
}

proptest! {
    /// Decode recovers payload and ids of anything encode produced
    #[test]
    fn roundtrip(
        src in node_id(),
        dst in node_id(),
        payload in prop::collection::vec(any::<u8>(), 1..512),
        encrypted in any::<bool>(),
        v2 in any::<bool>(),
        with_source in any::<bool>(),
        with_dest in any::<bool>(),
    ) {
        let (mut sender, mut receiver) = codec_pair(src, dst);
        let mut info = message_info(src, dst, encrypted, v2, with_source, with_dest);

        let mut buf = PacketBuffer::for_payload(&payload);
        sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0).unwrap();

        let mut decoded = MessageInfo::default();
        receiver.decode_message(&mut buf, Some(src), None, &mut decoded).unwrap();

        prop_assert_eq!(buf.data(), &payload[..]);
        prop_assert_eq!(decoded.source_node_id, src);
        prop_assert_eq!(decoded.dest_node_id, dst);
        prop_assert_eq!(decoded.message_id, info.message_id);
        prop_assert_eq!(decoded.encryption_type, info.encryption_type);
        prop_assert_eq!(decoded.message_version, info.message_version);
        prop_assert!(!decoded.is_duplicate());
    }

    /// Flipping any bit of an encrypted body fails the integrity check
    #[test]
    fn tamper_detected(
        src in node_id(),
        dst in node_id(),
        payload in prop::collection::vec(any::<u8>(), 1..256),
        v2 in any::<bool>(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (mut sender, mut receiver) = codec_pair(src, dst);
        let mut info = message_info(src, dst, true, v2, true, true);

        let mut buf = PacketBuffer::for_payload(&payload);
        sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0).unwrap();

        let header_len = 6 + 8 + 8 + 2;
        let mut wire = buf.data().to_vec();
        let body_len = wire.len() - header_len;
        wire[header_len + position.index(body_len)] ^= 1 << bit;

        let mut rx = PacketBuffer::from_received(&wire);
        let mut decoded = MessageInfo::default();
        prop_assert_eq!(
            receiver.decode_message(&mut rx, None, None, &mut decoded),
            Err(WireError::IntegrityCheckFailed)
        );
    }

    /// A reused message id is flagged the second time it arrives
    #[test]
    fn reused_message_id_is_duplicate(
        src in node_id(),
        dst in node_id(),
        message_id in any::<u32>(),
        encrypted in any::<bool>(),
    ) {
        let (mut sender, mut receiver) = codec_pair(src, dst);
        let mut flagged = Vec::new();
        for _ in 0..2 {
            let mut info = message_info(src, dst, encrypted, false, true, true);
            info.message_id = message_id;
            info.flags |= MessageFlags::REUSE_MESSAGE_ID;

            let mut buf = PacketBuffer::for_payload(b"ping");
            sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0).unwrap();
            prop_assert_eq!(info.message_id, message_id);

            let mut decoded = MessageInfo::default();
            receiver.decode_message(&mut buf, None, None, &mut decoded).unwrap();
            flagged.push(decoded.is_duplicate());
        }
        prop_assert_eq!(flagged, vec![false, true]);
    }

    /// One framed message plus trailing bytes leaves exactly the trailing bytes
    #[test]
    fn framing_leaves_trailing_bytes(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        trailing in prop::collection::vec(any::<u8>(), 0..64),
        encrypted in any::<bool>(),
    ) {
        let (mut sender, mut receiver) = codec_pair(1, 2);
        let mut info = message_info(1, 2, encrypted, true, true, true);
        let mut buf = PacketBuffer::for_payload(&payload);
        sender.encode_message_with_length(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN).unwrap();

        let mut stream = PacketBuffer::with_capacity(1024, 0);
        stream.extend_from_slice(buf.data()).unwrap();
        stream.extend_from_slice(&trailing).unwrap();

        let mut decoded = MessageInfo::default();
        let message = receiver
            .decode_message_with_length(&mut stream, None, None, &mut decoded)
            .unwrap();
        prop_assert_eq!(message.data(), &payload[..]);
        prop_assert_eq!(stream.data(), &trailing[..]);
    }

    /// A truncated frame is incomplete and leaves the stream untouched
    #[test]
    fn truncated_frame_is_incomplete(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        cut in any::<prop::sample::Index>(),
    ) {
        let (mut sender, mut receiver) = codec_pair(1, 2);
        let mut info = message_info(1, 2, true, false, true, true);
        let mut buf = PacketBuffer::for_payload(&payload);
        sender.encode_message_with_length(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN).unwrap();

        let keep = cut.index(buf.len());
        let mut stream = PacketBuffer::with_capacity(1024, 0);
        stream.extend_from_slice(&buf.data()[..keep]).unwrap();
        let before = stream.clone();

        let mut decoded = MessageInfo::default();
        prop_assert_eq!(
            receiver.decode_message_with_length(&mut stream, None, None, &mut decoded).err(),
            Some(WireError::MessageIncomplete)
        );
        prop_assert_eq!(stream, before);
    }

    /// Any reserved header bit makes decode fail
    #[test]
    fn reserved_bits_rejected(
        reserved in 1u16..16,
        message_id in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let (_, mut receiver) = codec_pair(1, 2);
        let field = 0x1000u16 | reserved;
        let mut wire = field.to_le_bytes().to_vec();
        wire.extend_from_slice(&message_id.to_le_bytes());
        wire.extend_from_slice(&payload);

        let mut rx = PacketBuffer::from_received(&wire);
        let mut decoded = MessageInfo::default();
        prop_assert_eq!(
            receiver.decode_message(&mut rx, None, None, &mut decoded),
            Err(WireError::InvalidMessageFlag(field))
        );
    }

    /// Encoding an already encoded message changes nothing
    #[test]
    fn reencode_is_idempotent(
        payload in prop::collection::vec(any::<u8>(), 1..128),
        encrypted in any::<bool>(),
    ) {
        let (mut sender, _) = codec_pair(1, 2);
        let mut info = message_info(1, 2, encrypted, true, true, true);
        let mut buf = PacketBuffer::for_payload(&payload);
        sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0).unwrap();

        let first = buf.clone();
        let first_info = info.clone();
        sender.encode_message(&mut info, &mut buf, None, MAX_FRAMED_MESSAGE_LEN, 0).unwrap();
        prop_assert_eq!(buf, first);
        prop_assert_eq!(info, first_info);
    }
}
