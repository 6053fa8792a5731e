//! Per-message metadata shared by the codec and the message layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::header::{EncryptionType, HeaderFlags, MessageVersion};
use crate::WireError;

/// Node id meaning "no node"
pub const NODE_ID_NOT_SPECIFIED: u64 = 0;
/// Node id addressing every node
pub const ANY_NODE_ID: u64 = u64::MAX;

bitflags! {
    /// Message flags carried alongside a message while it moves through the layer.
    ///
    /// The bits shared with [`HeaderFlags`] use the same values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MessageFlags: u32 {
        /// Keep the message id already stored in the info
        const REUSE_MESSAGE_ID = 0x0000_0010;
        /// Keep the source node id already stored in the info
        const REUSE_SOURCE_ID = 0x0000_0020;
        /// Encode but do not transmit
        const DELAY_SEND = 0x0000_0040;
        /// Caller keeps the buffer after a failed send
        const RETAIN_BUFFER = 0x0000_0080;
        /// Destination node id is present on the wire
        const DEST_NODE_ID = 0x0000_0100;
        /// Source node id is present on the wire
        const SOURCE_NODE_ID = 0x0000_0200;
        /// Payload is tunneled data
        const TUNNELED_DATA = 0x0000_0400;
        /// Sender requests group counter synchronization
        const MSG_COUNTER_SYNC_REQ = 0x0000_0800;
        /// Buffer already holds the encoded message
        const MESSAGE_ENCODED = 0x0000_1000;
        /// Send multicast from the link-local source address
        const MULTICAST_FROM_LINK_LOCAL = 0x0000_2000;
        /// Peer asked for an acknowledgement
        const PEER_REQUESTED_ACK = 0x0000_4000;
        /// Message id was already seen for this session
        const DUPLICATE_MESSAGE = 0x0000_8000;
        /// Peer's group message counter is not yet synchronized
        const PEER_GROUP_MSG_ID_NOT_SYNCHRONIZED = 0x0001_0000;
        /// Message was sent by the exchange initiator
        const FROM_INITIATOR = 0x0002_0000;
        /// Message arrived on or leaves through an ephemeral UDP port
        const VIA_EPHEMERAL_UDP_PORT = 0x0004_0000;
    }
}

impl MessageFlags {
    /// Flags mirrored into the header field
    pub fn header_flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.bits() as u16)
    }

    /// Flags taken from a decoded header field
    pub fn from_header_flags(flags: HeaderFlags) -> Self {
        MessageFlags::from_bits_truncate(flags.bits() as u32)
    }
}

/// How the peer was authenticated for the session that protected a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PeerAuthMode {
    /// Unknown
    #[default]
    NotSpecified,
    /// Message was not protected
    Unauthenticated,
    /// Certificate authenticated session
    Case,
    /// Passcode authenticated session
    Pase,
    /// Token authenticated session
    Take,
    /// Shared application group key
    GroupKey,
}

/// Identifier of the key protecting a message.
///
/// The top nibble carries the key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct KeyId(pub u16);

impl KeyId {
    /// Unencrypted messages
    pub const NONE: KeyId = KeyId(0x0000);

    const TYPE_MASK: u16 = 0xF000;
    const TYPE_GENERAL: u16 = 0x1000;
    const TYPE_SESSION: u16 = 0x2000;
    const TYPE_APP_STATIC: u16 = 0x4000;
    const TYPE_APP_ROTATING: u16 = 0x5000;

    /// Raw key type nibble
    pub fn key_type(self) -> u16 {
        self.0 & Self::TYPE_MASK
    }

    /// Whether this is the "no key" id
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Ephemeral session key established by a key agreement
    pub fn is_session_key(self) -> bool {
        self.key_type() == Self::TYPE_SESSION
    }

    /// Fabric-wide general key
    pub fn is_general_key(self) -> bool {
        self.key_type() == Self::TYPE_GENERAL
    }

    /// Application group key, static or rotating
    pub fn is_app_group_key(self) -> bool {
        matches!(
            self.key_type(),
            Self::TYPE_APP_STATIC | Self::TYPE_APP_ROTATING
        )
    }

    /// Reject ids whose type is unknown
    pub fn validate(self) -> Result<Self, WireError> {
        if self.is_none()
            || self.is_session_key()
            || self.is_general_key()
            || self.is_app_group_key()
        {
            Ok(self)
        } else {
            Err(WireError::InvalidKeyId(self.0))
        }
    }
}

/// Metadata of a single message.
///
/// Cleared before decode, mutated in place by encode and decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Sending node
    pub source_node_id: u64,
    /// Receiving node, or [`ANY_NODE_ID`]
    pub dest_node_id: u64,
    /// Per-session message counter value
    pub message_id: u32,
    /// Protecting key, [`KeyId::NONE`] when unencrypted
    pub key_id: KeyId,
    /// Protection applied to the payload
    pub encryption_type: EncryptionType,
    /// Wire format version
    pub message_version: MessageVersion,
    /// Presence and handling flags
    pub flags: MessageFlags,
    /// Authentication mode of the session that protected the message
    pub peer_auth_mode: PeerAuthMode,
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self {
            source_node_id: NODE_ID_NOT_SPECIFIED,
            dest_node_id: NODE_ID_NOT_SPECIFIED,
            message_id: 0,
            key_id: KeyId::NONE,
            encryption_type: EncryptionType::None,
            message_version: MessageVersion::V1,
            flags: MessageFlags::empty(),
            peer_auth_mode: PeerAuthMode::NotSpecified,
        }
    }
}

impl MessageInfo {
    /// Unencrypted V1 message between two nodes
    pub fn new(source_node_id: u64, dest_node_id: u64) -> Self {
        Self {
            source_node_id,
            dest_node_id,
            ..Self::default()
        }
    }

    /// Protect the message with the given key
    pub fn with_encryption(mut self, encryption_type: EncryptionType, key_id: KeyId) -> Self {
        self.encryption_type = encryption_type;
        self.key_id = key_id;
        self
    }

    /// Use the given wire format version
    pub fn with_version(mut self, version: MessageVersion) -> Self {
        self.message_version = version;
        self
    }

    /// Reset to the state expected before a decode
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Node whose session protects this message when sending
    pub fn session_peer(&self) -> u64 {
        if self.dest_node_id == ANY_NODE_ID {
            self.source_node_id
        } else {
            self.dest_node_id
        }
    }

    /// Whether the message was flagged as a duplicate on receipt
    pub fn is_duplicate(&self) -> bool {
        self.flags.contains(MessageFlags::DUPLICATE_MESSAGE)
    }

    /// Whether the message carries tunneled data
    pub fn is_tunneled_data(&self) -> bool {
        self.flags.contains(MessageFlags::TUNNELED_DATA)
    }
}
