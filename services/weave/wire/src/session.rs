//! Contract between the codec and the session key table.
//!
//! The table owns message counters and key material; the codec only asks it
//! to allocate ids, check for duplicates and report synchronization state.

use crate::crypto::SessionKeys;
use crate::header::EncryptionType;
use crate::message_info::{KeyId, PeerAuthMode};
use crate::WireError;

/// Stream connection a message travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    /// Stable identifier of the connection while it is open
    pub id: u64,
    /// Node id of the remote end, if known
    pub peer_node_id: u64,
}

/// State of one (peer, key) session
pub trait SessionState {
    /// Key material, `None` for unencrypted sessions
    fn keys(&self) -> Option<&SessionKeys>;

    /// Allocate the next outbound message id
    fn new_message_id(&mut self) -> u32;

    /// Record an inbound message id, returning whether it was already seen
    fn is_duplicate_message(&mut self, message_id: u32) -> bool;

    /// Whether the peer's group message counter is not yet synchronized
    fn is_peer_group_msg_id_not_synchronized(&self) -> bool;

    /// How the peer was authenticated
    fn auth_mode(&self) -> PeerAuthMode;
}

/// Lookup of session state by peer and key
pub trait SessionKeyResolver {
    /// Session state for the peer and key, creating counters on demand
    fn session_state(
        &mut self,
        peer_node_id: u64,
        key_id: KeyId,
        encryption_type: EncryptionType,
        connection: Option<&ConnectionRef>,
    ) -> Result<&mut dyn SessionState, WireError>;

    /// A message carrying a counter synchronization request is being sent
    fn on_msg_counter_sync_req_sent(&mut self, _peer_node_id: u64) {}

    /// A connection closed; per-connection counters may be dropped
    fn connection_closed(&mut self, _connection_id: u64) {}
}
