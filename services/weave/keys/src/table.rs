//! In-memory session key table

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use weave_wire::{
    ConnectionRef, EncryptionType, KeyId, PeerAuthMode, SessionKeyResolver, SessionKeys,
    SessionState, WireError,
};

use crate::window::ReceiveWindow;
use crate::KeyTableError;

/// Outbound message counter, private to a session or shared by a group key
#[derive(Debug, Clone)]
enum MessageCounter {
    Session(u32),
    Shared(Arc<AtomicU32>),
}

impl MessageCounter {
    fn next(&mut self) -> u32 {
        match self {
            MessageCounter::Session(next) => {
                let id = *next;
                *next = next.wrapping_add(1);
                id
            }
            MessageCounter::Shared(next) => next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Counters and key material for one peer under one key
#[derive(Debug)]
pub struct PeerSession {
    keys: Option<SessionKeys>,
    auth_mode: PeerAuthMode,
    counter: MessageCounter,
    window: ReceiveWindow,
    group_key: bool,
    synchronized: bool,
}

impl PeerSession {
    fn unencrypted() -> Self {
        Self {
            keys: None,
            auth_mode: PeerAuthMode::Unauthenticated,
            counter: MessageCounter::Session(1),
            window: ReceiveWindow::new(),
            group_key: false,
            synchronized: true,
        }
    }

    fn keyed(keys: SessionKeys, auth_mode: PeerAuthMode) -> Self {
        Self {
            keys: Some(keys),
            auth_mode,
            counter: MessageCounter::Session(1),
            window: ReceiveWindow::new(),
            group_key: false,
            synchronized: true,
        }
    }

    fn group(group: &GroupKey) -> Self {
        Self {
            keys: Some(group.keys.clone()),
            auth_mode: PeerAuthMode::GroupKey,
            counter: MessageCounter::Shared(Arc::clone(&group.counter)),
            window: ReceiveWindow::new(),
            group_key: true,
            synchronized: false,
        }
    }

    /// Highest message id received from the peer
    pub fn max_received(&self) -> Option<u32> {
        self.window.max_received()
    }
}

impl SessionState for PeerSession {
    fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    fn new_message_id(&mut self) -> u32 {
        self.counter.next()
    }

    fn is_duplicate_message(&mut self, message_id: u32) -> bool {
        self.window.check_and_record(message_id)
    }

    fn is_peer_group_msg_id_not_synchronized(&self) -> bool {
        self.group_key && !self.synchronized
    }

    fn auth_mode(&self) -> PeerAuthMode {
        self.auth_mode
    }
}

#[derive(Debug)]
struct GroupKey {
    keys: SessionKeys,
    counter: Arc<AtomicU32>,
}

/// Session key table resolving (peer, key id) pairs for the codec.
///
/// Session and general keys are installed per peer. Application group keys
/// are installed once and shared: every member uses the same key material
/// and one outbound counter, while each peer gets its own receive window
/// which starts out unsynchronized. Unencrypted traffic is tracked per peer
/// for datagrams and per connection for stream traffic.
#[derive(Debug, Default)]
pub struct SessionKeyTable {
    sessions: HashMap<(u64, KeyId), PeerSession>,
    group_keys: HashMap<KeyId, GroupKey>,
    unencrypted: HashMap<u64, PeerSession>,
    connections: HashMap<u64, PeerSession>,
    pending_sync: HashSet<u64>,
}

impl SessionKeyTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install key material for a session or general key shared with a peer
    pub fn add_session_key(
        &mut self,
        peer_node_id: u64,
        key_id: KeyId,
        keys: SessionKeys,
        auth_mode: PeerAuthMode,
    ) -> Result<(), KeyTableError> {
        let key_id = key_id.validate()?;
        if !(key_id.is_session_key() || key_id.is_general_key()) {
            return Err(KeyTableError::WrongKeyType(key_id.0));
        }
        info!(
            peer = format_args!("{:016X}", peer_node_id),
            key_id = format_args!("{:#06x}", key_id.0),
            "session key installed"
        );
        self.sessions
            .insert((peer_node_id, key_id), PeerSession::keyed(keys, auth_mode));
        Ok(())
    }

    /// Remove a session key, returning whether it was present
    pub fn remove_session_key(&mut self, peer_node_id: u64, key_id: KeyId) -> bool {
        self.sessions.remove(&(peer_node_id, key_id)).is_some()
    }

    /// Install an application group key with its initial outbound counter
    pub fn add_group_key(
        &mut self,
        key_id: KeyId,
        keys: SessionKeys,
        initial_counter: u32,
    ) -> Result<(), KeyTableError> {
        let key_id = key_id.validate()?;
        if !key_id.is_app_group_key() {
            return Err(KeyTableError::WrongKeyType(key_id.0));
        }
        info!(key_id = format_args!("{:#06x}", key_id.0), "group key installed");
        self.sessions.retain(|(_, id), _| *id != key_id);
        self.group_keys.insert(
            key_id,
            GroupKey {
                keys,
                counter: Arc::new(AtomicU32::new(initial_counter)),
            },
        );
        Ok(())
    }

    /// Record the peer's group counter, learned through a counter sync exchange
    pub fn mark_peer_group_counter_synchronized(
        &mut self,
        peer_node_id: u64,
        key_id: KeyId,
        peer_counter: u32,
    ) -> Result<(), KeyTableError> {
        let group = self
            .group_keys
            .get(&key_id)
            .ok_or(KeyTableError::NotFound(key_id.0))?;
        let session = self
            .sessions
            .entry((peer_node_id, key_id))
            .or_insert_with(|| PeerSession::group(group));
        session.synchronized = true;
        session.window = ReceiveWindow::synchronized_at(peer_counter);
        self.pending_sync.remove(&peer_node_id);
        debug!(
            peer = format_args!("{:016X}", peer_node_id),
            counter = peer_counter,
            "group counter synchronized"
        );
        Ok(())
    }

    /// Whether a counter sync request to the peer is outstanding
    pub fn is_sync_request_pending(&self, peer_node_id: u64) -> bool {
        self.pending_sync.contains(&peer_node_id)
    }

    /// Session for a peer and key, if one exists
    pub fn session(&self, peer_node_id: u64, key_id: KeyId) -> Option<&PeerSession> {
        if key_id.is_none() {
            self.unencrypted.get(&peer_node_id)
        } else {
            self.sessions.get(&(peer_node_id, key_id))
        }
    }

    /// Number of per-connection sessions currently tracked
    pub fn connection_session_count(&self) -> usize {
        self.connections.len()
    }
}

impl SessionKeyResolver for SessionKeyTable {
    fn session_state(
        &mut self,
        peer_node_id: u64,
        key_id: KeyId,
        encryption_type: EncryptionType,
        connection: Option<&ConnectionRef>,
    ) -> Result<&mut dyn SessionState, WireError> {
        if encryption_type == EncryptionType::None || key_id.is_none() {
            let session = match connection {
                Some(con) => self
                    .connections
                    .entry(con.id)
                    .or_insert_with(PeerSession::unencrypted),
                None => self
                    .unencrypted
                    .entry(peer_node_id)
                    .or_insert_with(PeerSession::unencrypted),
            };
            return Ok(session);
        }

        if key_id.is_app_group_key() {
            let group = self.group_keys.get(&key_id).ok_or(WireError::KeyNotFound {
                peer: peer_node_id,
                key_id: key_id.0,
            })?;
            let session = self
                .sessions
                .entry((peer_node_id, key_id))
                .or_insert_with(|| PeerSession::group(group));
            return Ok(session);
        }

        match self.sessions.get_mut(&(peer_node_id, key_id)) {
            Some(session) => Ok(session),
            None => Err(WireError::KeyNotFound {
                peer: peer_node_id,
                key_id: key_id.0,
            }),
        }
    }

    fn on_msg_counter_sync_req_sent(&mut self, peer_node_id: u64) {
        self.pending_sync.insert(peer_node_id);
    }

    fn connection_closed(&mut self, connection_id: u64) {
        if self.connections.remove(&connection_id).is_some() {
            debug!(connection = connection_id, "dropped connection counters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_wire::crypto::{DATA_KEY_LEN, INTEGRITY_KEY_LEN};

    fn keys(seed: u8) -> SessionKeys {
        SessionKeys::new([seed; DATA_KEY_LEN], [seed; INTEGRITY_KEY_LEN])
    }

    #[test]
    fn test_session_key_lookup() {
        let mut table = SessionKeyTable::new();
        table
            .add_session_key(7, KeyId(0x2001), keys(1), PeerAuthMode::Case)
            .unwrap();

        let state = table
            .session_state(7, KeyId(0x2001), EncryptionType::Aes128CtrSha1, None)
            .unwrap();
        assert!(state.keys().is_some());
        assert_eq!(state.auth_mode(), PeerAuthMode::Case);
        assert_eq!(state.new_message_id(), 1);
        assert_eq!(state.new_message_id(), 2);

        assert_eq!(
            table
                .session_state(8, KeyId(0x2001), EncryptionType::Aes128CtrSha1, None)
                .err(),
            Some(WireError::KeyNotFound { peer: 8, key_id: 0x2001 })
        );
    }

    #[test]
    fn test_rejects_wrong_key_types() {
        let mut table = SessionKeyTable::new();
        assert!(matches!(
            table.add_session_key(1, KeyId(0x4001), keys(1), PeerAuthMode::Case),
            Err(KeyTableError::WrongKeyType(0x4001))
        ));
        assert!(matches!(
            table.add_group_key(KeyId(0x2001), keys(1), 0),
            Err(KeyTableError::WrongKeyType(0x2001))
        ));
        assert!(table.add_session_key(1, KeyId(0x3001), keys(1), PeerAuthMode::Case).is_err());
    }

    #[test]
    fn test_unencrypted_counters_per_peer_and_connection() {
        let mut table = SessionKeyTable::new();
        let con = ConnectionRef { id: 3, peer_node_id: 9 };

        let udp = table.session_state(9, KeyId::NONE, EncryptionType::None, None).unwrap();
        assert_eq!(udp.auth_mode(), PeerAuthMode::Unauthenticated);
        assert!(!udp.is_duplicate_message(40));

        let tcp = table
            .session_state(9, KeyId::NONE, EncryptionType::None, Some(&con))
            .unwrap();
        assert!(!tcp.is_duplicate_message(40));
        assert!(tcp.is_duplicate_message(40));
        assert_eq!(table.connection_session_count(), 1);

        table.connection_closed(3);
        assert_eq!(table.connection_session_count(), 0);
    }

    #[test]
    fn test_group_key_shared_counter_and_sync() {
        let mut table = SessionKeyTable::new();
        table.add_group_key(KeyId(0x4001), keys(2), 100).unwrap();

        let a = table
            .session_state(1, KeyId(0x4001), EncryptionType::Aes128CtrSha1, None)
            .unwrap();
        assert_eq!(a.auth_mode(), PeerAuthMode::GroupKey);
        assert!(a.is_peer_group_msg_id_not_synchronized());
        assert_eq!(a.new_message_id(), 100);

        let b = table
            .session_state(2, KeyId(0x4001), EncryptionType::Aes128CtrSha1, None)
            .unwrap();
        assert_eq!(b.new_message_id(), 101);
        assert!(!b.is_duplicate_message(5000));

        table.on_msg_counter_sync_req_sent(2);
        assert!(table.is_sync_request_pending(2));

        table
            .mark_peer_group_counter_synchronized(2, KeyId(0x4001), 6000)
            .unwrap();
        assert!(!table.is_sync_request_pending(2));
        let b = table
            .session_state(2, KeyId(0x4001), EncryptionType::Aes128CtrSha1, None)
            .unwrap();
        assert!(!b.is_peer_group_msg_id_not_synchronized());
        assert!(b.is_duplicate_message(6000));
        assert!(!b.is_duplicate_message(6001));
    }

    #[test]
    fn test_unknown_group_key() {
        let mut table = SessionKeyTable::new();
        assert!(table
            .session_state(1, KeyId(0x5001), EncryptionType::Aes128CtrSha1, None)
            .is_err());
        assert!(matches!(
            table.mark_peer_group_counter_synchronized(1, KeyId(0x5001), 0),
            Err(KeyTableError::NotFound(0x5001))
        ));
    }
}
