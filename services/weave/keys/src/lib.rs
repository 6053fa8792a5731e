//! Session key table for the Weave message layer.
//!
//! Holds the key material and message counters the codec resolves through
//! [`weave_wire::SessionKeyResolver`]: per-peer session keys, shared
//! application group keys with per-peer counter synchronization state, and
//! unencrypted counters kept per peer or per connection. Inbound message ids
//! are checked against a sliding window to flag duplicates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod table;
pub mod window;

use thiserror::Error;
use weave_wire::WireError;

pub use table::{PeerSession, SessionKeyTable};
pub use window::{ReceiveWindow, WINDOW_SIZE};

/// Key table errors
#[derive(Error, Debug)]
pub enum KeyTableError {
    /// Key id failed validation
    #[error("invalid key: {0}")]
    InvalidKey(#[from] WireError),
    /// Key id has a type not accepted by the operation
    #[error("key id {0:#06x} has the wrong type for this operation")]
    WrongKeyType(u16),
    /// No key installed under this id
    #[error("key id {0:#06x} not found")]
    NotFound(u16),
}
