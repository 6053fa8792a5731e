//! Weave message layer
//!
//! This crate carries Weave messages over UDP and TCP. It owns the bound
//! endpoints, a fixed pool of stream connections and, with the `tunneling`
//! feature, a pool of tunnels that relay bytes between two connections.
//!
//! # Architecture
//!
//! The layer is single-threaded and poll-driven:
//!
//! - **Inet** ([`inet`]): the socket contract, with a loopback
//!   implementation for tests ([`loopback`]) and a socket2 one ([`system`])
//! - **EndpointSet** ([`endpoints`]): general-purpose UDP/TCP endpoints per IP
//!   version plus per-address UDP endpoints for local fabric ULAs
//! - **Pools** ([`pool`], [`connection`], [`tunnel`]): generation-checked
//!   slots with admission control
//! - **MessageLayer** ([`layer`]): send, resend and receive dispatch to a
//!   [`MessageLayerHandler`]
//!
//! ```ignore
//! let mut layer = MessageLayer::new(SystemInet::default(), SessionKeyTable::new(), config)?;
//! layer.set_handler(MyHandler::default());
//! layer.refresh_endpoints()?;
//! loop {
//!     layer.poll()?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod endpoints;
pub mod error;
pub mod handler;
pub mod inet;
pub mod layer;
pub mod loopback;
pub mod pool;
pub mod system;
#[cfg(feature = "tunneling")]
pub mod tunnel;

pub use config::LayerConfig;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use endpoints::{BoundEndpoint, EndpointSet, EndpointState};
pub use error::{is_benign_multicast_error, LayerError};
pub use handler::{MessageLayerHandler, MessageSource, ReceivedMessage};
pub use inet::{
    InetLayer, InterfaceAddress, InterfaceId, InterfaceInfo, IpVersion, PacketInfo, TcpEndpoint,
    UdpEndpoint,
};
pub use layer::{describe_peer, MessageLayer};
pub use loopback::LoopbackInet;
pub use pool::{Handle, Pool};
pub use system::SystemInet;
#[cfg(feature = "tunneling")]
pub use tunnel::{RelayStatus, Tunnel, TunnelId};
