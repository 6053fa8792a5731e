//! Message layer configuration.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use weave_wire::{NODE_ID_NOT_SPECIFIED, WEAVE_PORT};

use crate::error::LayerError;
use crate::inet::InterfaceId;

/// Runtime options of a [`MessageLayer`](crate::MessageLayer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Node id of this node
    pub local_node_id: u64,
    /// Fabric this node belongs to, 0 when not in a fabric
    pub fabric_id: u64,
    /// UDP and TCP port
    pub port: u16,
    /// Accept inbound stream connections
    pub listen_tcp: bool,
    /// Receive datagrams
    pub listen_udp: bool,
    /// Bind IPv4 endpoints
    pub listen_ipv4: bool,
    /// Bind IPv6 endpoints
    pub listen_ipv6: bool,
    /// Bind only this address instead of all addresses
    pub listen_addr: Option<IpAddr>,
    /// Restrict endpoints to one interface
    pub listen_interface: Option<InterfaceId>,
    /// Connection pool size
    pub max_connections: usize,
    /// Tunnel pool size
    pub max_tunnels: usize,
    /// Interface table size
    pub max_interfaces: usize,
    /// Per-address UDP endpoint table size
    pub max_local_addr_udp_endpoints: usize,
    /// Largest datagram or framed message accepted
    pub max_message_len: usize,
    /// Receive buffer of each connection
    pub connection_rx_buffer: usize,
    /// Listen backlog of the TCP listeners
    pub tcp_backlog: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            local_node_id: NODE_ID_NOT_SPECIFIED,
            fabric_id: 0,
            port: WEAVE_PORT,
            listen_tcp: true,
            listen_udp: true,
            listen_ipv4: true,
            listen_ipv6: true,
            listen_addr: None,
            listen_interface: None,
            max_connections: 8,
            max_tunnels: 4,
            max_interfaces: 4,
            max_local_addr_udp_endpoints: 4,
            max_message_len: u16::MAX as usize,
            connection_rx_buffer: 4096,
            tcp_backlog: 10,
        }
    }
}

impl LayerConfig {
    /// Configuration for a node in a fabric with default options
    pub fn for_node(local_node_id: u64, fabric_id: u64) -> Self {
        Self {
            local_node_id,
            fabric_id,
            ..Self::default()
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), LayerError> {
        if self.max_connections == 0 {
            return Err(LayerError::InvalidConfig("max_connections must be non-zero".into()));
        }
        if self.max_interfaces == 0 {
            return Err(LayerError::InvalidConfig("max_interfaces must be non-zero".into()));
        }
        if !self.listen_ipv4 && !self.listen_ipv6 {
            return Err(LayerError::InvalidConfig("no IP version enabled".into()));
        }
        match self.listen_addr {
            Some(IpAddr::V4(_)) if !self.listen_ipv4 => {
                return Err(LayerError::InvalidConfig(
                    "listen address is IPv4 but IPv4 is disabled".into(),
                ))
            }
            Some(IpAddr::V6(_)) if !self.listen_ipv6 => {
                return Err(LayerError::InvalidConfig(
                    "listen address is IPv6 but IPv6 is disabled".into(),
                ))
            }
            _ => {}
        }
        if self.max_message_len < weave_wire::FIXED_HEADER_LEN {
            return Err(LayerError::InvalidConfig("max_message_len too small".into()));
        }
        if self.connection_rx_buffer < weave_wire::LENGTH_PREFIX_LEN + weave_wire::FIXED_HEADER_LEN {
            return Err(LayerError::InvalidConfig("connection_rx_buffer too small".into()));
        }
        Ok(())
    }

    /// Whether endpoints of this IP version should be bound
    pub fn version_enabled(&self, v6: bool) -> bool {
        let enabled = if v6 { self.listen_ipv6 } else { self.listen_ipv4 };
        match self.listen_addr {
            Some(addr) => enabled && addr.is_ipv6() == v6,
            None => enabled,
        }
    }
}
