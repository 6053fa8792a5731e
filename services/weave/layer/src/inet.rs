//! Contract between the message layer and the socket abstraction.
//!
//! All endpoints are non-blocking: receive and accept return `Ok(None)`
//! when nothing is pending instead of waiting.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// OS interface index
pub type InterfaceId = u32;

/// IP protocol version of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    /// Version of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Wildcard address of this version
    pub fn unspecified(self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// A network interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface index
    pub id: InterfaceId,
    /// Interface name
    pub name: String,
    /// Whether the interface supports multicast
    pub multicast: bool,
}

/// An address assigned to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// Owning interface
    pub interface: InterfaceId,
    /// Assigned address
    pub addr: IpAddr,
}

/// Addressing details of a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Sender address and port
    pub src: SocketAddr,
    /// Address the datagram was received on, if known
    pub dest_addr: Option<IpAddr>,
    /// Interface the datagram arrived on, if known
    pub interface: Option<InterfaceId>,
}

/// Datagram endpoint
pub trait UdpEndpoint {
    /// Bind to an address and port, optionally restricted to an interface
    fn bind(&mut self, addr: IpAddr, port: u16, interface: Option<InterfaceId>) -> io::Result<()>;

    /// Start receiving
    fn listen(&mut self) -> io::Result<()>;

    /// Send a datagram, over `interface` when the destination is multicast
    fn send_to(
        &mut self,
        data: &[u8],
        dest: SocketAddr,
        interface: Option<InterfaceId>,
    ) -> io::Result<usize>;

    /// Receive one pending datagram into `buf`
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, PacketInfo)>>;

    /// Bound address
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Release the socket
    fn close(&mut self);
}

/// Stream endpoint, either a listener or a connection
pub trait TcpEndpoint: Sized {
    /// Bind to an address and port
    fn bind(&mut self, addr: IpAddr, port: u16) -> io::Result<()>;

    /// Turn a bound endpoint into a listener
    fn listen(&mut self, backlog: u32) -> io::Result<()>;

    /// Take one pending inbound connection from a listener
    fn accept(&mut self) -> io::Result<Option<Self>>;

    /// Start connecting to a peer
    fn connect(&mut self, addr: SocketAddr, interface: Option<InterfaceId>) -> io::Result<()>;

    /// Whether an outbound connect has completed; an error means it failed
    fn is_connected(&self) -> io::Result<bool>;

    /// Write as much of `data` as the socket accepts without blocking
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read pending bytes; `Some(0)` means the peer closed the stream
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Remote address of a connection
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Bound local address
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Fail reads with `TimedOut` after this long without traffic
    fn set_idle_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Close after flushing, letting the peer see end of stream
    fn close(&mut self);

    /// Close immediately, resetting the connection
    fn abort(&mut self);
}

/// Factory for endpoints plus interface enumeration
pub trait InetLayer {
    /// Datagram endpoint type
    type Udp: UdpEndpoint;
    /// Stream endpoint type
    type Tcp: TcpEndpoint;

    /// Create an unbound datagram endpoint
    fn new_udp_endpoint(&mut self, version: IpVersion) -> io::Result<Self::Udp>;

    /// Create an unbound stream endpoint
    fn new_tcp_endpoint(&mut self, version: IpVersion) -> io::Result<Self::Tcp>;

    /// Live network interfaces
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    /// Addresses assigned to the live interfaces
    fn interface_addresses(&self) -> Vec<InterfaceAddress>;
}
