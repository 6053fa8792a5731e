//! Non-blocking OS sockets built with socket2.
//!
//! Interfaces and their addresses are supplied by the caller (usually from
//! configuration) since the standard library offers no portable way to
//! enumerate them.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::inet::{
    InetLayer, InterfaceAddress, InterfaceId, InterfaceInfo, IpVersion, PacketInfo, TcpEndpoint,
    UdpEndpoint,
};

#[cfg(any(target_os = "linux", target_os = "android"))]
const EINPROGRESS: i32 = 115;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EINPROGRESS: i32 = 36;

fn domain(version: IpVersion) -> Domain {
    match version {
        IpVersion::V4 => Domain::IPV4,
        IpVersion::V6 => Domain::IPV6,
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn connect_in_progress(err: &io::Error) -> bool {
    would_block(err) || err.raw_os_error() == Some(EINPROGRESS)
}

/// Socket factory over a static interface list
#[derive(Debug, Clone, Default)]
pub struct SystemInet {
    interfaces: Vec<InterfaceInfo>,
    addresses: Vec<InterfaceAddress>,
}

impl SystemInet {
    /// Create with the given interfaces and addresses
    pub fn new(interfaces: Vec<InterfaceInfo>, addresses: Vec<InterfaceAddress>) -> Self {
        Self {
            interfaces,
            addresses,
        }
    }

    /// Replace the interface list, picked up by the next endpoint refresh
    pub fn set_interfaces(&mut self, interfaces: Vec<InterfaceInfo>, addresses: Vec<InterfaceAddress>) {
        self.interfaces = interfaces;
        self.addresses = addresses;
    }
}

impl InetLayer for SystemInet {
    type Udp = SystemUdp;
    type Tcp = SystemTcp;

    fn new_udp_endpoint(&mut self, version: IpVersion) -> io::Result<SystemUdp> {
        Ok(SystemUdp {
            version,
            socket: None,
            interface: None,
        })
    }

    fn new_tcp_endpoint(&mut self, version: IpVersion) -> io::Result<SystemTcp> {
        Ok(SystemTcp {
            version,
            state: TcpState::Unbound,
            idle_timeout: None,
            last_activity: Instant::now(),
        })
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.clone()
    }

    fn interface_addresses(&self) -> Vec<InterfaceAddress> {
        self.addresses.clone()
    }
}

/// Non-blocking UDP socket
#[derive(Debug)]
pub struct SystemUdp {
    version: IpVersion,
    socket: Option<UdpSocket>,
    interface: Option<InterfaceId>,
}

impl SystemUdp {
    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl UdpEndpoint for SystemUdp {
    fn bind(&mut self, addr: IpAddr, port: u16, interface: Option<InterfaceId>) -> io::Result<()> {
        let socket = Socket::new(domain(self.version), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if self.version == IpVersion::V6 {
            socket.set_only_v6(true)?;
            if let Some(index) = interface {
                socket.set_multicast_if_v6(index)?;
            }
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(addr, port).into())?;

        debug!(addr = %addr, port, interface = ?interface, "udp socket bound");
        self.socket = Some(socket.into());
        self.interface = interface;
        Ok(())
    }

    fn listen(&mut self) -> io::Result<()> {
        self.socket().map(|_| ())
    }

    fn send_to(
        &mut self,
        data: &[u8],
        dest: SocketAddr,
        interface: Option<InterfaceId>,
    ) -> io::Result<usize> {
        let socket = self.socket()?;
        if let (SocketAddr::V6(v6), Some(index)) = (dest, interface) {
            if v6.ip().is_multicast() {
                SockRef::from(socket).set_multicast_if_v6(index)?;
            }
        }
        socket.send_to(data, dest)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, PacketInfo)>> {
        let socket = self.socket()?;
        match socket.recv_from(buf) {
            Ok((n, src)) => Ok(Some((
                n,
                PacketInfo {
                    src,
                    dest_addr: socket.local_addr().ok().map(|a| a.ip()),
                    interface: self.interface,
                },
            ))),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn close(&mut self) {
        self.socket = None;
    }
}

#[derive(Debug)]
enum TcpState {
    Unbound,
    Bound(Socket),
    Listening(TcpListener),
    Connected(TcpStream),
    Closed,
}

/// Non-blocking TCP listener or connection
#[derive(Debug)]
pub struct SystemTcp {
    version: IpVersion,
    state: TcpState,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
}

impl SystemTcp {
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.state {
            TcpState::Connected(stream) => Ok(stream),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn from_stream(version: IpVersion, stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            version,
            state: TcpState::Connected(stream),
            idle_timeout: None,
            last_activity: Instant::now(),
        })
    }

    fn idle_expired(&self) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| self.last_activity.elapsed() >= timeout)
    }
}

impl TcpEndpoint for SystemTcp {
    fn bind(&mut self, addr: IpAddr, port: u16) -> io::Result<()> {
        let socket = Socket::new(domain(self.version), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if self.version == IpVersion::V6 {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(addr, port).into())?;
        self.state = TcpState::Bound(socket);
        Ok(())
    }

    fn listen(&mut self, backlog: u32) -> io::Result<()> {
        match std::mem::replace(&mut self.state, TcpState::Closed) {
            TcpState::Bound(socket) => {
                socket.listen(backlog.min(i32::MAX as u32) as i32)?;
                self.state = TcpState::Listening(socket.into());
                Ok(())
            }
            other => {
                self.state = other;
                Err(io::ErrorKind::InvalidInput.into())
            }
        }
    }

    fn accept(&mut self) -> io::Result<Option<SystemTcp>> {
        let TcpState::Listening(listener) = &self.state else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        match listener.accept() {
            Ok((stream, _)) => SystemTcp::from_stream(self.version, stream).map(Some),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn connect(&mut self, addr: SocketAddr, _interface: Option<InterfaceId>) -> io::Result<()> {
        let socket = match std::mem::replace(&mut self.state, TcpState::Closed) {
            TcpState::Bound(socket) => socket,
            TcpState::Unbound => Socket::new(domain(self.version), Type::STREAM, Some(Protocol::TCP))?,
            other => {
                self.state = other;
                return Err(io::ErrorKind::InvalidInput.into());
            }
        };
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => debug!(%addr, "connect in progress"),
            Err(e) => return Err(e),
        }
        *self = SystemTcp::from_stream(self.version, socket.into())?;
        Ok(())
    }

    fn is_connected(&self) -> io::Result<bool> {
        let TcpState::Connected(stream) = &self.state else {
            return Ok(false);
        };
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        match stream.write(data) {
            Ok(n) => {
                self.last_activity = Instant::now();
                Ok(n)
            }
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let result = self.stream()?.read(buf);
        match result {
            Ok(n) => {
                self.last_activity = Instant::now();
                Ok(Some(n))
            }
            Err(e) if would_block(&e) => {
                if self.idle_expired() {
                    Err(io::ErrorKind::TimedOut.into())
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            TcpState::Connected(stream) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            TcpState::Connected(stream) => stream.local_addr().ok(),
            TcpState::Listening(listener) => listener.local_addr().ok(),
            TcpState::Bound(socket) => socket.local_addr().ok().and_then(|a| a.as_socket()),
            _ => None,
        }
    }

    fn set_idle_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.idle_timeout = Some(timeout);
        self.last_activity = Instant::now();
        Ok(())
    }

    fn close(&mut self) {
        if let TcpState::Connected(stream) = &self.state {
            let _ = stream.shutdown(Shutdown::Write);
        }
        self.state = TcpState::Closed;
    }

    fn abort(&mut self) {
        if let TcpState::Connected(stream) = &self.state {
            let _ = SockRef::from(stream).set_linger(Some(Duration::ZERO));
        }
        self.state = TcpState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_connected(endpoint: &SystemTcp) -> io::Result<bool> {
        for _ in 0..200 {
            if endpoint.is_connected()? {
                return Ok(true);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(false)
    }

    #[test]
    fn test_connect_does_not_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut inet = SystemInet::default();
        let mut client = inet.new_tcp_endpoint(IpVersion::V4).unwrap();
        client.connect(addr, None).unwrap();
        assert!(matches!(client.state, TcpState::Connected(_)));
        assert!(wait_connected(&client).unwrap());

        let (mut server, _) = listener.accept().unwrap();
        assert_eq!(client.send(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(client.peer_addr(), Some(addr));
    }

    #[test]
    fn test_refused_connect_reports_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut inet = SystemInet::default();
        let mut client = inet.new_tcp_endpoint(IpVersion::V4).unwrap();
        if client.connect(addr, None).is_ok() {
            assert!(wait_connected(&client).is_err());
        }
    }

    #[test]
    fn test_unconnected_endpoint() {
        let mut inet = SystemInet::default();
        let client = inet.new_tcp_endpoint(IpVersion::V4).unwrap();
        assert!(!client.is_connected().unwrap());
    }
}
