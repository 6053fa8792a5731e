//! In-memory network for tests and simulations.
//!
//! Every endpoint created through a [`LoopbackInet`] lives in one shared
//! [`Network`] state. Datagrams are delivered to bound, listening endpoints
//! and also recorded in a send log; stream connections are pairs of byte
//! queues. Bind and send failures can be injected per address or interface,
//! and outbound connects can be held pending or made to fail.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use crate::inet::{
    InetLayer, InterfaceAddress, InterfaceId, InterfaceInfo, IpVersion, PacketInfo, TcpEndpoint,
    UdpEndpoint,
};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// A datagram recorded by the send log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Local address of the sending endpoint
    pub from: Option<SocketAddr>,
    /// Destination
    pub to: SocketAddr,
    /// Interface requested by the sender
    pub interface: Option<InterfaceId>,
    /// Datagram contents
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct UdpSocketState {
    local: Option<SocketAddr>,
    interface: Option<InterfaceId>,
    listening: bool,
    open: bool,
    inbox: VecDeque<(Vec<u8>, PacketInfo)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpPhase {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug)]
struct TcpSocketState {
    phase: TcpPhase,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    remote: Option<usize>,
    inbox: VecDeque<u8>,
    peer_closed: bool,
    backlog: VecDeque<usize>,
    idle_timeout: Option<Duration>,
    connect_error: Option<io::ErrorKind>,
}

impl TcpSocketState {
    fn new() -> Self {
        Self {
            phase: TcpPhase::Unbound,
            local: None,
            peer: None,
            remote: None,
            inbox: VecDeque::new(),
            peer_closed: false,
            backlog: VecDeque::new(),
            idle_timeout: None,
            connect_error: None,
        }
    }
}

/// Shared state of a loopback network
#[derive(Debug)]
pub struct Network {
    interfaces: Vec<InterfaceInfo>,
    addresses: Vec<InterfaceAddress>,
    bind_failures: HashMap<IpAddr, io::ErrorKind>,
    send_failures: HashMap<InterfaceId, io::ErrorKind>,
    connect_failures: HashMap<SocketAddr, io::ErrorKind>,
    hold_connects: bool,
    udp: Vec<UdpSocketState>,
    tcp: Vec<TcpSocketState>,
    sent: Vec<SentDatagram>,
    bind_calls: usize,
    next_ephemeral: u16,
}

impl Default for Network {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            addresses: Vec::new(),
            bind_failures: HashMap::new(),
            send_failures: HashMap::new(),
            connect_failures: HashMap::new(),
            hold_connects: false,
            udp: Vec::new(),
            tcp: Vec::new(),
            sent: Vec::new(),
            bind_calls: 0,
            next_ephemeral: FIRST_EPHEMERAL_PORT,
        }
    }
}

impl Network {
    fn check_bind(&mut self, addr: IpAddr) -> io::Result<()> {
        self.bind_calls += 1;
        match self.bind_failures.get(&addr) {
            Some(kind) => Err(io::Error::from(*kind)),
            None => Ok(()),
        }
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = self.next_ephemeral.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        port
    }

    fn deliver_datagram(
        &mut self,
        sender: Option<usize>,
        from: SocketAddr,
        to: SocketAddr,
        interface: Option<InterfaceId>,
        data: &[u8],
    ) -> usize {
        let mut delivered = 0;
        for (index, socket) in self.udp.iter_mut().enumerate() {
            if Some(index) == sender || !socket.open || !socket.listening {
                continue;
            }
            let Some(local) = socket.local else { continue };
            if local.port() != to.port() || local.is_ipv4() != to.is_ipv4() {
                continue;
            }
            let matches = local.ip() == to.ip() || local.ip().is_unspecified() || to.ip().is_multicast();
            let on_interface = match (socket.interface, interface) {
                (Some(bound), Some(arrived)) => bound == arrived,
                _ => true,
            };
            if matches && on_interface {
                socket.inbox.push_back((
                    data.to_vec(),
                    PacketInfo {
                        src: from,
                        dest_addr: Some(to.ip()),
                        interface,
                    },
                ));
                delivered += 1;
            }
        }
        delivered
    }

    fn find_listener(&self, addr: SocketAddr) -> Option<usize> {
        self.tcp.iter().position(|socket| {
            socket.phase == TcpPhase::Listening
                && socket.local.is_some_and(|local| {
                    local.port() == addr.port()
                        && local.is_ipv4() == addr.is_ipv4()
                        && (local.ip() == addr.ip() || local.ip().is_unspecified())
                })
        })
    }

    fn close_tcp(&mut self, index: usize) {
        let remote = {
            let socket = &mut self.tcp[index];
            if socket.phase == TcpPhase::Closed {
                return;
            }
            socket.phase = TcpPhase::Closed;
            socket.inbox.clear();
            socket.remote
        };
        if let Some(remote) = remote {
            self.tcp[remote].peer_closed = true;
        }
    }
}

/// Handle on a shared loopback network
#[derive(Debug, Clone, Default)]
pub struct LoopbackInet {
    net: Rc<RefCell<Network>>,
}

impl LoopbackInet {
    /// Empty network without interfaces
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface
    pub fn add_interface(&self, id: InterfaceId, name: &str, multicast: bool) {
        self.net.borrow_mut().interfaces.push(InterfaceInfo {
            id,
            name: name.to_string(),
            multicast,
        });
    }

    /// Remove an interface and its addresses
    pub fn remove_interface(&self, id: InterfaceId) {
        let mut net = self.net.borrow_mut();
        net.interfaces.retain(|intf| intf.id != id);
        net.addresses.retain(|addr| addr.interface != id);
    }

    /// Assign an address to an interface
    pub fn add_address(&self, interface: InterfaceId, addr: IpAddr) {
        self.net
            .borrow_mut()
            .addresses
            .push(InterfaceAddress { interface, addr });
    }

    /// Remove an address from every interface
    pub fn remove_address(&self, addr: IpAddr) {
        self.net.borrow_mut().addresses.retain(|a| a.addr != addr);
    }

    /// Make binds to `addr` fail with `kind`
    pub fn fail_bind(&self, addr: IpAddr, kind: io::ErrorKind) {
        self.net.borrow_mut().bind_failures.insert(addr, kind);
    }

    /// Make sends over `interface` fail with `kind`
    pub fn fail_send_on_interface(&self, interface: InterfaceId, kind: io::ErrorKind) {
        self.net.borrow_mut().send_failures.insert(interface, kind);
    }

    /// Make connects to `addr` start, then fail with `kind`
    pub fn fail_connect(&self, addr: SocketAddr, kind: io::ErrorKind) {
        self.net.borrow_mut().connect_failures.insert(addr, kind);
    }

    /// Leave new outbound connects pending until [`release_connects`](Self::release_connects)
    pub fn hold_connects(&self) {
        self.net.borrow_mut().hold_connects = true;
    }

    /// Complete every pending connect and stop holding new ones
    pub fn release_connects(&self) {
        let mut net = self.net.borrow_mut();
        net.hold_connects = false;
        for socket in net.tcp.iter_mut() {
            if socket.phase == TcpPhase::Connecting && socket.connect_error.is_none() {
                socket.phase = TcpPhase::Connected;
            }
        }
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut net = self.net.borrow_mut();
        net.bind_failures.clear();
        net.send_failures.clear();
        net.connect_failures.clear();
    }

    /// Datagrams sent so far
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.net.borrow().sent.clone()
    }

    /// Drain the send log
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.net.borrow_mut().sent)
    }

    /// Deliver a datagram as if it arrived from `from`, returning the number of receivers
    pub fn inject_datagram(
        &self,
        from: SocketAddr,
        to: SocketAddr,
        interface: Option<InterfaceId>,
        data: &[u8],
    ) -> usize {
        self.net
            .borrow_mut()
            .deliver_datagram(None, from, to, interface, data)
    }

    /// Local addresses and interfaces of the open, bound datagram endpoints
    pub fn udp_bindings(&self) -> Vec<(SocketAddr, Option<InterfaceId>)> {
        self.net
            .borrow()
            .udp
            .iter()
            .filter(|s| s.open)
            .filter_map(|s| s.local.map(|local| (local, s.interface)))
            .collect()
    }

    /// Local addresses of the listening stream endpoints
    pub fn tcp_listeners(&self) -> Vec<SocketAddr> {
        self.net
            .borrow()
            .tcp
            .iter()
            .filter(|s| s.phase == TcpPhase::Listening)
            .filter_map(|s| s.local)
            .collect()
    }

    /// Number of bind attempts made, successful or not
    pub fn bind_calls(&self) -> usize {
        self.net.borrow().bind_calls
    }

    /// Number of connected stream endpoints
    pub fn open_streams(&self) -> usize {
        self.net
            .borrow()
            .tcp
            .iter()
            .filter(|s| s.phase == TcpPhase::Connected)
            .count()
    }
}

impl InetLayer for LoopbackInet {
    type Udp = LoopbackUdp;
    type Tcp = LoopbackTcp;

    fn new_udp_endpoint(&mut self, _version: IpVersion) -> io::Result<LoopbackUdp> {
        let mut net = self.net.borrow_mut();
        net.udp.push(UdpSocketState {
            open: true,
            ..UdpSocketState::default()
        });
        Ok(LoopbackUdp {
            index: net.udp.len() - 1,
            net: Rc::clone(&self.net),
        })
    }

    fn new_tcp_endpoint(&mut self, _version: IpVersion) -> io::Result<LoopbackTcp> {
        let mut net = self.net.borrow_mut();
        net.tcp.push(TcpSocketState::new());
        Ok(LoopbackTcp {
            index: net.tcp.len() - 1,
            net: Rc::clone(&self.net),
        })
    }

    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.net.borrow().interfaces.clone()
    }

    fn interface_addresses(&self) -> Vec<InterfaceAddress> {
        self.net.borrow().addresses.clone()
    }
}

/// Datagram endpoint on a loopback network
#[derive(Debug)]
pub struct LoopbackUdp {
    index: usize,
    net: Rc<RefCell<Network>>,
}

impl UdpEndpoint for LoopbackUdp {
    fn bind(&mut self, addr: IpAddr, port: u16, interface: Option<InterfaceId>) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        net.check_bind(addr)?;
        let socket = &mut net.udp[self.index];
        if !socket.open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        socket.local = Some(SocketAddr::new(addr, port));
        socket.interface = interface;
        Ok(())
    }

    fn listen(&mut self) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        let socket = &mut net.udp[self.index];
        if socket.local.is_none() {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        socket.listening = true;
        Ok(())
    }

    fn send_to(
        &mut self,
        data: &[u8],
        dest: SocketAddr,
        interface: Option<InterfaceId>,
    ) -> io::Result<usize> {
        let mut net = self.net.borrow_mut();
        let from = match (net.udp[self.index].open, net.udp[self.index].local) {
            (true, Some(local)) => local,
            _ => return Err(io::ErrorKind::NotConnected.into()),
        };
        if let Some(kind) = interface.and_then(|intf| net.send_failures.get(&intf)) {
            return Err(io::Error::from(*kind));
        }
        net.sent.push(SentDatagram {
            from: Some(from),
            to: dest,
            interface,
            data: data.to_vec(),
        });
        net.deliver_datagram(Some(self.index), from, dest, interface, data);
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, PacketInfo)>> {
        let mut net = self.net.borrow_mut();
        let Some((data, info)) = net.udp[self.index].inbox.pop_front() else {
            return Ok(None);
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(Some((n, info)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.net.borrow().udp[self.index].local
    }

    fn close(&mut self) {
        let mut net = self.net.borrow_mut();
        let socket = &mut net.udp[self.index];
        socket.open = false;
        socket.listening = false;
        socket.inbox.clear();
    }
}

/// Stream endpoint on a loopback network
#[derive(Debug)]
pub struct LoopbackTcp {
    index: usize,
    net: Rc<RefCell<Network>>,
}

impl LoopbackTcp {
    /// Whether the other end of this connection has closed
    pub fn is_peer_closed(&self) -> bool {
        self.net.borrow().tcp[self.index].peer_closed
    }

    /// Whether this endpoint was closed
    pub fn is_closed(&self) -> bool {
        self.net.borrow().tcp[self.index].phase == TcpPhase::Closed
    }

    /// Idle timeout applied to the other end of this connection
    pub fn peer_idle_timeout(&self) -> Option<Duration> {
        let net = self.net.borrow();
        net.tcp[self.index]
            .remote
            .and_then(|remote| net.tcp[remote].idle_timeout)
    }
}

impl TcpEndpoint for LoopbackTcp {
    fn bind(&mut self, addr: IpAddr, port: u16) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        net.check_bind(addr)?;
        let socket = &mut net.tcp[self.index];
        if socket.phase != TcpPhase::Unbound {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        socket.local = Some(SocketAddr::new(addr, port));
        socket.phase = TcpPhase::Bound;
        Ok(())
    }

    fn listen(&mut self, _backlog: u32) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        let socket = &mut net.tcp[self.index];
        if socket.phase != TcpPhase::Bound {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        socket.phase = TcpPhase::Listening;
        Ok(())
    }

    fn accept(&mut self) -> io::Result<Option<LoopbackTcp>> {
        let mut net = self.net.borrow_mut();
        let socket = &mut net.tcp[self.index];
        if socket.phase != TcpPhase::Listening {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(socket.backlog.pop_front().map(|index| LoopbackTcp {
            index,
            net: Rc::clone(&self.net),
        }))
    }

    fn connect(&mut self, addr: SocketAddr, _interface: Option<InterfaceId>) -> io::Result<()> {
        let mut net = self.net.borrow_mut();
        if !matches!(net.tcp[self.index].phase, TcpPhase::Unbound | TcpPhase::Bound) {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        if let Some(kind) = net.connect_failures.get(&addr).copied() {
            let client = &mut net.tcp[self.index];
            client.phase = TcpPhase::Connecting;
            client.peer = Some(addr);
            client.connect_error = Some(kind);
            return Ok(());
        }
        let listener = net
            .find_listener(addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        let local = match net.tcp[self.index].local {
            Some(local) => local,
            None => {
                let port = net.ephemeral_port();
                SocketAddr::new(IpVersion::of(&addr.ip()).unspecified(), port)
            }
        };

        let server = net.tcp.len();
        let mut accepted = TcpSocketState::new();
        accepted.phase = TcpPhase::Connected;
        accepted.local = Some(addr);
        accepted.peer = Some(local);
        accepted.remote = Some(self.index);
        net.tcp.push(accepted);

        let phase = if net.hold_connects {
            TcpPhase::Connecting
        } else {
            TcpPhase::Connected
        };
        let client = &mut net.tcp[self.index];
        client.phase = phase;
        client.local = Some(local);
        client.peer = Some(addr);
        client.remote = Some(server);

        net.tcp[listener].backlog.push_back(server);
        Ok(())
    }

    fn is_connected(&self) -> io::Result<bool> {
        let net = self.net.borrow();
        let socket = &net.tcp[self.index];
        match (socket.phase, socket.connect_error) {
            (TcpPhase::Connecting, Some(kind)) => Err(kind.into()),
            (phase, _) => Ok(phase == TcpPhase::Connected),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut net = self.net.borrow_mut();
        let socket = &net.tcp[self.index];
        if socket.phase != TcpPhase::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if socket.peer_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let Some(remote) = socket.remote else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        net.tcp[remote].inbox.extend(data.iter().copied());
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut net = self.net.borrow_mut();
        let socket = &mut net.tcp[self.index];
        if socket.phase != TcpPhase::Connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if socket.inbox.is_empty() {
            return Ok(socket.peer_closed.then_some(0));
        }
        let n = socket.inbox.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(socket.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(Some(n))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.net.borrow().tcp[self.index].peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.net.borrow().tcp[self.index].local
    }

    fn set_idle_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.net.borrow_mut().tcp[self.index].idle_timeout = Some(timeout);
        Ok(())
    }

    fn close(&mut self) {
        self.net.borrow_mut().close_tcp(self.index);
    }

    fn abort(&mut self) {
        self.net.borrow_mut().close_tcp(self.index);
    }
}
