//! Bound UDP and TCP endpoints and their refresh.
//!
//! The set holds one general-purpose UDP endpoint and one TCP listener per
//! IP version, plus one UDP endpoint per local fabric ULA so that datagrams
//! to fabric peers leave from the matching source address. A refresh only
//! rebinds endpoints whose address or interface changed.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, error, info, warn};
use weave_wire::address::{global_id, is_fabric_address, subnet};
use weave_wire::PacketBuffer;

use crate::config::LayerConfig;
use crate::error::{is_benign_multicast_error, LayerError};
use crate::inet::{InetLayer, InterfaceId, InterfaceInfo, IpVersion, PacketInfo, TcpEndpoint, UdpEndpoint};

/// Binding progress of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Bound but not yet receiving
    Bound,
    /// Receiving datagrams or accepting connections
    Listening,
}

/// An endpoint with the criteria it was bound with
#[derive(Debug)]
pub struct BoundEndpoint<E> {
    endpoint: E,
    addr: IpAddr,
    interface: Option<InterfaceId>,
    state: EndpointState,
}

impl<E> BoundEndpoint<E> {
    /// Address the endpoint was bound to
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Interface the endpoint was restricted to
    pub fn interface(&self) -> Option<InterfaceId> {
        self.interface
    }

    /// Binding progress
    pub fn state(&self) -> EndpointState {
        self.state
    }

    fn matches(&self, addr: IpAddr, interface: Option<InterfaceId>) -> bool {
        self.addr == addr && self.interface == interface
    }
}

/// A datagram read from one of the UDP endpoints
#[derive(Debug)]
pub struct Datagram {
    /// Received bytes
    pub data: PacketBuffer,
    /// Addressing details
    pub info: PacketInfo,
}

/// Endpoints owned by the message layer
#[derive(Debug)]
pub struct EndpointSet<I: InetLayer> {
    udp_v4: Option<BoundEndpoint<I::Udp>>,
    udp_v6: Option<BoundEndpoint<I::Udp>>,
    tcp_v4: Option<BoundEndpoint<I::Tcp>>,
    tcp_v6: Option<BoundEndpoint<I::Tcp>>,
    ula_udp: Vec<BoundEndpoint<I::Udp>>,
    interfaces: Vec<InterfaceInfo>,
    targeted: bool,
}

impl<I: InetLayer> Default for EndpointSet<I> {
    fn default() -> Self {
        Self {
            udp_v4: None,
            udp_v6: None,
            tcp_v4: None,
            tcp_v6: None,
            ula_udp: Vec::new(),
            interfaces: Vec::new(),
            targeted: false,
        }
    }
}

impl<I: InetLayer> EndpointSet<I> {
    /// Set with nothing bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the bound endpoints in line with the configuration and the live interfaces.
    ///
    /// Failures on the general-purpose endpoints abort the refresh; failures
    /// on per-address endpoints skip that address.
    pub fn refresh(&mut self, inet: &mut I, config: &LayerConfig) -> Result<(), LayerError> {
        self.refresh_interfaces(inet, config);
        self.targeted = config.listen_addr.is_some();

        for version in [IpVersion::V4, IpVersion::V6] {
            let enabled = config.version_enabled(version == IpVersion::V6);
            let addr = config.listen_addr.unwrap_or_else(|| version.unspecified());

            let udp_slot = match version {
                IpVersion::V4 => &mut self.udp_v4,
                IpVersion::V6 => &mut self.udp_v6,
            };
            if enabled && config.listen_udp {
                if !udp_slot
                    .as_ref()
                    .is_some_and(|ep| ep.matches(addr, config.listen_interface))
                {
                    close_udp(udp_slot.take());
                    let bound = bind_udp(inet, version, addr, config.port, config.listen_interface)
                        .map_err(|e| {
                            error!(addr = %addr, port = config.port, error = %e, "failed to bind UDP endpoint");
                            e
                        })?;
                    *udp_slot = Some(bound);
                }
            } else {
                close_udp(udp_slot.take());
            }

            let tcp_slot = match version {
                IpVersion::V4 => &mut self.tcp_v4,
                IpVersion::V6 => &mut self.tcp_v6,
            };
            if enabled && config.listen_tcp {
                if !tcp_slot.as_ref().is_some_and(|ep| ep.matches(addr, None)) {
                    close_tcp(tcp_slot.take());
                    let bound = bind_tcp(inet, version, addr, config.port, config.tcp_backlog)
                        .map_err(|e| {
                            error!(addr = %addr, port = config.port, error = %e, "failed to bind TCP listener");
                            e
                        })?;
                    *tcp_slot = Some(bound);
                }
            } else {
                close_tcp(tcp_slot.take());
            }
        }

        self.refresh_ula_endpoints(inet, config);
        debug!(
            interfaces = self.interfaces.len(),
            ula_endpoints = self.ula_udp.len(),
            "endpoints refreshed"
        );
        Ok(())
    }

    fn refresh_interfaces(&mut self, inet: &I, config: &LayerConfig) {
        let mut interfaces = inet.interfaces();
        if let Some(only) = config.listen_interface {
            interfaces.retain(|intf| intf.id == only);
        }
        if interfaces.len() > config.max_interfaces {
            warn!(
                found = interfaces.len(),
                max = config.max_interfaces,
                "interface table full, ignoring extra interfaces"
            );
            interfaces.truncate(config.max_interfaces);
        }
        self.interfaces = interfaces;
    }

    fn refresh_ula_endpoints(&mut self, inet: &mut I, config: &LayerConfig) {
        let wanted: Vec<(IpAddr, InterfaceId)> = if config.listen_udp
            && config.version_enabled(true)
            && config.listen_addr.is_none()
            && config.fabric_id != 0
        {
            inet.interface_addresses()
                .into_iter()
                .filter(|a| is_fabric_address(&a.addr, config.fabric_id))
                .filter(|a| {
                    self.interfaces
                        .iter()
                        .any(|intf| intf.id == a.interface && intf.multicast)
                })
                .map(|a| (a.addr, a.interface))
                .collect()
        } else {
            Vec::new()
        };

        self.ula_udp.retain_mut(|ep| {
            let keep = wanted
                .iter()
                .any(|(addr, intf)| ep.matches(*addr, Some(*intf)));
            if !keep {
                info!(addr = %ep.addr, "closing per-address UDP endpoint");
                ep.endpoint.close();
            }
            keep
        });

        for (addr, intf) in wanted {
            if self.ula_udp.iter().any(|ep| ep.matches(addr, Some(intf))) {
                continue;
            }
            if self.ula_udp.len() >= config.max_local_addr_udp_endpoints {
                warn!(
                    addr = %addr,
                    max = config.max_local_addr_udp_endpoints,
                    "per-address UDP endpoint table full"
                );
                break;
            }
            match bind_udp(inet, IpVersion::V6, addr, config.port, Some(intf)) {
                Ok(bound) => {
                    info!(addr = %addr, interface = intf, "per-address UDP endpoint bound");
                    self.ula_udp.push(bound);
                }
                Err(e) => {
                    warn!(addr = %addr, interface = intf, error = %e, "skipping per-address UDP endpoint");
                }
            }
        }
    }

    /// Send a unicast datagram, or an IPv4 datagram of any kind
    pub fn send_unicast(
        &mut self,
        data: &[u8],
        dest: SocketAddr,
        interface: Option<InterfaceId>,
    ) -> Result<(), LayerError> {
        let endpoint = self
            .unicast_endpoint(dest.ip(), interface)
            .ok_or(LayerError::NoEndpoint)?;
        endpoint.send_to(data, dest, interface)?;
        Ok(())
    }

    fn unicast_endpoint(&mut self, dest: IpAddr, interface: Option<InterfaceId>) -> Option<&mut I::Udp> {
        if let IpAddr::V6(dest_v6) = dest {
            let same_subnet = self.ula_udp.iter().position(|ep| match ep.addr {
                IpAddr::V6(local) => {
                    global_id(&local) == global_id(&dest_v6)
                        && subnet(&local) == subnet(&dest_v6)
                        && interface.map_or(true, |intf| ep.interface == Some(intf))
                }
                IpAddr::V4(_) => false,
            });
            if let Some(index) = same_subnet {
                return Some(&mut self.ula_udp[index].endpoint);
            }
        }
        self.general_udp_mut(IpVersion::of(&dest))
    }

    /// Send an IPv6 multicast datagram on every multicast interface, or on `interface` alone.
    ///
    /// The general endpoint carries the copies when link-local sourcing is
    /// requested, a specific listen address is configured, or no per-address
    /// endpoints exist; otherwise every per-address endpoint on the
    /// interface sends a copy. Unreachable interfaces are skipped. Returns
    /// the number of copies sent.
    pub fn send_multicast(
        &mut self,
        data: &[u8],
        dest: SocketAddr,
        interface: Option<InterfaceId>,
        from_link_local: bool,
    ) -> Result<usize, LayerError> {
        let interfaces: Vec<InterfaceId> = match interface {
            Some(intf) => vec![intf],
            None => self
                .interfaces
                .iter()
                .filter(|intf| intf.multicast)
                .map(|intf| intf.id)
                .collect(),
        };
        let use_general = from_link_local || self.targeted || self.ula_udp.is_empty();

        let mut sent = 0;
        for intf in interfaces {
            if use_general {
                let endpoint = self
                    .general_udp_mut(IpVersion::V6)
                    .ok_or(LayerError::NoEndpoint)?;
                sent += send_tolerant(endpoint, data, dest, intf)?;
            } else {
                for ep in self.ula_udp.iter_mut().filter(|ep| ep.interface == Some(intf)) {
                    sent += send_tolerant(&mut ep.endpoint, data, dest, intf)?;
                }
            }
        }
        Ok(sent)
    }

    /// Read up to `max` pending datagrams from all UDP endpoints
    pub fn recv_datagrams(&mut self, scratch: &mut [u8], max: usize) -> Vec<io::Result<Datagram>> {
        let mut out = Vec::new();
        for endpoint in self.udp_endpoints_mut() {
            while out.len() < max {
                match endpoint.recv(scratch) {
                    Ok(Some((n, info))) => out.push(Ok(Datagram {
                        data: PacketBuffer::from_received(&scratch[..n]),
                        info,
                    })),
                    Ok(None) => break,
                    Err(e) => {
                        out.push(Err(e));
                        break;
                    }
                }
            }
        }
        out
    }

    /// Accept pending connections on the TCP listeners
    pub fn accept_connections(&mut self) -> Vec<io::Result<I::Tcp>> {
        let mut out = Vec::new();
        for listener in [self.tcp_v4.as_mut(), self.tcp_v6.as_mut()].into_iter().flatten() {
            loop {
                match listener.endpoint.accept() {
                    Ok(Some(endpoint)) => out.push(Ok(endpoint)),
                    Ok(None) => break,
                    Err(e) => {
                        out.push(Err(e));
                        break;
                    }
                }
            }
        }
        out
    }

    fn udp_endpoints_mut(&mut self) -> impl Iterator<Item = &mut I::Udp> {
        self.udp_v4
            .iter_mut()
            .chain(self.udp_v6.iter_mut())
            .chain(self.ula_udp.iter_mut())
            .map(|ep| &mut ep.endpoint)
    }

    fn general_udp_mut(&mut self, version: IpVersion) -> Option<&mut I::Udp> {
        match version {
            IpVersion::V4 => self.udp_v4.as_mut().map(|ep| &mut ep.endpoint),
            IpVersion::V6 => self.udp_v6.as_mut().map(|ep| &mut ep.endpoint),
        }
    }

    /// General-purpose UDP endpoint of a version
    pub fn general_udp(&self, version: IpVersion) -> Option<&BoundEndpoint<I::Udp>> {
        match version {
            IpVersion::V4 => self.udp_v4.as_ref(),
            IpVersion::V6 => self.udp_v6.as_ref(),
        }
    }

    /// TCP listener of a version
    pub fn tcp_listener(&self, version: IpVersion) -> Option<&BoundEndpoint<I::Tcp>> {
        match version {
            IpVersion::V4 => self.tcp_v4.as_ref(),
            IpVersion::V6 => self.tcp_v6.as_ref(),
        }
    }

    /// Addresses of the per-address UDP endpoints
    pub fn ula_addrs(&self) -> Vec<IpAddr> {
        self.ula_udp.iter().map(|ep| ep.addr).collect()
    }

    /// Interfaces known since the last refresh
    pub fn interfaces(&self) -> &[InterfaceInfo] {
        &self.interfaces
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.udp_v4.is_none()
            && self.udp_v6.is_none()
            && self.tcp_v4.is_none()
            && self.tcp_v6.is_none()
            && self.ula_udp.is_empty()
    }

    /// Close every endpoint
    pub fn close_all(&mut self) {
        close_udp(self.udp_v4.take());
        close_udp(self.udp_v6.take());
        close_tcp(self.tcp_v4.take());
        close_tcp(self.tcp_v6.take());
        for mut ep in self.ula_udp.drain(..) {
            ep.endpoint.close();
        }
        self.interfaces.clear();
        info!("all endpoints closed");
    }
}

fn bind_udp<I: InetLayer>(
    inet: &mut I,
    version: IpVersion,
    addr: IpAddr,
    port: u16,
    interface: Option<InterfaceId>,
) -> io::Result<BoundEndpoint<I::Udp>> {
    let mut endpoint = inet.new_udp_endpoint(version)?;
    if let Err(e) = endpoint.bind(addr, port, interface) {
        endpoint.close();
        return Err(e);
    }
    let mut bound = BoundEndpoint {
        endpoint,
        addr,
        interface,
        state: EndpointState::Bound,
    };
    if let Err(e) = bound.endpoint.listen() {
        bound.endpoint.close();
        return Err(e);
    }
    bound.state = EndpointState::Listening;
    info!(addr = %addr, port, interface = ?interface, "UDP endpoint listening");
    Ok(bound)
}

fn bind_tcp<I: InetLayer>(
    inet: &mut I,
    version: IpVersion,
    addr: IpAddr,
    port: u16,
    backlog: u32,
) -> io::Result<BoundEndpoint<I::Tcp>> {
    let mut endpoint = inet.new_tcp_endpoint(version)?;
    if let Err(e) = endpoint.bind(addr, port) {
        endpoint.abort();
        return Err(e);
    }
    let mut bound = BoundEndpoint {
        endpoint,
        addr,
        interface: None,
        state: EndpointState::Bound,
    };
    if let Err(e) = bound.endpoint.listen(backlog) {
        bound.endpoint.abort();
        return Err(e);
    }
    bound.state = EndpointState::Listening;
    info!(addr = %addr, port, "TCP listener ready");
    Ok(bound)
}

fn close_udp<E: UdpEndpoint>(endpoint: Option<BoundEndpoint<E>>) {
    if let Some(mut ep) = endpoint {
        debug!(addr = %ep.addr, "closing UDP endpoint");
        ep.endpoint.close();
    }
}

fn close_tcp<E: TcpEndpoint>(endpoint: Option<BoundEndpoint<E>>) {
    if let Some(mut ep) = endpoint {
        debug!(addr = %ep.addr, "closing TCP listener");
        ep.endpoint.abort();
    }
}

fn send_tolerant<E: UdpEndpoint>(
    endpoint: &mut E,
    data: &[u8],
    dest: SocketAddr,
    interface: InterfaceId,
) -> Result<usize, LayerError> {
    match endpoint.send_to(data, dest, Some(interface)) {
        Ok(_) => Ok(1),
        Err(e) if is_benign_multicast_error(&e) => {
            debug!(interface, error = %e, "multicast send skipped");
            Ok(0)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackInet;
    use weave_wire::fabric_ula;

    const FABRIC: u64 = 0xFAB1;
    const NODE: u64 = 0x18B4_3000_0000_0001;

    fn two_interface_net() -> LoopbackInet {
        let inet = LoopbackInet::new();
        inet.add_interface(1, "wpan0", true);
        inet.add_interface(2, "wlan0", true);
        inet.add_interface(3, "lo", false);
        inet.add_address(1, fabric_ula(FABRIC, 6, NODE).into());
        inet.add_address(2, fabric_ula(FABRIC, 1, NODE).into());
        inet.add_address(3, fabric_ula(FABRIC, 7, NODE).into());
        inet.add_address(2, "fd12:3456::1".parse().unwrap());
        inet.add_address(2, "fe80::1".parse().unwrap());
        inet
    }

    fn config() -> LayerConfig {
        LayerConfig::for_node(NODE, FABRIC)
    }

    #[test]
    fn test_refresh_binds_general_and_fabric_endpoints() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();

        assert!(set.general_udp(IpVersion::V4).is_some());
        assert_eq!(
            set.general_udp(IpVersion::V6).map(|ep| ep.state()),
            Some(EndpointState::Listening)
        );
        assert!(set.tcp_listener(IpVersion::V6).is_some());
        assert_eq!(
            set.ula_addrs(),
            vec![
                IpAddr::from(fabric_ula(FABRIC, 6, NODE)),
                IpAddr::from(fabric_ula(FABRIC, 1, NODE)),
            ]
        );
        assert_eq!(set.interfaces().len(), 3);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        let bindings = inet.udp_bindings();
        let binds = inet.bind_calls();

        set.refresh(&mut inet, &config()).unwrap();
        assert_eq!(inet.udp_bindings(), bindings);
        assert_eq!(inet.bind_calls(), binds);
    }

    #[test]
    fn test_refresh_follows_address_changes() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();

        inet.remove_address(fabric_ula(FABRIC, 6, NODE).into());
        set.refresh(&mut inet, &config()).unwrap();
        assert_eq!(set.ula_addrs(), vec![IpAddr::from(fabric_ula(FABRIC, 1, NODE))]);
        assert!(!inet
            .udp_bindings()
            .iter()
            .any(|(addr, _)| addr.ip() == IpAddr::from(fabric_ula(FABRIC, 6, NODE))));
    }

    #[test]
    fn test_per_address_bind_failure_is_skipped() {
        let mut inet = two_interface_net();
        inet.fail_bind(fabric_ula(FABRIC, 6, NODE).into(), io::ErrorKind::AddrNotAvailable);
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        assert_eq!(set.ula_addrs(), vec![IpAddr::from(fabric_ula(FABRIC, 1, NODE))]);
    }

    #[test]
    fn test_general_bind_failure_aborts_refresh() {
        let mut inet = two_interface_net();
        inet.fail_bind("::".parse().unwrap(), io::ErrorKind::AddrInUse);
        let mut set = EndpointSet::new();
        let err = set.refresh(&mut inet, &config()).unwrap_err();
        assert!(matches!(err, LayerError::Io(e) if e.kind() == io::ErrorKind::AddrInUse));
        assert!(set.ula_addrs().is_empty());
    }

    #[test]
    fn test_table_bounds() {
        let mut inet = two_interface_net();
        let config = LayerConfig {
            max_local_addr_udp_endpoints: 1,
            max_interfaces: 2,
            ..config()
        };
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config).unwrap();
        assert_eq!(set.interfaces().len(), 2);
        assert_eq!(set.ula_addrs().len(), 1);
    }

    #[test]
    fn test_specific_listen_addr() {
        let mut inet = two_interface_net();
        let listen = IpAddr::from(fabric_ula(FABRIC, 1, NODE));
        let config = LayerConfig {
            listen_addr: Some(listen),
            ..config()
        };
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config).unwrap();
        assert!(set.general_udp(IpVersion::V4).is_none());
        assert_eq!(set.general_udp(IpVersion::V6).map(|ep| ep.addr()), Some(listen));
        assert!(set.ula_addrs().is_empty());
    }

    #[test]
    fn test_multicast_fans_out_over_fabric_endpoints() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        inet.take_sent();

        let dest: SocketAddr = "[ff02::1]:11095".parse().unwrap();
        assert_eq!(set.send_multicast(b"hello", dest, None, false).unwrap(), 2);
        let sent = inet.take_sent();
        let sources: Vec<_> = sent.iter().map(|d| d.from.map(|a| a.ip())).collect();
        assert_eq!(
            sources,
            vec![
                Some(IpAddr::from(fabric_ula(FABRIC, 6, NODE))),
                Some(IpAddr::from(fabric_ula(FABRIC, 1, NODE))),
            ]
        );

        assert_eq!(set.send_multicast(b"hello", dest, None, true).unwrap(), 2);
        let sent = inet.take_sent();
        assert!(sent.iter().all(|d| d.from.is_some_and(|a| a.ip().is_unspecified())));
        assert_eq!(sent.iter().map(|d| d.interface).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_multicast_tolerates_benign_errors() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        inet.take_sent();

        let dest: SocketAddr = "[ff02::1]:11095".parse().unwrap();
        inet.fail_send_on_interface(1, io::ErrorKind::NetworkUnreachable);
        assert_eq!(set.send_multicast(b"x", dest, None, true).unwrap(), 1);

        inet.fail_send_on_interface(2, io::ErrorKind::PermissionDenied);
        assert!(set.send_multicast(b"x", dest, None, true).is_err());
    }

    #[test]
    fn test_unicast_prefers_matching_fabric_endpoint() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        inet.take_sent();

        let peer = SocketAddr::new(fabric_ula(FABRIC, 1, 0x42).into(), 11095);
        set.send_unicast(b"x", peer, None).unwrap();
        let v4: SocketAddr = "10.0.0.2:11095".parse().unwrap();
        set.send_unicast(b"y", v4, None).unwrap();

        let sent = inet.take_sent();
        assert_eq!(sent[0].from.map(|a| a.ip()), Some(IpAddr::from(fabric_ula(FABRIC, 1, NODE))));
        assert!(sent[1].from.is_some_and(|a| a.is_ipv4()));
    }

    #[test]
    fn test_close_all() {
        let mut inet = two_interface_net();
        let mut set = EndpointSet::new();
        set.refresh(&mut inet, &config()).unwrap();
        set.close_all();
        assert!(set.is_empty());
        assert!(inet.udp_bindings().is_empty());
        assert!(inet.tcp_listeners().is_empty());
    }
}
