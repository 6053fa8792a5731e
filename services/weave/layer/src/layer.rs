//! The message layer facade.
//!
//! [`MessageLayer`] ties the codec to the bound endpoints and the
//! connection and tunnel pools. It is driven by [`MessageLayer::poll`],
//! which drains every endpoint without blocking and dispatches decoded
//! messages to the registered [`MessageLayerHandler`].

use std::fmt::{self, Write as _};
use std::net::{IpAddr, SocketAddr};
#[cfg(feature = "tunneling")]
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use weave_wire::{
    apply_address_policy, source_node_id_hint, MessageCodec, MessageFlags, MessageInfo,
    PacketBuffer, SessionKeyResolver, WireError, ANY_NODE_ID, MAX_FRAMED_MESSAGE_LEN,
    NODE_ID_NOT_SPECIFIED,
};

use crate::config::LayerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionState, ReadOutcome};
use crate::endpoints::{Datagram, EndpointSet};
use crate::error::LayerError;
use crate::handler::{MessageLayerHandler, MessageSource, ReceivedMessage};
use crate::inet::{InetLayer, InterfaceId, IpVersion, TcpEndpoint};
use crate::pool::Pool;
#[cfg(feature = "tunneling")]
use crate::tunnel::{RelayStatus, Tunnel, TunnelId};

/// Datagrams read per poll before moving on to streams
const MAX_DATAGRAMS_PER_POLL: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerState {
    Initialized,
    ShutDown,
}

/// Render a peer for log lines as `node <id> ([addr]:port%intf, con <n>)`
pub fn describe_peer(
    node_id: u64,
    addr: Option<SocketAddr>,
    interface: Option<InterfaceId>,
    connection: Option<ConnectionId>,
) -> String {
    let mut out = format!("node {node_id:016X}");
    let mut details = Vec::new();
    if let Some(addr) = addr {
        let mut text = format!("[{}]:{}", addr.ip(), addr.port());
        if let Some(interface) = interface {
            let _ = write!(text, "%{interface}");
        }
        details.push(text);
    }
    if let Some(connection) = connection {
        details.push(connection.to_string());
    }
    if !details.is_empty() {
        let _ = write!(out, " ({})", details.join(", "));
    }
    out
}

/// Weave message layer over an [`InetLayer`] and a session key resolver
pub struct MessageLayer<I: InetLayer + 'static, R: SessionKeyResolver + 'static> {
    config: LayerConfig,
    state: LayerState,
    inet: I,
    codec: MessageCodec<R>,
    endpoints: EndpointSet<I>,
    connections: Pool<Connection<I::Tcp>>,
    #[cfg(feature = "tunneling")]
    tunnels: Pool<Tunnel<I::Tcp>>,
    handler: Option<Box<dyn MessageLayerHandler<I, R>>>,
    handler_epoch: u64,
    active: bool,
    rx_scratch: Vec<u8>,
}

impl<I, R> MessageLayer<I, R>
where
    I: InetLayer + 'static,
    R: SessionKeyResolver + 'static,
{
    /// Create a layer; no endpoint is bound until [`Self::refresh_endpoints`]
    pub fn new(inet: I, resolver: R, config: LayerConfig) -> Result<Self, LayerError> {
        config.validate()?;
        info!(
            node = format_args!("{:016X}", config.local_node_id),
            fabric = format_args!("{:X}", config.fabric_id),
            port = config.port,
            "message layer initialized"
        );
        Ok(Self {
            state: LayerState::Initialized,
            codec: MessageCodec::new(config.local_node_id, resolver),
            endpoints: EndpointSet::new(),
            connections: Pool::with_capacity(config.max_connections),
            #[cfg(feature = "tunneling")]
            tunnels: Pool::with_capacity(config.max_tunnels),
            handler: None,
            handler_epoch: 0,
            active: false,
            rx_scratch: vec![0; config.max_message_len],
            inet,
            config,
        })
    }

    /// Register the receiver of layer events, replacing any previous one
    pub fn set_handler<H>(&mut self, handler: H)
    where
        H: MessageLayerHandler<I, R> + 'static,
    {
        self.handler_epoch += 1;
        self.handler = Some(Box::new(handler));
    }

    /// Remove the registered handler.
    ///
    /// Called from inside a callback this returns `None`, and the calling
    /// handler is dropped once the callback returns.
    pub fn clear_handler(&mut self) -> Option<Box<dyn MessageLayerHandler<I, R>>> {
        self.handler_epoch += 1;
        self.handler.take()
    }

    /// Active configuration
    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Node id stamped on outbound messages
    pub fn local_node_id(&self) -> u64 {
        self.config.local_node_id
    }

    /// Change the local node id, e.g. after joining a fabric
    pub fn set_local_node_id(&mut self, node_id: u64) {
        self.config.local_node_id = node_id;
        self.codec.set_local_node_id(node_id);
    }

    /// Fabric whose ULAs count as local addresses
    pub fn fabric_id(&self) -> u64 {
        self.config.fabric_id
    }

    /// Change the fabric id; takes effect on endpoints at the next refresh
    pub fn set_fabric_id(&mut self, fabric_id: u64) {
        self.config.fabric_id = fabric_id;
    }

    /// Session key resolver
    pub fn resolver(&self) -> &R {
        self.codec.resolver()
    }

    /// Session key resolver, mutable
    pub fn resolver_mut(&mut self) -> &mut R {
        self.codec.resolver_mut()
    }

    /// Socket layer
    pub fn inet(&self) -> &I {
        &self.inet
    }

    /// Socket layer, mutable
    pub fn inet_mut(&mut self) -> &mut I {
        &mut self.inet
    }

    /// Bound endpoints
    pub fn endpoints(&self) -> &EndpointSet<I> {
        &self.endpoints
    }

    /// Whether the layer accepts work
    pub fn is_initialized(&self) -> bool {
        self.state == LayerState::Initialized
    }

    fn ensure_initialized(&self) -> Result<(), LayerError> {
        match self.state {
            LayerState::Initialized => Ok(()),
            LayerState::ShutDown => Err(LayerError::NotInitialized),
        }
    }

    /// Rebind endpoints after a configuration or interface change
    pub fn refresh_endpoints(&mut self) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.endpoints.refresh(&mut self.inet, &self.config)
    }

    fn prepare_outbound(&self, info: &mut MessageInfo, dest: Option<IpAddr>) {
        if !info.flags.contains(MessageFlags::REUSE_SOURCE_ID) {
            info.source_node_id = self.local_node_id();
        }
        match dest {
            Some(addr) => apply_address_policy(info, &addr, self.config.fabric_id),
            None => info.flags |= MessageFlags::SOURCE_NODE_ID | MessageFlags::DEST_NODE_ID,
        }
    }

    /// Encode `buf` for a datagram to `dest` without sending it
    pub fn encode_message(
        &mut self,
        dest: IpAddr,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
    ) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.prepare_outbound(info, Some(dest));
        self.codec
            .encode_message(info, buf, None, self.config.max_message_len, 0)?;
        Ok(())
    }

    /// Encode and send a datagram.
    ///
    /// IPv6 multicast destinations are fanned out over the interfaces;
    /// everything else goes out once. With [`MessageFlags::DELAY_SEND`] the
    /// message is only encoded. The caller keeps `buf`, so it can be
    /// retransmitted with [`Self::resend_message`].
    pub fn send_message(
        &mut self,
        dest: SocketAddr,
        interface: Option<InterfaceId>,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
    ) -> Result<(), LayerError> {
        self.encode_message(dest.ip(), info, buf)?;
        if info.flags.contains(MessageFlags::DELAY_SEND) {
            debug!(msg_id = info.message_id, "send delayed");
            return Ok(());
        }
        self.transmit(dest, interface, info.flags, buf.data())?;
        trace!(
            msg_id = info.message_id,
            peer = %describe_peer(info.dest_node_id, Some(dest), interface, None),
            len = buf.len(),
            "message sent"
        );
        Ok(())
    }

    /// Send an already encoded message again, possibly to another address
    pub fn resend_message(
        &mut self,
        dest: SocketAddr,
        interface: Option<InterfaceId>,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
    ) -> Result<(), LayerError> {
        if !info.flags.contains(MessageFlags::MESSAGE_ENCODED) {
            return Err(LayerError::IncorrectState);
        }
        info.flags.remove(MessageFlags::DELAY_SEND);
        info.flags |= MessageFlags::REUSE_MESSAGE_ID | MessageFlags::REUSE_SOURCE_ID;
        self.send_message(dest, interface, info, buf)
    }

    /// Send a datagram carrying tunneled data
    pub fn send_udp_tunneled_message(
        &mut self,
        dest: SocketAddr,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
    ) -> Result<(), LayerError> {
        info.flags |= MessageFlags::TUNNELED_DATA;
        self.send_message(dest, None, info, buf)
    }

    fn transmit(
        &mut self,
        dest: SocketAddr,
        interface: Option<InterfaceId>,
        flags: MessageFlags,
        data: &[u8],
    ) -> Result<(), LayerError> {
        match dest.ip() {
            IpAddr::V6(v6) if v6.is_multicast() => {
                let from_link_local = flags.contains(MessageFlags::MULTICAST_FROM_LINK_LOCAL);
                let copies = self
                    .endpoints
                    .send_multicast(data, dest, interface, from_link_local)?;
                trace!(copies, dest = %dest, "multicast fan-out");
                Ok(())
            }
            _ => self.endpoints.send_unicast(data, dest, interface),
        }
    }

    /// Allocate a connection slot
    pub fn new_connection(&mut self) -> Result<ConnectionId, LayerError> {
        self.ensure_initialized()?;
        let handle = self
            .connections
            .insert(Connection::new(self.config.connection_rx_buffer))
            .ok_or_else(|| {
                warn!(max = self.config.max_connections, "connection pool exhausted");
                LayerError::NoMemory
            })?;
        self.update_activity();
        Ok(ConnectionId(handle))
    }

    /// Start connecting a fresh connection to a peer
    pub fn connect(
        &mut self,
        id: ConnectionId,
        peer_node_id: u64,
        addr: SocketAddr,
        interface: Option<InterfaceId>,
    ) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        let state = self
            .connections
            .get(id.0)
            .map(Connection::state)
            .ok_or(LayerError::InvalidConnection)?;
        if state != ConnectionState::Ready {
            return Err(LayerError::IncorrectState);
        }

        let mut endpoint = self.inet.new_tcp_endpoint(IpVersion::of(&addr.ip()))?;
        if let Err(e) = endpoint.connect(addr, interface) {
            endpoint.abort();
            warn!(peer = %describe_peer(peer_node_id, Some(addr), interface, Some(id)), error = %e, "connect failed");
            return Err(e.into());
        }
        let Some(con) = self.connections.get_mut(id.0) else {
            endpoint.abort();
            return Err(LayerError::InvalidConnection);
        };
        con.start_connect(endpoint, peer_node_id, addr);
        info!(peer = %describe_peer(peer_node_id, Some(addr), interface, Some(id)), "connecting");
        Ok(())
    }

    /// Connection behind a handle
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection<I::Tcp>> {
        self.connections.get(id.0)
    }

    /// Number of connections in use
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Log description of a connection's peer
    pub fn peer_description(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .get(id.0)
            .map(|con| describe_peer(con.peer_node_id(), con.peer_addr(), None, Some(id)))
    }

    /// Encode a message with a length prefix and send it over a connection
    pub fn send_connection_message(
        &mut self,
        id: ConnectionId,
        info: &mut MessageInfo,
        buf: &mut PacketBuffer,
    ) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        let con = self.connections.get(id.0).ok_or(LayerError::InvalidConnection)?;
        if !matches!(
            con.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Err(LayerError::IncorrectState);
        }
        let con_ref = con.connection_ref(id);
        let peer_addr = con.peer_addr();
        if info.dest_node_id == NODE_ID_NOT_SPECIFIED {
            info.dest_node_id = con.peer_node_id();
        }

        self.prepare_outbound(info, peer_addr.map(|addr| addr.ip()));
        let max_len = self.config.max_message_len.min(MAX_FRAMED_MESSAGE_LEN);
        self.codec
            .encode_message_with_length(info, buf, Some(&con_ref), max_len)?;
        if info.flags.contains(MessageFlags::DELAY_SEND) {
            return Ok(());
        }

        let con = self
            .connections
            .get_mut(id.0)
            .ok_or(LayerError::InvalidConnection)?;
        con.send(buf.data())?;
        trace!(con = %id, msg_id = info.message_id, len = buf.len(), "connection message sent");
        Ok(())
    }

    /// Close a connection after flushing queued bytes
    pub fn close_connection(&mut self, id: ConnectionId) -> Result<(), LayerError> {
        let mut con = self
            .connections
            .remove(id.0)
            .ok_or(LayerError::InvalidConnection)?;
        con.close();
        self.codec.resolver_mut().connection_closed(id.as_u64());
        info!(con = %id, "connection closed");
        self.update_activity();
        Ok(())
    }

    /// Reset a connection immediately
    pub fn abort_connection(&mut self, id: ConnectionId) -> Result<(), LayerError> {
        let mut con = self
            .connections
            .remove(id.0)
            .ok_or(LayerError::InvalidConnection)?;
        con.abort();
        self.codec.resolver_mut().connection_closed(id.as_u64());
        info!(con = %id, "connection aborted");
        self.update_activity();
        Ok(())
    }

    fn drop_connection(&mut self, id: ConnectionId, error: Option<LayerError>) {
        let Some(mut con) = self.connections.remove(id.0) else {
            return;
        };
        match &error {
            Some(_) => con.abort(),
            None => con.close(),
        }
        self.codec.resolver_mut().connection_closed(id.as_u64());
        match &error {
            Some(e) => warn!(con = %id, error = %e, "connection closed on error"),
            None => info!(con = %id, "connection closed by peer"),
        }
        self.with_handler(|handler, layer| handler.on_connection_closed(layer, id, error.as_ref()));
    }

    /// Join two connected connections into a tunnel.
    ///
    /// Both connections must be `Connected`, otherwise nothing changes. Once
    /// the check passes both connections are closed whatever the outcome,
    /// their endpoints now belonging to the tunnel.
    #[cfg(feature = "tunneling")]
    pub fn create_tunnel(
        &mut self,
        a: ConnectionId,
        b: ConnectionId,
        idle_timeout: Duration,
    ) -> Result<TunnelId, LayerError> {
        self.ensure_initialized()?;
        if a == b {
            return Err(LayerError::InvalidConnection);
        }
        let state_a = self.connections.get(a.0).map(Connection::state);
        let state_b = self.connections.get(b.0).map(Connection::state);
        match (state_a, state_b) {
            (Some(ConnectionState::Connected), Some(ConnectionState::Connected)) => {}
            (Some(_), Some(_)) => return Err(LayerError::IncorrectState),
            _ => return Err(LayerError::InvalidConnection),
        }

        let endpoints = (self.release_endpoint(a), self.release_endpoint(b));
        let (end_a, end_b) = match endpoints {
            (Some(end_a), Some(end_b)) => (end_a, end_b),
            (end_a, end_b) => {
                for mut endpoint in [end_a, end_b].into_iter().flatten() {
                    endpoint.abort();
                }
                self.update_activity();
                return Err(LayerError::IncorrectState);
            }
        };

        if self.tunnels.is_full() {
            for mut endpoint in [end_a, end_b] {
                endpoint.abort();
            }
            warn!(max = self.config.max_tunnels, "tunnel pool exhausted");
            self.update_activity();
            return Err(LayerError::NoMemory);
        }
        let tunnel = match Tunnel::new(end_a, end_b, idle_timeout) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.update_activity();
                return Err(e.into());
            }
        };
        let handle = self.tunnels.insert(tunnel).ok_or(LayerError::NoMemory)?;
        let id = TunnelId(handle);
        info!(tunnel = %id, a = %a, b = %b, idle_timeout = ?idle_timeout, "tunnel created");
        self.update_activity();
        Ok(id)
    }

    #[cfg(feature = "tunneling")]
    fn release_endpoint(&mut self, id: ConnectionId) -> Option<I::Tcp> {
        let mut con = self.connections.remove(id.0)?;
        if let Err(e) = con.flush() {
            debug!(con = %id, error = %e, "queued bytes dropped on tunnel handover");
        }
        let endpoint = con.take_endpoint();
        con.close();
        self.codec.resolver_mut().connection_closed(id.as_u64());
        endpoint
    }

    /// Shut a tunnel down, closing both endpoints
    #[cfg(feature = "tunneling")]
    pub fn close_tunnel(&mut self, id: TunnelId) -> Result<(), LayerError> {
        let mut tunnel = self
            .tunnels
            .remove(id.0)
            .ok_or(LayerError::InvalidConnection)?;
        tunnel.shutdown();
        info!(tunnel = %id, "tunnel closed");
        self.update_activity();
        Ok(())
    }

    /// Number of tunnels in use
    #[cfg(feature = "tunneling")]
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of tunnels in use
    #[cfg(not(feature = "tunneling"))]
    pub fn tunnel_count(&self) -> usize {
        0
    }

    /// Whether any connection or tunnel is in use
    pub fn is_active(&self) -> bool {
        self.connection_count() + self.tunnel_count() > 0
    }

    /// Process everything pending on the endpoints, connections and tunnels
    pub fn poll(&mut self) -> Result<(), LayerError> {
        self.ensure_initialized()?;
        self.poll_datagrams();
        self.poll_accept();
        for handle in self.connections.handles() {
            self.poll_connection(ConnectionId(handle));
        }
        #[cfg(feature = "tunneling")]
        self.poll_tunnels();
        self.update_activity();
        Ok(())
    }

    fn poll_datagrams(&mut self) {
        let datagrams = self
            .endpoints
            .recv_datagrams(&mut self.rx_scratch, MAX_DATAGRAMS_PER_POLL);
        for datagram in datagrams {
            match datagram {
                Ok(datagram) => self.handle_datagram(datagram),
                Err(e) => warn!(error = %e, "UDP receive failed"),
            }
        }
    }

    fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram { mut data, info: packet } = datagram;
        let hint = source_node_id_hint(&packet.src.ip());
        let source = MessageSource::Udp(packet);

        let mut info = MessageInfo::default();
        if let Err(e) = self.codec.decode_message(&mut data, hint, None, &mut info) {
            debug!(
                peer = %describe_peer(hint.unwrap_or(NODE_ID_NOT_SPECIFIED), Some(packet.src), packet.interface, None),
                error = %e,
                "dropping datagram"
            );
            self.report_receive_error(&e.into(), &source);
            return;
        }

        let message = ReceivedMessage {
            info,
            payload: data,
            source,
        };
        if message.info.is_tunneled_data() {
            let msg_id = message.info.message_id;
            let delivered = self.with_handler(|handler, layer| {
                handler.on_udp_tunneled_message_received(layer, message)
            });
            if !delivered {
                debug!(msg_id, "no handler for tunneled datagram");
            }
            return;
        }
        self.dispatch_message(message);
    }

    fn dispatch_message(&mut self, message: ReceivedMessage) {
        let dest = message.info.dest_node_id;
        if dest != self.local_node_id() && dest != ANY_NODE_ID {
            debug!(
                msg_id = message.info.message_id,
                dest = format_args!("{dest:016X}"),
                "message for another node"
            );
            self.report_receive_error(&LayerError::InvalidDestinationNodeId(dest), &message.source);
            return;
        }

        let msg_id = message.info.message_id;
        let source = message.info.source_node_id;
        let delivered =
            self.with_handler(|handler, layer| handler.on_message_received(layer, message));
        if !delivered {
            warn!(
                msg_id,
                source = format_args!("{source:016X}"),
                error = %LayerError::NoHandler,
                "dropping received message"
            );
        }
    }

    fn report_receive_error(&mut self, error: &LayerError, source: &MessageSource) {
        let reported =
            self.with_handler(|handler, layer| handler.on_receive_error(layer, error, source));
        if !reported {
            debug!(error = %error, "receive error with no handler");
        }
    }

    fn poll_accept(&mut self) {
        for accepted in self.endpoints.accept_connections() {
            let mut endpoint = match accepted {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    let error = LayerError::from(e);
                    warn!(error = %error, "accept failed");
                    self.with_handler(|handler, layer| handler.on_accept_error(layer, &error));
                    continue;
                }
            };
            let peer = endpoint.peer_addr();

            if self.handler.is_none() {
                debug!(peer = ?peer, "no handler registered, closing inbound connection");
                endpoint.close();
                continue;
            }
            if self.connections.is_full() {
                warn!(
                    peer = ?peer,
                    max = self.config.max_connections,
                    "connection pool exhausted, rejecting inbound connection"
                );
                endpoint.abort();
                let error = LayerError::NoMemory;
                self.with_handler(|handler, layer| handler.on_accept_error(layer, &error));
                continue;
            }

            let con = Connection::accepted(endpoint, self.config.connection_rx_buffer);
            let Some(handle) = self.connections.insert(con) else {
                continue;
            };
            let id = ConnectionId(handle);
            info!(con = %id, peer = ?peer, "inbound connection accepted");
            self.with_handler(|handler, layer| handler.on_connection_received(layer, id));
        }
    }

    fn poll_connection(&mut self, id: ConnectionId) {
        let mut received = Vec::new();
        let mut failure: Option<LayerError> = None;
        let mut peer_closed = false;

        let Some(con) = self.connections.get_mut(id.0) else {
            return;
        };
        let completed = match con.check_connected() {
            Ok(completed) => completed,
            Err(e) => {
                self.drop_connection(id, Some(e.into()));
                return;
            }
        };
        if con.state() != ConnectionState::Connected {
            return;
        }
        if let Err(e) = con.flush() {
            failure = Some(e.into());
        }
        let con_ref = con.connection_ref(id);

        while failure.is_none() {
            loop {
                let hint = Some(con.peer_node_id()).filter(|node| *node != NODE_ID_NOT_SPECIFIED);
                let mut info = MessageInfo::default();
                match self
                    .codec
                    .decode_message_with_length(con.rx_mut(), hint, Some(&con_ref), &mut info)
                {
                    Ok(payload) => {
                        if con.peer_node_id() == NODE_ID_NOT_SPECIFIED {
                            con.set_peer_node_id(info.source_node_id);
                        }
                        received.push(ReceivedMessage {
                            info,
                            payload,
                            source: MessageSource::Connection(id),
                        });
                    }
                    Err(WireError::MessageIncomplete) => break,
                    Err(e) => {
                        failure = Some(e.into());
                        break;
                    }
                }
            }
            if failure.is_some() {
                break;
            }

            match con.read_available() {
                Ok(ReadOutcome::Data(_)) => {}
                Ok(ReadOutcome::Idle) => break,
                Ok(ReadOutcome::Closed) => {
                    peer_closed = true;
                    break;
                }
                Ok(ReadOutcome::BufferFull) => {
                    let max = con.rx_mut().capacity();
                    failure = Some(WireError::MessageTooLong { len: max + 1, max }.into());
                }
                Err(e) => failure = Some(e.into()),
            }
        }

        if completed {
            info!(con = %id, "connection established");
            self.with_handler(|handler, layer| handler.on_connection_complete(layer, id));
        }
        for message in received {
            self.dispatch_message(message);
        }
        if let Some(error) = failure {
            self.report_receive_error(&error, &MessageSource::Connection(id));
            self.drop_connection(id, Some(error));
        } else if peer_closed {
            self.drop_connection(id, None);
        }
    }

    #[cfg(feature = "tunneling")]
    fn poll_tunnels(&mut self) {
        for handle in self.tunnels.handles() {
            let Some(tunnel) = self.tunnels.get_mut(handle) else {
                continue;
            };
            match tunnel.relay() {
                RelayStatus::Active(bytes) => trace!(tunnel = %TunnelId(handle), bytes, "tunnel relayed"),
                RelayStatus::Idle => {}
                RelayStatus::Closed => {
                    if let Some(mut tunnel) = self.tunnels.remove(handle) {
                        tunnel.shutdown();
                        info!(tunnel = %TunnelId(handle), "tunnel closed");
                    }
                }
            }
        }
    }

    fn update_activity(&mut self) {
        let active = self.is_active();
        if active == self.active {
            return;
        }
        self.active = active;
        debug!(active, "message layer activity changed");
        self.with_handler(|handler, layer| handler.on_activity_changed(layer, active));
    }

    /// Run `f` with the handler lent out, returning whether one was registered
    fn with_handler<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut (dyn MessageLayerHandler<I, R> + 'static), &mut Self),
    {
        let Some(mut handler) = self.handler.take() else {
            return false;
        };
        let epoch = self.handler_epoch;
        f(handler.as_mut(), self);
        // A set or clear made during the callback wins.
        if self.handler_epoch == epoch {
            self.handler = Some(handler);
        }
        true
    }

    /// Close every endpoint and abort all connections and tunnels
    pub fn close_endpoints(&mut self) {
        self.endpoints.close_all();
        for handle in self.connections.handles() {
            if let Some(mut con) = self.connections.remove(handle) {
                con.abort();
                self.codec
                    .resolver_mut()
                    .connection_closed(ConnectionId(handle).as_u64());
            }
        }
        #[cfg(feature = "tunneling")]
        for handle in self.tunnels.handles() {
            if let Some(mut tunnel) = self.tunnels.remove(handle) {
                tunnel.abort();
            }
        }
        info!("endpoints closed, connections and tunnels aborted");
        self.update_activity();
    }

    /// Close everything; later calls fail with [`LayerError::NotInitialized`]
    pub fn shutdown(&mut self) {
        if self.state == LayerState::ShutDown {
            return;
        }
        self.close_endpoints();
        self.state = LayerState::ShutDown;
        info!(node = format_args!("{:016X}", self.local_node_id()), "message layer shut down");
    }
}

impl<I: InetLayer + 'static, R: SessionKeyResolver + 'static> fmt::Debug for MessageLayer<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MessageLayer");
        debug
            .field("state", &self.state)
            .field("local_node_id", &format_args!("{:016X}", self.config.local_node_id))
            .field("connections", &self.connections.len());
        #[cfg(feature = "tunneling")]
        debug.field("tunnels", &self.tunnels.len());
        debug
            .field("handler", &self.handler.is_some())
            .field("active", &self.active)
            .finish()
    }
}
