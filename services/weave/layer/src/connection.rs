//! Stream connections owned by the message layer.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use weave_wire::{ConnectionRef, PacketBuffer, NODE_ID_NOT_SPECIFIED};

use crate::inet::TcpEndpoint;
use crate::pool::Handle;

/// Handle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) Handle);

impl ConnectionId {
    /// Identifier handed to the session key table
    pub fn as_u64(&self) -> u64 {
        self.0.as_u64()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con {}", self.0)
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Allocated, no endpoint yet
    Ready,
    /// Outbound connect in progress
    Connecting,
    /// Stream established
    Connected,
    /// Endpoint released
    Closed,
}

/// Result of draining a connection's socket into its receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were appended to the receive buffer
    Data(usize),
    /// Nothing pending
    Idle,
    /// Peer closed the stream
    Closed,
    /// Receive buffer is full and holds no complete message
    BufferFull,
}

/// A stream connection and its framing state
#[derive(Debug)]
pub struct Connection<T> {
    state: ConnectionState,
    endpoint: Option<T>,
    peer_node_id: u64,
    peer_addr: Option<SocketAddr>,
    inbound: bool,
    rx: PacketBuffer,
    tx_pending: Vec<u8>,
}

impl<T: TcpEndpoint> Connection<T> {
    /// Unconnected connection with a receive buffer of `rx_capacity` bytes
    pub fn new(rx_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Ready,
            endpoint: None,
            peer_node_id: NODE_ID_NOT_SPECIFIED,
            peer_addr: None,
            inbound: false,
            rx: PacketBuffer::with_capacity(rx_capacity, 0),
            tx_pending: Vec::new(),
        }
    }

    /// Connection wrapping an accepted endpoint
    pub fn accepted(endpoint: T, rx_capacity: usize) -> Self {
        let mut con = Self::new(rx_capacity);
        con.peer_addr = endpoint.peer_addr();
        con.endpoint = Some(endpoint);
        con.state = ConnectionState::Connected;
        con.inbound = true;
        con
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Node at the other end, if known
    pub fn peer_node_id(&self) -> u64 {
        self.peer_node_id
    }

    /// Record the node at the other end
    pub fn set_peer_node_id(&mut self, node_id: u64) {
        self.peer_node_id = node_id;
    }

    /// Address of the other end
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the peer initiated the connection
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Reference passed to the codec for per-connection counters
    pub fn connection_ref(&self, id: ConnectionId) -> ConnectionRef {
        ConnectionRef {
            id: id.as_u64(),
            peer_node_id: self.peer_node_id,
        }
    }

    /// Attach an endpoint on which a connect was started.
    ///
    /// The connection stays `Connecting` until the next poll observes the
    /// endpoint as connected, even if the connect already completed.
    pub(crate) fn start_connect(&mut self, endpoint: T, peer_node_id: u64, addr: SocketAddr) {
        self.state = ConnectionState::Connecting;
        self.endpoint = Some(endpoint);
        self.peer_node_id = peer_node_id;
        self.peer_addr = Some(addr);
    }

    /// Move to `Connected` once the endpoint reports completion
    pub(crate) fn check_connected(&mut self) -> io::Result<bool> {
        if self.state != ConnectionState::Connecting {
            return Ok(false);
        }
        let Some(endpoint) = self.endpoint.as_ref() else {
            return Ok(false);
        };
        if endpoint.is_connected()? {
            self.state = ConnectionState::Connected;
            return Ok(true);
        }
        Ok(false)
    }

    /// Give up ownership of the endpoint without closing it
    pub(crate) fn take_endpoint(&mut self) -> Option<T> {
        self.state = ConnectionState::Closed;
        self.endpoint.take()
    }

    /// Queue bytes and write as much as the socket accepts.
    ///
    /// While connecting the bytes are only queued.
    pub(crate) fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.tx_pending.extend_from_slice(data);
        if self.state == ConnectionState::Connecting {
            return Ok(());
        }
        self.flush()
    }

    /// Write queued bytes
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        while !self.tx_pending.is_empty() {
            let n = endpoint.send(&self.tx_pending)?;
            if n == 0 {
                break;
            }
            self.tx_pending.drain(..n);
        }
        Ok(())
    }

    /// Whether queued bytes are waiting for the socket
    pub fn has_pending_tx(&self) -> bool {
        !self.tx_pending.is_empty()
    }

    /// Read whatever the socket has into the receive buffer
    pub(crate) fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        if self.rx.available_tail() == 0 {
            self.rx.compact();
            if self.rx.available_tail() == 0 {
                return Ok(ReadOutcome::BufferFull);
            }
        }

        match endpoint.recv(self.rx.tail_mut())? {
            None => Ok(ReadOutcome::Idle),
            Some(0) => Ok(ReadOutcome::Closed),
            Some(n) => {
                let len = self.rx.len() + n;
                self.rx
                    .set_len(len)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(ReadOutcome::Data(n))
            }
        }
    }

    /// Buffered inbound bytes
    pub(crate) fn rx_mut(&mut self) -> &mut PacketBuffer {
        &mut self.rx
    }

    /// Close gracefully
    pub(crate) fn close(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            let _ = self.flush_into(&mut endpoint);
            endpoint.close();
        }
        self.state = ConnectionState::Closed;
    }

    /// Close immediately
    pub(crate) fn abort(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.abort();
        }
        self.tx_pending.clear();
        self.state = ConnectionState::Closed;
    }

    fn flush_into(&mut self, endpoint: &mut T) -> io::Result<()> {
        while !self.tx_pending.is_empty() {
            let n = endpoint.send(&self.tx_pending)?;
            if n == 0 {
                break;
            }
            self.tx_pending.drain(..n);
        }
        Ok(())
    }
}
