//! Upper-layer callbacks.
//!
//! The layer owns its handler as a boxed trait object and lends itself to
//! each callback, so a handler can reply, open connections or close them
//! from inside the callback. Callbacks run after the layer has finished
//! updating its own state for the event.

use weave_wire::{MessageInfo, PacketBuffer, SessionKeyResolver};

use crate::connection::ConnectionId;
use crate::error::LayerError;
use crate::inet::{InetLayer, PacketInfo};
use crate::layer::MessageLayer;

/// Where a received message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// A datagram on one of the UDP endpoints
    Udp(PacketInfo),
    /// A stream connection
    Connection(ConnectionId),
}

/// A decoded message handed to the upper layer
#[derive(Debug)]
pub struct ReceivedMessage {
    /// Decoded header fields and receive flags
    pub info: MessageInfo,
    /// Decrypted payload
    pub payload: PacketBuffer,
    /// Transport the message arrived on
    pub source: MessageSource,
}

/// Receiver of message layer events
pub trait MessageLayerHandler<I: InetLayer + 'static, R: SessionKeyResolver + 'static> {
    /// A message addressed to this node was decoded
    fn on_message_received(&mut self, layer: &mut MessageLayer<I, R>, message: ReceivedMessage);

    /// A received message was rejected
    fn on_receive_error(
        &mut self,
        _layer: &mut MessageLayer<I, R>,
        _error: &LayerError,
        _source: &MessageSource,
    ) {
    }

    /// A peer opened a connection; the default closes it
    fn on_connection_received(&mut self, layer: &mut MessageLayer<I, R>, connection: ConnectionId) {
        let _ = layer.close_connection(connection);
    }

    /// An inbound connection could not be accepted
    fn on_accept_error(&mut self, _layer: &mut MessageLayer<I, R>, _error: &LayerError) {}

    /// An outbound connection finished connecting
    fn on_connection_complete(&mut self, _layer: &mut MessageLayer<I, R>, _connection: ConnectionId) {}

    /// A connection was closed by the peer or by an error
    fn on_connection_closed(
        &mut self,
        _layer: &mut MessageLayer<I, R>,
        _connection: ConnectionId,
        _error: Option<&LayerError>,
    ) {
    }

    /// The layer went from idle to busy or back
    fn on_activity_changed(&mut self, _layer: &mut MessageLayer<I, R>, _active: bool) {}

    /// A datagram carrying tunneled data was received
    fn on_udp_tunneled_message_received(
        &mut self,
        layer: &mut MessageLayer<I, R>,
        message: ReceivedMessage,
    ) {
        self.on_receive_error(layer, &LayerError::NoHandler, &message.source);
    }
}
