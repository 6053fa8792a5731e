//! Weave node binary.
//!
//! Binds the message layer's endpoints on the configured interfaces and
//! drives it from a single-threaded event loop: a poll tick delivers
//! received messages, a slower tick re-binds endpoints after address
//! changes, and Ctrl-C shuts the layer down.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use weave_keys::SessionKeyTable;
use weave_layer::{
    describe_peer, ConnectionId, LayerError, MessageLayer, MessageLayerHandler, MessageSource,
    ReceivedMessage, SystemInet,
};
use weave_wire::{MessageInfo, PacketBuffer, ANY_NODE_ID};

mod config;
mod logging;

use config::{parse_hex_id, NodeConfig};
use logging::WeaveLogFormatter;

type NodeLayer = MessageLayer<SystemInet, SessionKeyTable>;

/// Weave message layer node
#[derive(Parser, Debug)]
#[command(name = "weave-node", version, about = "Weave message layer node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "weave.yaml")]
    config: PathBuf,

    /// Node id in hex, overrides the configuration
    #[arg(long)]
    node_id: Option<String>,

    /// Fabric id in hex, overrides the configuration
    #[arg(long)]
    fabric_id: Option<String>,

    /// Bind only this address
    #[arg(long)]
    listen: Option<IpAddr>,

    /// UDP and TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Poll interval, e.g. 10ms
    #[arg(long)]
    poll_interval: Option<humantime::Duration>,

    /// Endpoint refresh interval, e.g. 30s
    #[arg(long)]
    refresh_interval: Option<humantime::Duration>,

    /// Open a connection at startup, as NODE_ID@ADDR (repeatable)
    #[arg(long)]
    connect: Vec<PeerTarget>,

    /// Send every unicast message back to its sender
    #[arg(long)]
    echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Peer to connect to at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeerTarget {
    node_id: u64,
    addr: SocketAddr,
}

impl FromStr for PeerTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (node, addr) = s
            .split_once('@')
            .with_context(|| format!("expected NODE_ID@ADDR, got {:?}", s))?;
        Ok(Self {
            node_id: parse_hex_id(node)?,
            addr: addr
                .parse()
                .with_context(|| format!("invalid socket address {:?}", addr))?,
        })
    }
}

impl Args {
    /// Command line flags take precedence over file and environment
    fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(node_id) = &self.node_id {
            config.node_id = node_id.clone();
        }
        if let Some(fabric_id) = &self.fabric_id {
            config.fabric_id = fabric_id.clone();
        }
        if let Some(listen) = self.listen {
            config.layer.listen_addr = Some(listen);
        }
        if let Some(port) = self.port {
            config.layer.port = port;
        }
        if let Some(interval) = &self.poll_interval {
            config.poll_interval = interval.to_string();
        }
        if let Some(interval) = &self.refresh_interval {
            config.refresh_interval = interval.to_string();
        }
    }
}

/// Logs layer events and optionally echoes messages back
#[derive(Debug, Default)]
struct NodeHandler {
    echo: bool,
}

impl NodeHandler {
    fn new(echo: bool) -> Self {
        Self { echo }
    }

    fn source_description(layer: &NodeLayer, message: &ReceivedMessage) -> String {
        match message.source {
            MessageSource::Udp(pkt) => describe_peer(
                message.info.source_node_id,
                Some(pkt.src),
                pkt.interface,
                None,
            ),
            MessageSource::Connection(id) => layer
                .peer_description(id)
                .unwrap_or_else(|| format!("stale {}", id)),
        }
    }

    fn echo_reply(layer: &mut NodeLayer, message: &ReceivedMessage) -> Result<(), LayerError> {
        let mut info = MessageInfo::new(layer.local_node_id(), message.info.source_node_id)
            .with_encryption(message.info.encryption_type, message.info.key_id);
        let mut buf = PacketBuffer::for_payload(message.payload.data());
        match message.source {
            MessageSource::Udp(pkt) => layer.send_message(pkt.src, pkt.interface, &mut info, &mut buf),
            MessageSource::Connection(id) => layer.send_connection_message(id, &mut info, &mut buf),
        }
    }
}

impl MessageLayerHandler<SystemInet, SessionKeyTable> for NodeHandler {
    fn on_message_received(&mut self, layer: &mut NodeLayer, message: ReceivedMessage) {
        let peer = Self::source_description(layer, &message);
        info!(
            peer = %peer,
            msg_id = message.info.message_id,
            len = message.payload.len(),
            duplicate = message.info.is_duplicate(),
            "message received"
        );

        // Multicast and duplicate traffic is never echoed.
        if self.echo && message.info.dest_node_id != ANY_NODE_ID && !message.info.is_duplicate() {
            if let Err(err) = Self::echo_reply(layer, &message) {
                warn!(peer = %peer, error = %err, "echo failed");
            }
        }
    }

    fn on_receive_error(&mut self, _layer: &mut NodeLayer, error: &LayerError, source: &MessageSource) {
        if error.is_key_error() {
            warn!(source = ?source, error = %error, "message rejected: key error");
        } else {
            warn!(source = ?source, error = %error, "message rejected");
        }
    }

    fn on_connection_received(&mut self, layer: &mut NodeLayer, connection: ConnectionId) {
        let peer = layer.peer_description(connection).unwrap_or_default();
        component_info!("conn", peer = %peer, "connection accepted");
    }

    fn on_accept_error(&mut self, _layer: &mut NodeLayer, error: &LayerError) {
        component_warn!("conn", error = %error, "connection refused");
    }

    fn on_connection_complete(&mut self, layer: &mut NodeLayer, connection: ConnectionId) {
        let peer = layer.peer_description(connection).unwrap_or_default();
        component_info!("conn", peer = %peer, "connection established");
    }

    fn on_connection_closed(
        &mut self,
        _layer: &mut NodeLayer,
        connection: ConnectionId,
        error: Option<&LayerError>,
    ) {
        match error {
            Some(err) => component_warn!("conn", connection = %connection, error = %err, "connection closed"),
            None => component_info!("conn", connection = %connection, "connection closed by peer"),
        }
    }

    fn on_activity_changed(&mut self, _layer: &mut NodeLayer, active: bool) {
        component_debug!("layer", active, "activity changed");
    }
}

fn connect_peers(layer: &mut NodeLayer, targets: &[PeerTarget]) -> Result<()> {
    for target in targets {
        let id = layer
            .new_connection()
            .with_context(|| format!("no connection slot for {}", target.addr))?;
        if let Err(err) = layer.connect(id, target.node_id, target.addr, None) {
            warn!(
                peer = %describe_peer(target.node_id, Some(target.addr), None, Some(id)),
                error = %err,
                "connect failed"
            );
            let _ = layer.abort_connection(id);
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("weave_node={}", args.log_level).parse()?)
        .add_directive(format!("weave_layer={}", args.log_level).parse()?)
        .add_directive(format!("weave_keys={}", args.log_level).parse()?)
        .add_directive(format!("weave_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(WeaveLogFormatter::new("weave"))
        .init();

    let mut config = NodeConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    args.apply_to(&mut config);
    config.validate()?;

    let poll_interval = config.poll_interval()?;
    let refresh_interval = config.refresh_interval()?;
    let layer_config = config.layer_config()?;
    let key_table = config.key_table().context("failed to load keys")?;

    let mut layer = MessageLayer::new(config.system_inet(), key_table, layer_config)
        .context("failed to initialize message layer")?;
    layer.set_handler(NodeHandler::new(args.echo));
    layer
        .refresh_endpoints()
        .context("failed to bind message layer endpoints")?;
    connect_peers(&mut layer, &args.connect)?;

    info!(
        node = format_args!("{:016X}", layer.local_node_id()),
        fabric = format_args!("{:X}", layer.fabric_id()),
        poll = %humantime::format_duration(poll_interval),
        "weave node running"
    );

    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut refresh = tokio::time::interval(refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Endpoints were just bound.
    refresh.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Err(err) = layer.poll() {
                    error!(error = %err, "poll failed, stopping");
                    break;
                }
            }
            _ = refresh.tick() => {
                if let Err(err) = layer.refresh_endpoints() {
                    warn!(error = %err, "endpoint refresh failed");
                }
            }
            res = &mut shutdown => {
                res.context("failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    layer.shutdown();
    info!("weave node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_target_parse() {
        let target: PeerTarget = "18B4300000000002@[fd00::2]:11095".parse().unwrap();
        assert_eq!(target.node_id, 0x18B4_3000_0000_0002);
        assert_eq!(target.addr, "[fd00::2]:11095".parse().unwrap());

        assert!("18B4300000000002".parse::<PeerTarget>().is_err());
        assert!("zz@10.0.0.1:11095".parse::<PeerTarget>().is_err());
        assert!("2@10.0.0.1".parse::<PeerTarget>().is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "weave-node",
            "--node-id",
            "0xAB",
            "--port",
            "12000",
            "--listen",
            "10.0.0.1",
            "--poll-interval",
            "25ms",
            "--connect",
            "2@10.0.0.2:11095",
        ]);
        let mut config = NodeConfig::default();
        args.apply_to(&mut config);

        let layer = config.layer_config().unwrap();
        assert_eq!(layer.local_node_id, 0xAB);
        assert_eq!(layer.port, 12000);
        assert_eq!(layer.listen_addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(config.poll_interval().unwrap().as_millis(), 25);
        assert_eq!(args.connect.len(), 1);
        assert!(!args.echo);
    }
}
