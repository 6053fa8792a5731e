//! Configuration handling for the weave node.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags. Node and fabric ids are written in hex, the way Weave tools
//! print them.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use weave_keys::SessionKeyTable;
use weave_layer::{InterfaceAddress, InterfaceInfo, LayerConfig, SystemInet};
use weave_wire::{KeyId, PeerAuthMode, SessionKeys};

/// Weave node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id, hex
    pub node_id: String,
    /// Fabric id, hex; "0" when not in a fabric
    pub fabric_id: String,
    /// How often the message layer is polled, e.g. "10ms"
    pub poll_interval: String,
    /// How often endpoints are re-bound against the interface list, e.g. "30s"
    pub refresh_interval: String,
    /// Message layer options; its node and fabric ids are overwritten
    pub layer: LayerConfig,
    /// Interfaces handed to the socket backend
    pub interfaces: Vec<InterfaceConfig>,
    /// Statically provisioned peer session keys
    pub session_keys: Vec<SessionKeyConfig>,
    /// Statically provisioned application group keys
    pub group_keys: Vec<GroupKeyConfig>,
}

/// A network interface and its addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name
    pub name: String,
    /// OS interface index
    pub index: u32,
    /// Whether multicast is enabled on the interface
    #[serde(default = "default_multicast")]
    pub multicast: bool,
    /// Addresses assigned to the interface
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

/// Key shared with one peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionKeyConfig {
    /// Peer node id, hex
    pub peer: String,
    /// Key id, a session or general key
    pub key_id: u16,
    /// 36 bytes of hex: 16-byte data key then 20-byte integrity key
    pub key: String,
    /// How the peer was authenticated when the key was established
    #[serde(default = "default_auth_mode")]
    pub auth_mode: PeerAuthMode,
}

/// Application group key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyConfig {
    /// Key id, an application static or rotating key
    pub key_id: u16,
    /// 36 bytes of hex
    pub key: String,
    /// First outbound message counter value
    #[serde(default)]
    pub initial_counter: u32,
}

fn default_multicast() -> bool {
    true
}

fn default_auth_mode() -> PeerAuthMode {
    PeerAuthMode::Case
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "1".to_string(),
            fabric_id: "0".to_string(),
            poll_interval: "10ms".to_string(),
            refresh_interval: "30s".to_string(),
            layer: LayerConfig::default(),
            interfaces: Vec::new(),
            session_keys: Vec::new(),
            group_keys: Vec::new(),
        }
    }
}

/// Parse a node or fabric id written in hex, with or without `0x`
pub fn parse_hex_id(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex id {:?}", value))
}

fn parse_key_material(hex_key: &str) -> Result<SessionKeys> {
    let mut material = hex::decode(hex_key.trim()).context("key is not valid hex")?;
    let keys = SessionKeys::from_slice(&material);
    material.iter_mut().for_each(|b| *b = 0);
    Ok(keys?)
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.validate()?;

        info!(
            "Final weave configuration: node_id={}, fabric_id={}, port={}, interfaces={}",
            config.node_id,
            config.fabric_id,
            config.layer.port,
            config.interfaces.len()
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup("WEAVE_NODE_ID") {
            info!("Node ID overridden by environment: {}", node_id);
            self.node_id = node_id;
        }

        if let Some(fabric_id) = lookup("WEAVE_FABRIC_ID") {
            info!("Fabric ID overridden by environment: {}", fabric_id);
            self.fabric_id = fabric_id;
        }

        if let Some(port) = lookup("WEAVE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.layer.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid WEAVE_PORT {:?}", port),
            }
        }

        if let Some(addr) = lookup("WEAVE_LISTEN_ADDR") {
            match addr.parse::<IpAddr>() {
                Ok(addr) => {
                    self.layer.listen_addr = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(_) => warn!("Ignoring invalid WEAVE_LISTEN_ADDR {:?}", addr),
            }
        }
    }

    /// Check every field that is parsed lazily
    pub fn validate(&self) -> Result<()> {
        self.layer_config()?;
        self.poll_interval()?;
        self.refresh_interval()?;
        for iface in &self.interfaces {
            if iface.name.is_empty() {
                bail!("interface with index {} has no name", iface.index);
            }
        }
        Ok(())
    }

    /// Layer options with this node's ids filled in
    pub fn layer_config(&self) -> Result<LayerConfig> {
        let config = LayerConfig {
            local_node_id: parse_hex_id(&self.node_id).context("node_id")?,
            fabric_id: parse_hex_id(&self.fabric_id).context("fabric_id")?,
            ..self.layer.clone()
        };
        config.validate().context("invalid layer configuration")?;
        Ok(config)
    }

    /// Poll period of the event loop
    pub fn poll_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.poll_interval)
            .with_context(|| format!("invalid poll_interval {:?}", self.poll_interval))
    }

    /// Period between endpoint refreshes
    pub fn refresh_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.refresh_interval)
            .with_context(|| format!("invalid refresh_interval {:?}", self.refresh_interval))
    }

    /// Socket backend over the configured interfaces
    pub fn system_inet(&self) -> SystemInet {
        let interfaces = self
            .interfaces
            .iter()
            .map(|iface| InterfaceInfo {
                id: iface.index,
                name: iface.name.clone(),
                multicast: iface.multicast,
            })
            .collect();
        let addresses = self
            .interfaces
            .iter()
            .flat_map(|iface| {
                iface.addresses.iter().map(move |addr| InterfaceAddress {
                    interface: iface.index,
                    addr: *addr,
                })
            })
            .collect();
        SystemInet::new(interfaces, addresses)
    }

    /// Key table holding the statically provisioned keys
    pub fn key_table(&self) -> Result<SessionKeyTable> {
        let mut table = SessionKeyTable::new();
        for entry in &self.session_keys {
            let peer = parse_hex_id(&entry.peer).context("session key peer")?;
            let keys = parse_key_material(&entry.key)
                .with_context(|| format!("session key {:#06x}", entry.key_id))?;
            table
                .add_session_key(peer, KeyId(entry.key_id), keys, entry.auth_mode)
                .with_context(|| format!("session key {:#06x}", entry.key_id))?;
        }
        for entry in &self.group_keys {
            let keys = parse_key_material(&entry.key)
                .with_context(|| format!("group key {:#06x}", entry.key_id))?;
            table
                .add_group_key(KeyId(entry.key_id), keys, entry.initial_counter)
                .with_context(|| format!("group key {:#06x}", entry.key_id))?;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use weave_layer::InetLayer;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20212223";

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        let layer = config.layer_config().unwrap();
        assert_eq!(layer.local_node_id, 1);
        assert_eq!(layer.fabric_id, 0);
        assert_eq!(layer.port, 11095);
        assert_eq!(config.poll_interval().unwrap(), Duration::from_millis(10));
        assert_eq!(config.refresh_interval().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("18B4300000000001").unwrap(), 0x18B4_3000_0000_0001);
        assert_eq!(parse_hex_id("0x1").unwrap(), 1);
        assert_eq!(parse_hex_id(" 0Xff ").unwrap(), 0xFF);
        assert!(parse_hex_id("node-1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = format!(
            r#"
node_id: "18B4300000000001"
fabric_id: "1234"
poll_interval: 5ms
layer:
  port: 11096
  listen_ipv4: false
  max_connections: 2
interfaces:
  - name: wpan0
    index: 3
    addresses:
      - "fd00:0:1234:6::1ab4:3000:0:1"
  - name: lo
    index: 1
    multicast: false
session_keys:
  - peer: "18B4300000000002"
    key_id: 0x2001
    key: "{KEY}"
group_keys:
  - key_id: 0x4001
    key: "{KEY}"
    initial_counter: 7
"#
        );

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();
        let layer = config.layer_config().unwrap();
        assert_eq!(layer.local_node_id, 0x18B4_3000_0000_0001);
        assert_eq!(layer.fabric_id, 0x1234);
        assert_eq!(layer.port, 11096);
        assert!(!layer.listen_ipv4);
        assert_eq!(layer.max_connections, 2);
        assert_eq!(layer.max_tunnels, 4);
        assert_eq!(config.poll_interval().unwrap(), Duration::from_millis(5));

        assert_eq!(config.interfaces.len(), 2);
        assert!(config.interfaces[0].multicast);
        assert!(!config.interfaces[1].multicast);

        let table = config.key_table().unwrap();
        let session = table.session(0x18B4_3000_0000_0002, KeyId(0x2001)).unwrap();
        assert_eq!(session.max_received(), None);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.node_id, NodeConfig::default().node_id);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"layer: [not, a, map]\n").unwrap();
        assert!(NodeConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WEAVE_NODE_ID", "0xAB"),
            ("WEAVE_FABRIC_ID", "5"),
            ("WEAVE_PORT", "12000"),
            ("WEAVE_LISTEN_ADDR", "fd00::1"),
        ]);
        let mut config = NodeConfig::default();
        config.apply_overrides_from(|name| env.get(name).map(|v| v.to_string()));

        let layer = config.layer_config().unwrap();
        assert_eq!(layer.local_node_id, 0xAB);
        assert_eq!(layer.fabric_id, 5);
        assert_eq!(layer.port, 12000);
        assert_eq!(layer.listen_addr, Some("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = NodeConfig::default();
        config.apply_overrides_from(|name| (name == "WEAVE_PORT").then(|| "99999".to_string()));
        assert_eq!(config.layer.port, 11095);
    }

    #[test]
    fn test_system_inet_lists_interface_addresses() {
        let config = NodeConfig {
            interfaces: vec![InterfaceConfig {
                name: "eth0".to_string(),
                index: 2,
                multicast: true,
                addresses: vec!["10.0.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
            }],
            ..NodeConfig::default()
        };
        let inet = config.system_inet();
        assert_eq!(inet.interfaces().len(), 1);
        assert_eq!(inet.interface_addresses().len(), 2);
    }

    #[test]
    fn test_bad_key_material_is_rejected() {
        let config = NodeConfig {
            session_keys: vec![SessionKeyConfig {
                peer: "2".to_string(),
                key_id: 0x2001,
                key: "abcd".to_string(),
                auth_mode: PeerAuthMode::Case,
            }],
            ..NodeConfig::default()
        };
        assert!(config.key_table().is_err());

        let config = NodeConfig {
            group_keys: vec![GroupKeyConfig {
                key_id: 0x2001,
                key: KEY.to_string(),
                initial_counter: 0,
            }],
            ..NodeConfig::default()
        };
        assert!(config.key_table().is_err());
    }
}
