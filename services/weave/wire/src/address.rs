//! Fabric addressing rules.
//!
//! Fabric nodes own IPv6 ULAs of the form
//! `fd <global id: 40 bits> <subnet: 16 bits> <interface id: 64 bits>`,
//! where the global id is derived from the fabric id and the interface id
//! from the node id. When an address carries this information the
//! corresponding node ids can be left out of the message header.

use std::net::{IpAddr, Ipv6Addr};

use crate::message_info::{MessageFlags, MessageInfo};

/// Well-known Weave port
pub const WEAVE_PORT: u16 = 11095;

const ULA_PREFIX: u8 = 0xFD;
const GLOBAL_ID_MASK: u64 = 0xFF_FFFF_FFFF;
const UNIVERSAL_LOCAL_BIT: u64 = 0x0200_0000_0000_0000;

/// Whether the address is an IPv6 unique local address
pub fn is_ula(addr: &Ipv6Addr) -> bool {
    addr.octets()[0] == ULA_PREFIX
}

/// Global id of a ULA
pub fn global_id(addr: &Ipv6Addr) -> u64 {
    let o = addr.octets();
    u64::from_be_bytes([0, 0, 0, o[1], o[2], o[3], o[4], o[5]])
}

/// Subnet of a ULA
pub fn subnet(addr: &Ipv6Addr) -> u16 {
    let o = addr.octets();
    u16::from_be_bytes([o[6], o[7]])
}

/// Interface identifier (low 64 bits) of an IPv6 address
pub fn interface_id(addr: &Ipv6Addr) -> u64 {
    let o = addr.octets();
    u64::from_be_bytes([o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]])
}

/// Global id used by a fabric's ULAs
pub fn fabric_global_id(fabric_id: u64) -> u64 {
    fabric_id & GLOBAL_ID_MASK
}

/// Node id encoded in an IPv6 interface identifier
pub fn node_id_from_interface_id(interface_id: u64) -> u64 {
    interface_id ^ UNIVERSAL_LOCAL_BIT
}

/// IPv6 interface identifier for a node id
pub fn interface_id_from_node_id(node_id: u64) -> u64 {
    node_id ^ UNIVERSAL_LOCAL_BIT
}

/// Fabric ULA of a node on a subnet
pub fn fabric_ula(fabric_id: u64, subnet: u16, node_id: u64) -> Ipv6Addr {
    let gid = fabric_global_id(fabric_id).to_be_bytes();
    let sub = subnet.to_be_bytes();
    let iid = interface_id_from_node_id(node_id).to_be_bytes();
    let mut o = [0u8; 16];
    o[0] = ULA_PREFIX;
    o[1..6].copy_from_slice(&gid[3..8]);
    o[6..8].copy_from_slice(&sub);
    o[8..16].copy_from_slice(&iid);
    Ipv6Addr::from(o)
}

/// Whether the address is a ULA belonging to the fabric
pub fn is_fabric_address(addr: &IpAddr, fabric_id: u64) -> bool {
    match addr {
        IpAddr::V6(v6) => is_ula(v6) && global_id(v6) == fabric_global_id(fabric_id),
        IpAddr::V4(_) => false,
    }
}

/// Force id inclusion for ids the destination address cannot convey.
///
/// The source id is required unless the destination is a fabric ULA; the
/// destination id is required unless it equals the node id derived from
/// the destination's interface identifier.
pub fn apply_address_policy(info: &mut MessageInfo, dest: &IpAddr, fabric_id: u64) {
    if !is_fabric_address(dest, fabric_id) {
        info.flags |= MessageFlags::SOURCE_NODE_ID;
    }

    let derivable = match dest {
        IpAddr::V6(v6) => {
            is_ula(v6) && node_id_from_interface_id(interface_id(v6)) == info.dest_node_id
        }
        IpAddr::V4(_) => false,
    };
    if !derivable {
        info.flags |= MessageFlags::DEST_NODE_ID;
    }
}

/// Source node id implied by a sender's address, if it is a ULA
pub fn source_node_id_hint(src: &IpAddr) -> Option<u64> {
    match src {
        IpAddr::V6(v6) if is_ula(v6) => Some(node_id_from_interface_id(interface_id(v6))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FABRIC: u64 = 0x1234_5678_9ABC;

    #[test]
    fn test_fabric_ula_layout() {
        let addr = fabric_ula(FABRIC, 1, 0x18B4_3000_0000_0001);
        assert_eq!(addr, "fd34:5678:9abc:1:1ab4:3000:0:1".parse::<Ipv6Addr>().unwrap());
        assert!(is_ula(&addr));
        assert_eq!(global_id(&addr), fabric_global_id(FABRIC));
        assert_eq!(subnet(&addr), 1);
        assert_eq!(node_id_from_interface_id(interface_id(&addr)), 0x18B4_3000_0000_0001);
    }

    #[test]
    fn test_policy_forces_ids_for_non_fabric_dest() {
        let mut info = MessageInfo::new(1, 2);
        apply_address_policy(&mut info, &"10.0.0.2".parse().unwrap(), FABRIC);
        assert!(info.flags.contains(MessageFlags::SOURCE_NODE_ID | MessageFlags::DEST_NODE_ID));
    }

    #[test]
    fn test_policy_omits_ids_for_matching_fabric_dest() {
        let dest = IpAddr::V6(fabric_ula(FABRIC, 1, 2));
        let mut info = MessageInfo::new(1, 2);
        apply_address_policy(&mut info, &dest, FABRIC);
        assert!(info.flags.is_empty());

        let mut info = MessageInfo::new(1, 3);
        apply_address_policy(&mut info, &dest, FABRIC);
        assert_eq!(info.flags, MessageFlags::DEST_NODE_ID);
    }

    #[test]
    fn test_policy_foreign_fabric_forces_source() {
        let dest = IpAddr::V6(fabric_ula(0xAAAA, 1, 2));
        let mut info = MessageInfo::new(1, 2);
        apply_address_policy(&mut info, &dest, FABRIC);
        assert_eq!(info.flags, MessageFlags::SOURCE_NODE_ID);
    }

    #[test]
    fn test_source_hint() {
        let src = IpAddr::V6(fabric_ula(FABRIC, 5, 0x77));
        assert_eq!(source_node_id_hint(&src), Some(0x77));
        assert_eq!(source_node_id_hint(&"fe80::1".parse().unwrap()), None);
        assert_eq!(source_node_id_hint(&"10.1.1.1".parse().unwrap()), None);
    }
}
