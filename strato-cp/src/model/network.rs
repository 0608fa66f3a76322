//! Virtual networks, ports, and security groups.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// Overlay or VLAN segment carrying tenant traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VirtualNetworkData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: VirtualNetworkSpec,
    #[serde(default)]
    pub status: VirtualNetworkStatus,
}

impl_resource!(VirtualNetworkData, "network", validate = validate_network);

fn validate_network(net: &VirtualNetworkData) -> Result<(), String> {
    if net.spec.ipv4_cidr.is_none() && net.spec.ipv6_cidr.is_none() {
        return Err("at least one of ipv4_cidr / ipv6_cidr is required".to_string());
    }
    if let Some(cidr) = &net.spec.ipv4_cidr {
        parse_ipv4_cidr(cidr)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VirtualNetworkSpec {
    #[serde(default)]
    pub kind: NetworkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_cidr: Option<String>,
    /// Sub-ranges of the CIDR handed out to ports; empty means the whole
    /// host range minus network/gateway/broadcast.
    #[serde(default)]
    pub allocation_pools: Vec<IpRange>,
    #[serde(default)]
    pub reserved_ips: Vec<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Segment realization. Tagged variant: adding a fabric = new tag + config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkKind {
    /// Geneve overlay; VNI allocated by the controller when 0.
    Overlay {
        #[serde(default)]
        vni: u32,
    },
    Vlan {
        tag: u16,
    },
}

impl Default for NetworkKind {
    fn default() -> Self {
        NetworkKind::Overlay { vni: 0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IpRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VirtualNetworkStatus {
    #[serde(default)]
    pub phase: NetworkPhase,
    /// Realized VNI or VLAN tag; allocated by the controller for overlays
    /// created with vni 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<u32>,
    #[serde(default)]
    pub port_count: u32,
    /// Addresses currently handed out, for observability and allocation.
    #[serde(default)]
    pub allocated_ips: Vec<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkPhase {
    #[default]
    Pending,
    Ready,
    Error,
    Deleting,
}

// =============================================================================
// Ports
// =============================================================================

/// A NIC on a virtual network, optionally bound to a VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PortData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: PortSpec,
    #[serde(default)]
    pub status: PortStatus,
}

impl_resource!(PortData, "port");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PortSpec {
    pub network_id: String,
    /// The VM whose spec.nics references this port, if bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    /// User-provided MAC; allocated when absent. Uniqueness is checked per
    /// network at admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Static IPv4 binding inside the network's allocation pools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ipv4: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub binding: PortBinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PortBinding {
    #[default]
    Virtio,
    VhostUser,
    Sriov,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PortStatus {
    #[serde(default)]
    pub phase: PortPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,
    /// Logical switch port identifier on the SDN.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_port: Option<String>,
    /// Node the switch port is realized on; re-realized when the VM moves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_node_id: Option<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortPhase {
    #[default]
    Pending,
    Build,
    Active,
    Down,
    Error,
}

// =============================================================================
// Security groups
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroupData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: SecurityGroupSpec,
    #[serde(default)]
    pub status: SecurityGroupStatus,
}

impl_resource!(SecurityGroupData, "security-group");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroupSpec {
    /// Connection-tracking firewall when true.
    #[serde(default)]
    pub stateful: bool,
    /// Evaluated in order; first match wins on the data plane.
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroupRule {
    pub direction: RuleDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    #[default]
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct SecurityGroupStatus {
    /// Ports currently referencing this group.
    #[serde(default)]
    pub port_count: u32,
}

// =============================================================================
// IPv4 helpers (allocation works on host-order u32s)
// =============================================================================

/// Parse `a.b.c.d/len` into (network, prefix length).
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(u32, u8), String> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR '{cidr}'"))?;
    let ip: std::net::Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("invalid IPv4 address in '{cidr}'"))?;
    let len: u8 = len.parse().map_err(|_| format!("invalid prefix in '{cidr}'"))?;
    if len > 32 {
        return Err(format!("prefix length {len} out of range"));
    }
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ok((u32::from(ip) & mask, len))
}

pub fn ipv4_to_u32(addr: &str) -> Result<u32, String> {
    let ip: std::net::Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("invalid IPv4 address '{addr}'"))?;
    Ok(u32::from(ip))
}

pub fn u32_to_ipv4(v: u32) -> String {
    std::net::Ipv4Addr::from(v).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_cidr() {
        let (net, len) = parse_ipv4_cidr("10.0.1.0/24").unwrap();
        assert_eq!(u32_to_ipv4(net), "10.0.1.0");
        assert_eq!(len, 24);

        // Host bits are masked off.
        let (net, _) = parse_ipv4_cidr("10.0.1.77/24").unwrap();
        assert_eq!(u32_to_ipv4(net), "10.0.1.0");

        assert!(parse_ipv4_cidr("10.0.1.0").is_err());
        assert!(parse_ipv4_cidr("10.0.1.0/33").is_err());
        assert!(parse_ipv4_cidr("bogus/24").is_err());
    }
}
