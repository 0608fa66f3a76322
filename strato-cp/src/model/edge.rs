//! Network-edge objects: floating IPs, load balancers, VPN services.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Meta, impl_resource};

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FloatingIpData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: FloatingIpSpec,
    #[serde(default)]
    pub status: FloatingIpStatus,
}

impl_resource!(FloatingIpData, "floating-ip", validate = validate_fip);

fn validate_fip(fip: &FloatingIpData) -> Result<(), String> {
    if fip.spec.network_id.is_empty() {
        return Err("network_id is required".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FloatingIpSpec {
    /// External network the address is allocated from.
    pub network_id: String,
    /// Internal port the address forwards to, once associated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    /// Requested address; allocated from the network pools when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct FloatingIpStatus {
    #[serde(default)]
    pub phase: super::NetworkPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// =============================================================================
// Load balancers
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: LoadBalancerSpec,
    #[serde(default)]
    pub status: LoadBalancerStatus,
}

impl_resource!(LoadBalancerData, "load-balancer", validate = validate_lb);

fn validate_lb(lb: &LoadBalancerData) -> Result<(), String> {
    if lb.spec.network_id.is_empty() {
        return Err("network_id is required".to_string());
    }
    for l in &lb.spec.listeners {
        if l.port == 0 {
            return Err("listener port must be > 0".to_string());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerSpec {
    pub network_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip: Option<String>,
    #[serde(default)]
    pub listeners: Vec<LbListener>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LbListener {
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    /// Backend port ids traffic is spread over.
    #[serde(default)]
    pub member_port_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub phase: super::NetworkPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip: Option<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// =============================================================================
// VPN services (stored kind; no controller)
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VpnServiceData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: VpnServiceSpec,
    #[serde(default)]
    pub status: VpnServiceStatus,
}

impl_resource!(VpnServiceData, "vpn-service");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VpnServiceSpec {
    pub network_id: String,
    pub peer_address: String,
    #[serde(default)]
    pub peer_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VpnServiceStatus {
    #[serde(default)]
    pub phase: super::NetworkPhase,
}
