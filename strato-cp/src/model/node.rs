//! Hypervisor host objects.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// A registered hypervisor host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NodeData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl_resource!(NodeData, "node");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NodeSpec {
    /// Daemon RPC endpoint, e.g. `http://10.0.0.12:50051`.
    pub address: String,
    pub cluster_id: String,
    /// Physical identity of the host. Exactly one Node may exist per nonce;
    /// re-registration with the same nonce updates the existing object.
    pub registration_nonce: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NodeStatus {
    #[serde(default)]
    pub state: NodeState,
    #[serde(default)]
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub usage: NodeUsage,
    #[serde(default)]
    pub last_heartbeat: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    #[default]
    Registering,
    Ready,
    Draining,
    Maintenance,
    Offline,
    Failed,
}

impl NodeState {
    /// States in which a node may keep hosting already-placed VMs.
    pub fn hosts_vms(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Draining)
    }
}

/// Advertised capacity, reported at registration and refreshed by heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NodeCapacity {
    pub cpu_cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    #[serde(default)]
    pub numa_nodes: u32,
    #[serde(default)]
    pub sriov_vfs: u32,
}

/// Observed usage from the metrics stream; informational, the scheduler
/// works from reservations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NodeUsage {
    pub cpu_used_cores: f64,
    pub memory_used_mib: u64,
    pub disk_used_gib: u64,
}
