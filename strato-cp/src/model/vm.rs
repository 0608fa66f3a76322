//! Virtual machine objects and the customization template injected at create.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// The central object of the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VmData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: VmSpec,
    #[serde(default)]
    pub status: VmStatus,
}

impl_resource!(VmData, "vm", validate = validate_vm);

fn validate_vm(vm: &VmData) -> Result<(), String> {
    if vm.spec.cpu_cores == 0 {
        return Err("cpu_cores must be > 0".to_string());
    }
    if vm.spec.memory_mib == 0 {
        return Err("memory_mib must be > 0".to_string());
    }
    if vm.spec.disks.is_empty() {
        return Err("at least one disk is required".to_string());
    }
    for d in &vm.spec.disks {
        if d.volume_id.is_none() && d.pool_id.is_none() {
            return Err("disk must name an existing volume_id or a pool_id + size_gib".to_string());
        }
        if d.volume_id.is_none() && d.size_gib == 0 {
            return Err("inline disk must have size_gib > 0".to_string());
        }
    }
    for n in &vm.spec.nics {
        if n.port_id.is_none() && n.network_id.is_none() {
            return Err("nic must name an existing port_id or a network_id".to_string());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub memory_mib: u64,
    /// Disks in attach order; the first is the boot disk.
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub run_state: DesiredRunState,
    #[serde(default)]
    pub placement: PlacementSpec,
    /// Higher restarts first after a host failure.
    #[serde(default)]
    pub ha_restart_priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customization_id: Option<String>,
    /// Reboot when this differs from `status.last_reboot_nonce`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_nonce: Option<String>,
    /// Live-migration request; acted on when the nonce is unseen by status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationRequest>,
}

/// Either a reference to an existing Volume or an inline request the VM
/// controller materializes as a child Volume (thick-provisioned).
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub size_gib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default)]
    pub readonly: bool,
}

/// Either a reference to an existing Port or an inline request materialized
/// as a child Port on the named network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NicSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DesiredRunState {
    #[default]
    Running,
    Stopped,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PlacementSpec {
    /// Pin to a specific node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Node labels that must all match.
    #[serde(default)]
    pub affinity_labels: HashMap<String, String>,
    /// VM labels that must not be present on any VM of a candidate node.
    #[serde(default)]
    pub anti_affinity_labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<SchedulingPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Spread load, maximize free-resource headroom on every host.
    #[default]
    Balanced,
    /// Fill hosts before opening new ones.
    Packed,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MigrationRequest {
    /// Unique per request; status echoes it back when handled.
    pub nonce: String,
    /// Explicit target node, or None for scheduler-chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VmStatus {
    #[serde(default)]
    pub state: VmState,
    /// Bound node. Present from successful placement until the node has
    /// acknowledged the domain is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Set while the bound node is OFFLINE/FAILED and HA has not decided.
    #[serde(default)]
    pub node_lost: bool,
    /// Volume ids the controller created for inline disks, in disk order.
    #[serde(default)]
    pub disk_volume_ids: Vec<String>,
    /// Port ids the controller created for inline nics, in nic order.
    #[serde(default)]
    pub nic_port_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reboot_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationStatus>,
    /// Spec generation this status was computed against.
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VmState {
    #[default]
    Pending,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Paused,
    Suspended,
    Migrating,
    Error,
    Failed,
    Deleting,
}

impl VmState {
    /// States that require the bound node to be READY or DRAINING.
    pub fn requires_live_node(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Starting | VmState::Paused | VmState::Migrating
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MigrationStatus {
    pub nonce: String,
    pub phase: MigrationPhase,
    #[serde(default)]
    pub percent: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Preparing,
    Transferring,
    Switchover,
    Completed,
    Failed,
}

// =============================================================================
// Customization specs
// =============================================================================

/// Provisioning template injected at VM create.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CustomizationSpecData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: CustomizationSpecSpec,
}

impl_resource!(CustomizationSpecData, "customization", validate = validate_customization);

fn validate_customization(c: &CustomizationSpecData) -> Result<(), String> {
    // The sub-spec matching os_type is required.
    match c.spec.os_type {
        OsType::Linux if c.spec.linux.is_none() => {
            Err("linux sub-spec is required for os_type=linux".to_string())
        }
        OsType::Windows if c.spec.windows.is_none() => {
            Err("windows sub-spec is required for os_type=windows".to_string())
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CustomizationSpecSpec {
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<LinuxPrep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowsPrep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct LinuxPrep {
    pub hostname: String,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct WindowsPrep {
    pub computer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;

    fn base_vm() -> VmData {
        let mut vm = VmData::default();
        vm.meta.name = "web-1".to_string();
        vm.spec.cpu_cores = 2;
        vm.spec.memory_mib = 2048;
        vm.spec.disks = vec![DiskSpec {
            pool_id: Some("pool-1".to_string()),
            size_gib: 10,
            ..Default::default()
        }];
        vm
    }

    #[test]
    fn test_vm_validation() {
        assert!(base_vm().validate().is_ok());

        let mut vm = base_vm();
        vm.spec.cpu_cores = 0;
        assert!(vm.validate().is_err());

        let mut vm = base_vm();
        vm.spec.disks.clear();
        assert!(vm.validate().is_err());

        let mut vm = base_vm();
        vm.spec.disks[0].size_gib = 0;
        assert!(vm.validate().is_err());
    }

    #[test]
    fn test_customization_requires_matching_subspec() {
        let mut c = CustomizationSpecData::default();
        c.meta.name = "lin".to_string();
        c.spec.os_type = OsType::Linux;
        assert!(c.validate().is_err());

        c.spec.linux = Some(LinuxPrep {
            hostname: "web".to_string(),
            ..Default::default()
        });
        assert!(c.validate().is_ok());

        c.spec.os_type = OsType::Windows;
        assert!(c.validate().is_err());
    }
}
