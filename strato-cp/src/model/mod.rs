//! Declarative object model.
//!
//! Every managed object is a spec/status pair wrapped in a uniform [`Meta`]
//! envelope. Spec is owned by API writers, status is owned exclusively by
//! controllers; the registry enforces that split at its write surface.

pub mod cluster;
pub mod edge;
pub mod network;
pub mod node;
pub mod storage;
pub mod token;
pub mod vm;

pub use cluster::{ClusterData, ClusterSpec, ClusterStatus, DrsMode, PolicyAction, PolicyRule};
pub use cluster::{ProjectData, ProjectSpec, ProjectStatus, QuotaSpec, QuotaUsage};
pub use edge::{
    FloatingIpData, FloatingIpSpec, FloatingIpStatus, LbListener, LoadBalancerData,
    LoadBalancerSpec, LoadBalancerStatus, VpnServiceData, VpnServiceSpec, VpnServiceStatus,
};
pub use network::{
    IpRange, NetworkKind, NetworkPhase, PortBinding, PortData, PortPhase, PortSpec, PortStatus,
    RuleDirection, SecurityGroupData, SecurityGroupRule, SecurityGroupSpec, SecurityGroupStatus,
    VirtualNetworkData, VirtualNetworkSpec, VirtualNetworkStatus, ipv4_to_u32, parse_ipv4_cidr,
    u32_to_ipv4,
};
pub use node::{NodeCapacity, NodeData, NodeSpec, NodeState, NodeStatus, NodeUsage};
pub use storage::{
    ImageData, ImageFormat, ImagePhase, ImageSpec, ImageStatus, OvaUploadJobData, OvaUploadJobSpec,
    OvaUploadJobStatus, OvaUploadState, PoolBackend, PoolPhase, SnapshotPhase, StoragePoolData,
    StoragePoolSpec, StoragePoolStatus, VolumeData, VolumePhase, VolumeSnapshotData,
    VolumeSnapshotSpec, VolumeSnapshotStatus, VolumeSource, VolumeSpec, VolumeStatus,
};
pub use token::{RegistrationTokenData, RegistrationTokenSpec, RegistrationTokenStatus};
pub use vm::{
    CustomizationSpecData, CustomizationSpecSpec, DesiredRunState, DiskSpec, LinuxPrep,
    MigrationPhase, MigrationRequest, MigrationStatus, NicSpec, OsType, PlacementSpec,
    SchedulingPolicy, VmData, VmSpec, VmState, VmStatus, WindowsPrep,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Uniform object envelope shared by every kind.
///
/// `revision` is assigned by the store and used for compare-and-swap writes;
/// `generation` is bumped by the registry on every spec mutation so
/// controllers can tell "spec changed" from "status changed".
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Meta {
    /// ULID, assigned at create.
    pub id: String,
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
    /// Store revision of the last write to this object.
    #[serde(default)]
    pub revision: u64,
    /// Spec generation; bumped on spec writes only.
    #[serde(default)]
    pub generation: u64,
    /// Two-phase delete marker. Set by the API, acted on by controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

impl Meta {
    /// True once a delete has been requested and teardown is in progress.
    pub fn deleting(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A storable, watchable kind. Implemented by every `*Data` struct.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Store key segment and API path segment for this kind.
    const KIND: &'static str;

    fn meta(&self) -> &Meta;
    fn meta_mut(&mut self) -> &mut Meta;

    /// Syntactic validation of the spec. Referential checks live in the
    /// registry, quota checks in admission.
    fn validate(&self) -> Result<(), String> {
        validate_name(&self.meta().name)
    }
}

/// Wires a `*Data` struct with `meta` / `spec` / `status` fields into the
/// [`Resource`] trait.
macro_rules! impl_resource {
    ($ty:ty, $kind:literal) => {
        impl crate::model::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &crate::model::Meta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut crate::model::Meta {
                &mut self.meta
            }
        }
    };
    ($ty:ty, $kind:literal, validate = $validate:path) => {
        impl crate::model::Resource for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &crate::model::Meta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut crate::model::Meta {
                &mut self.meta
            }

            fn validate(&self) -> Result<(), String> {
                crate::model::validate_name(&self.meta.name)?;
                $validate(self)
            }
        }
    };
}
pub(crate) use impl_resource;

/// Object names: DNS-label-ish, 1..=63 chars, lowercase alphanumeric plus '-'.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 63 {
        return Err(format!("name must be 1..=63 characters, got {}", name.len()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!("name '{name}' must be lowercase alphanumeric or '-'"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!("name '{name}' must not start or end with '-'"));
    }
    Ok(())
}

/// RFC3339 timestamp for envelope fields.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// True when `labels` contains every `(k, v)` pair in `selector`.
pub fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|lv| lv == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("web-1").is_ok());
        assert!(validate_name("a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Caps").is_err());
        assert!(validate_name("-lead").is_err());
        assert!(validate_name("trail-").is_err());
        assert!(validate_name(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_labels_match() {
        let mut labels = HashMap::new();
        labels.insert("role".to_string(), "db".to_string());
        labels.insert("zone".to_string(), "a".to_string());

        let mut sel = HashMap::new();
        sel.insert("role".to_string(), "db".to_string());
        assert!(labels_match(&labels, &sel));

        sel.insert("zone".to_string(), "b".to_string());
        assert!(!labels_match(&labels, &sel));
    }
}
