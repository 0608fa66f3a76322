//! Storage pools, volumes, snapshots, and images.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// A typed storage backend volumes are carved from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StoragePoolData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: StoragePoolSpec,
    #[serde(default)]
    pub status: StoragePoolStatus,
}

impl_resource!(StoragePoolData, "pool", validate = validate_pool);

fn validate_pool(pool: &StoragePoolData) -> Result<(), String> {
    // Backend is required at creation; the tagged enum makes "unset"
    // unrepresentable, so only per-variant fields need checking.
    match &pool.spec.backend {
        PoolBackend::LocalDir { path } if path.is_empty() => {
            Err("local_dir backend requires a path".to_string())
        }
        PoolBackend::Lvm { volume_group } if volume_group.is_empty() => {
            Err("lvm backend requires a volume_group".to_string())
        }
        PoolBackend::Nfs { server, export } if server.is_empty() || export.is_empty() => {
            Err("nfs backend requires server and export".to_string())
        }
        PoolBackend::CephRbd { monitors, pool: p, .. } if monitors.is_empty() || p.is_empty() => {
            Err("ceph_rbd backend requires monitors and pool".to_string())
        }
        PoolBackend::Iscsi { portal, target } if portal.is_empty() || target.is_empty() => {
            Err("iscsi backend requires portal and target".to_string())
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StoragePoolSpec {
    pub backend: PoolBackend,
    /// Nodes the pool is mounted/realized on. For node-local backends this
    /// is exactly one node; shared backends list every attached node.
    #[serde(default)]
    pub assigned_nodes: Vec<String>,
}

/// Backend selector. Dispatch is on the tag; adding a backend is a new tag
/// plus a config sub-record and a case in the pool controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolBackend {
    LocalDir { path: String },
    Lvm { volume_group: String },
    Nfs { server: String, export: String },
    CephRbd {
        monitors: Vec<String>,
        pool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    Iscsi { portal: String, target: String },
}

impl Default for PoolBackend {
    fn default() -> Self {
        PoolBackend::LocalDir { path: String::new() }
    }
}

impl PoolBackend {
    /// Shared backends are reachable from every node; a prerequisite for
    /// live migration of VMs with disks on the pool.
    pub fn is_shared(&self) -> bool {
        matches!(self, PoolBackend::Nfs { .. } | PoolBackend::CephRbd { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StoragePoolStatus {
    #[serde(default)]
    pub phase: PoolPhase,
    #[serde(default)]
    pub capacity_gib: u64,
    #[serde(default)]
    pub used_gib: u64,
    /// Nodes the backend is confirmed reachable from.
    #[serde(default)]
    pub ready_nodes: Vec<String>,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolPhase {
    #[default]
    Pending,
    Ready,
    Degraded,
    Error,
    Deleting,
}

// =============================================================================
// Volumes
// =============================================================================

/// A virtual disk bound to one pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: VolumeSpec,
    #[serde(default)]
    pub status: VolumeStatus,
}

impl_resource!(VolumeData, "volume", validate = validate_volume);

fn validate_volume(vol: &VolumeData) -> Result<(), String> {
    if vol.spec.pool_id.is_empty() {
        return Err("pool_id is required".to_string());
    }
    if vol.spec.size_gib == 0 {
        return Err("size_gib must be > 0".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeSpec {
    pub pool_id: String,
    pub size_gib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<VolumeSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    Image { image_id: String },
    /// Clone from a snapshot; blocks deletion of the parent snapshot.
    Snapshot { snapshot_id: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,
    /// Non-empty exactly when phase is IN_USE.
    #[serde(default)]
    pub attached_vm_id: String,
    /// Node realizing the volume, for node-local pools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Size as realized on the backend; differs from spec while RESIZING.
    #[serde(default)]
    pub size_gib: u64,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumePhase {
    #[default]
    Pending,
    Creating,
    Ready,
    InUse,
    Resizing,
    Deleting,
    Error,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Point-in-time reference to a parent volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeSnapshotData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: VolumeSnapshotSpec,
    #[serde(default)]
    pub status: VolumeSnapshotStatus,
}

impl_resource!(VolumeSnapshotData, "snapshot", validate = validate_snapshot);

fn validate_snapshot(snap: &VolumeSnapshotData) -> Result<(), String> {
    if snap.spec.volume_id.is_empty() {
        return Err("volume_id is required".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeSnapshotSpec {
    pub volume_id: String,
    /// Refuse rather than fall back to a crash-consistent snapshot when the
    /// guest filesystems cannot be quiesced.
    #[serde(default)]
    pub crash_consistent_forbidden: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct VolumeSnapshotStatus {
    #[serde(default)]
    pub phase: SnapshotPhase,
    /// False when the snapshot was taken without filesystem quiesce.
    #[serde(default)]
    pub consistent: bool,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotPhase {
    #[default]
    Pending,
    Creating,
    Ready,
    Deleting,
    Error,
}

// =============================================================================
// Images
// =============================================================================

/// Bootable template, possibly ingested from an OVA.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ImageData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: ImageSpec,
    #[serde(default)]
    pub status: ImageStatus,
}

impl_resource!(ImageData, "image");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default)]
    pub format: ImageFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Qcow2,
    Raw,
    Ova,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ImageStatus {
    #[serde(default)]
    pub phase: ImagePhase,
    #[serde(default)]
    pub size_gib: u64,
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImagePhase {
    #[default]
    Pending,
    Downloading,
    Converting,
    Ready,
    Error,
}

// =============================================================================
// OVA ingest jobs
// =============================================================================

/// Side table tracking ingest of an OVA file into an Image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OvaUploadJobData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: OvaUploadJobSpec,
    #[serde(default)]
    pub status: OvaUploadJobStatus,
}

impl_resource!(OvaUploadJobData, "ova-upload");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OvaUploadJobSpec {
    pub image_id: String,
    #[serde(default)]
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct OvaUploadJobStatus {
    #[serde(default)]
    pub state: OvaUploadState,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OvaUploadState {
    #[default]
    Pending,
    Uploading,
    Converting,
    Completed,
    Failed,
}
