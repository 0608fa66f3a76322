//! Typed client surface to on-host node daemons.
//!
//! Controllers talk to a [`NodeDaemon`] trait object; the tonic-backed
//! implementation lives in [`grpc`], the in-process one used by dev mode and
//! tests in [`loopback`]. Every mutating call carries a client-generated
//! operation ID and must be idempotent under retry: daemons deduplicate by
//! op ID within a bounded window.

pub mod grpc;
pub mod loopback;
pub mod pool;

pub use pool::{DaemonConnector, NodePool};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::model::MigrationPhase;
use crate::store::StoreError;

/// Call context: operation id plus the deadline budget left for the pass.
#[derive(Debug, Clone)]
pub struct OpCtx {
    pub op_id: String,
    pub deadline: Duration,
}

impl OpCtx {
    pub fn new(op_id: impl Into<String>, deadline: Duration) -> Self {
        Self {
            op_id: op_id.into(),
            deadline,
        }
    }
}

/// Stable operation id derived from the object identity and intent, so a
/// retried reconcile (or a successor leader) re-issues the identical op and
/// the daemon's dedup window makes it a no-op.
pub fn derived_op_id(object_id: &str, action: &str, generation: u64) -> String {
    format!("{object_id}:{action}:{generation}")
}

/// Node RPC error model: a code, a retryable flag, and a message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: u32,
    pub retryable: bool,
    pub message: String,
}

impl RpcError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: 14,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: 9,
            retryable: false,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: 5,
            retryable: false,
            message: message.into(),
        }
    }

    /// The daemon reported the target does not exist; teardown paths treat
    /// this as already done.
    pub fn is_not_found(&self) -> bool {
        self.code == 5
    }
}

impl From<RpcError> for StoreError {
    fn from(e: RpcError) -> Self {
        match e.code {
            5 => StoreError::NotFound(e.message),
            14 => StoreError::Unavailable(e.message),
            _ => StoreError::OperationFailed {
                message: e.message,
                retryable: e.retryable,
            },
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Domain definition shipped to the daemon on CreateVm.
#[derive(Debug, Clone, Default)]
pub struct DomainSpec {
    pub vm_id: String,
    pub name: String,
    pub cpu_cores: u32,
    pub memory_mib: u64,
    pub disks: Vec<DiskAttachment>,
    pub nics: Vec<NicAttachment>,
    /// Rendered provisioning payload, opaque to the control plane.
    pub customization: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DiskAttachment {
    pub volume_id: String,
    pub device: String,
    pub readonly: bool,
    pub boot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NicAttachment {
    pub port_id: String,
    pub mac_address: String,
    pub binding: String,
}

/// Power state as the hypervisor reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainPowerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Suspended,
    Crashed,
}

impl DomainPowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainPowerState::Stopped => "stopped",
            DomainPowerState::Starting => "starting",
            DomainPowerState::Running => "running",
            DomainPowerState::Paused => "paused",
            DomainPowerState::Suspended => "suspended",
            DomainPowerState::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(DomainPowerState::Stopped),
            "starting" => Some(DomainPowerState::Starting),
            "running" => Some(DomainPowerState::Running),
            "paused" => Some(DomainPowerState::Paused),
            "suspended" => Some(DomainPowerState::Suspended),
            "crashed" => Some(DomainPowerState::Crashed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DomainState {
    pub vm_id: String,
    pub state: DomainPowerState,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub hostname: String,
    pub cpu_cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub numa_nodes: u32,
    pub sriov_vfs: u32,
}

impl NodeInfo {
    /// Advertised capacity as the Node object carries it.
    pub fn capacity(&self) -> crate::model::NodeCapacity {
        crate::model::NodeCapacity {
            cpu_cores: self.cpu_cores,
            memory_mib: self.memory_mib,
            disk_gib: self.disk_gib,
            numa_nodes: self.numa_nodes,
            sriov_vfs: self.sriov_vfs,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSample {
    pub timestamp_ms: u64,
    pub cpu_used_cores: f64,
    pub memory_used_mib: u64,
    pub disk_used_gib: u64,
}

/// Advisory events streamed from a node; they accelerate reconciliation but
/// are never the source of truth.
#[derive(Debug, Clone)]
pub enum NodeDaemonEvent {
    VmState { vm_id: String, state: DomainPowerState },
    VmCrashed { vm_id: String },
    PortLinkUp { port_id: String },
    PoolDegraded { pool_id: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct MigrationTick {
    pub phase: MigrationPhase,
    pub percent: u32,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub volume_id: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Volume creation parameters shipped to the daemon.
#[derive(Debug, Clone, Default)]
pub struct VolumeParams {
    pub volume_id: String,
    pub pool_id: String,
    pub size_gib: u64,
    pub source_image_id: Option<String>,
    pub source_snapshot_id: Option<String>,
}

/// Port realization parameters: MAC/IPs plus the pre-rendered ACL batch,
/// applied atomically on the SDN.
#[derive(Debug, Clone, Default)]
pub struct PortParams {
    pub port_id: String,
    pub network_id: String,
    pub mac_address: String,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub acl_rules: Vec<String>,
}

/// The full daemon call surface.
#[async_trait]
pub trait NodeDaemon: Send + Sync {
    // VM lifecycle
    async fn create_vm(&self, op: &OpCtx, spec: &DomainSpec) -> RpcResult<()>;
    async fn start_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn stop_vm(&self, op: &OpCtx, vm_id: &str, graceful: bool, timeout: Duration)
    -> RpcResult<()>;
    async fn force_stop_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn reboot_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn pause_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn resume_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn delete_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn get_vm_status(&self, vm_id: &str) -> RpcResult<Option<DomainState>>;
    async fn list_vms(&self) -> RpcResult<Vec<DomainState>>;
    async fn get_console(&self, vm_id: &str) -> RpcResult<String>;

    // Snapshots
    async fn create_snapshot(&self, op: &OpCtx, volume_id: &str, snapshot_id: &str)
    -> RpcResult<()>;
    async fn revert_snapshot(&self, op: &OpCtx, volume_id: &str, snapshot_id: &str)
    -> RpcResult<()>;
    async fn delete_snapshot(&self, op: &OpCtx, volume_id: &str, snapshot_id: &str)
    -> RpcResult<()>;
    async fn list_snapshots(&self, volume_id: &str) -> RpcResult<Vec<SnapshotInfo>>;

    // Hotplug
    async fn attach_disk(&self, op: &OpCtx, vm_id: &str, disk: &DiskAttachment) -> RpcResult<()>;
    async fn detach_disk(&self, op: &OpCtx, vm_id: &str, volume_id: &str) -> RpcResult<()>;
    async fn attach_nic(&self, op: &OpCtx, vm_id: &str, nic: &NicAttachment) -> RpcResult<()>;
    async fn detach_nic(&self, op: &OpCtx, vm_id: &str, port_id: &str) -> RpcResult<()>;

    // Live migration
    async fn migrate_vm(
        &self,
        op: &OpCtx,
        vm_id: &str,
        target_uri: &str,
    ) -> RpcResult<mpsc::Receiver<MigrationTick>>;

    // Storage / network realization
    async fn ensure_pool(&self, op: &OpCtx, pool_id: &str, backend_json: &str) -> RpcResult<()>;
    async fn tear_down_pool(&self, op: &OpCtx, pool_id: &str) -> RpcResult<()>;
    async fn create_volume(&self, op: &OpCtx, params: &VolumeParams) -> RpcResult<()>;
    async fn delete_volume(&self, op: &OpCtx, volume_id: &str, pool_id: &str) -> RpcResult<()>;
    async fn resize_volume(
        &self,
        op: &OpCtx,
        volume_id: &str,
        pool_id: &str,
        size_gib: u64,
    ) -> RpcResult<()>;
    async fn ensure_network(
        &self,
        op: &OpCtx,
        network_id: &str,
        kind: &str,
        segment: u32,
    ) -> RpcResult<()>;
    async fn tear_down_network(&self, op: &OpCtx, network_id: &str) -> RpcResult<()>;
    async fn create_port(&self, op: &OpCtx, params: &PortParams) -> RpcResult<()>;
    async fn delete_port(&self, op: &OpCtx, port_id: &str) -> RpcResult<()>;

    // Introspection and streams
    async fn get_node_info(&self) -> RpcResult<NodeInfo>;
    async fn stream_metrics(&self) -> RpcResult<mpsc::Receiver<MetricsSample>>;
    async fn stream_events(&self) -> RpcResult<mpsc::Receiver<NodeDaemonEvent>>;

    // Guest agent pass-through
    async fn quiesce_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn thaw_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn sync_guest_time(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()>;
    async fn exec_in_guest(
        &self,
        op: &OpCtx,
        vm_id: &str,
        path: &str,
        args: &[String],
    ) -> RpcResult<ExecResult>;
}
