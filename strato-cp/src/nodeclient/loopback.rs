//! In-process node daemon.
//!
//! Backs `--dev` mode and the integration tests: a fake hypervisor with the
//! full [`NodeDaemon`] surface, an op-id dedup window, and an event stream.
//! A [`LoopbackFabric`] groups the daemons of one simulated fleet so live
//! migration can move a domain record between hosts.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::model::MigrationPhase;

use super::pool::DaemonConnector;
use super::{
    DiskAttachment, DomainPowerState, DomainSpec, DomainState, ExecResult, MetricsSample,
    MigrationTick, NicAttachment, NodeDaemon, NodeDaemonEvent, NodeInfo, OpCtx, PortParams,
    RpcError, RpcResult, SnapshotInfo, VolumeParams,
};

/// Completed operations remembered for retry dedup.
const OP_WINDOW: usize = 1024;

struct DomainRecord {
    spec: DomainSpec,
    state: DomainPowerState,
    ip_address: Option<String>,
}

struct Inner {
    domains: HashMap<String, DomainRecord>,
    volumes: HashMap<String, VolumeParams>,
    snapshots: HashSet<(String, String)>,
    pools: HashSet<String>,
    networks: HashSet<String>,
    ports: HashMap<String, PortParams>,
    quiesced: HashSet<String>,
    applied_ops: LruCache<String, ()>,
    subscribers: Vec<mpsc::Sender<NodeDaemonEvent>>,
    unreachable: bool,
    guest_agent_available: bool,
    next_ip: u32,
}

/// Fake hypervisor host.
pub struct LoopbackDaemon {
    node_name: String,
    info: NodeInfo,
    inner: Mutex<Inner>,
    fabric: Mutex<Option<Weak<LoopbackFabric>>>,
}

impl LoopbackDaemon {
    pub fn new(node_name: &str, info: NodeInfo) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.to_string(),
            info,
            inner: Mutex::new(Inner {
                domains: HashMap::new(),
                volumes: HashMap::new(),
                snapshots: HashSet::new(),
                pools: HashSet::new(),
                networks: HashSet::new(),
                ports: HashMap::new(),
                quiesced: HashSet::new(),
                applied_ops: LruCache::new(NonZeroUsize::new(OP_WINDOW).expect("nonzero")),
                subscribers: Vec::new(),
                unreachable: false,
                guest_agent_available: true,
                next_ip: 10,
            }),
            fabric: Mutex::new(None),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn emit(inner: &mut Inner, event: NodeDaemonEvent) {
        inner.subscribers.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    fn check_reachable(inner: &Inner, node: &str) -> RpcResult<()> {
        if inner.unreachable {
            Err(RpcError::unavailable(format!("node {node} unreachable")))
        } else {
            Ok(())
        }
    }

    /// Run `f` once per op id; replays return the first outcome's success.
    fn apply_op<F>(&self, op: &OpCtx, f: F) -> RpcResult<()>
    where
        F: FnOnce(&mut Inner) -> RpcResult<()>,
    {
        let mut inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        if inner.applied_ops.contains(&op.op_id) {
            return Ok(());
        }
        f(&mut inner)?;
        inner.applied_ops.put(op.op_id.clone(), ());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Test and dev-mode controls
    // ------------------------------------------------------------------

    /// Simulate a network partition or daemon death.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().expect("daemon lock").unreachable = unreachable;
    }

    pub fn is_unreachable(&self) -> bool {
        self.inner.lock().expect("daemon lock").unreachable
    }

    pub fn set_guest_agent_available(&self, available: bool) {
        self.inner.lock().expect("daemon lock").guest_agent_available = available;
    }

    /// Crash a running domain and emit the crash event.
    pub fn crash_vm(&self, vm_id: &str) {
        let mut inner = self.inner.lock().expect("daemon lock");
        if let Some(rec) = inner.domains.get_mut(vm_id) {
            rec.state = DomainPowerState::Crashed;
            Self::emit(
                &mut inner,
                NodeDaemonEvent::VmCrashed {
                    vm_id: vm_id.to_string(),
                },
            );
        }
    }

    /// Number of applied (non-deduplicated) operations; used by tests to
    /// assert exactly-once effects.
    pub fn domain_count(&self) -> usize {
        self.inner.lock().expect("daemon lock").domains.len()
    }

    pub fn has_domain(&self, vm_id: &str) -> bool {
        self.inner.lock().expect("daemon lock").domains.contains_key(vm_id)
    }
}

#[async_trait]
impl NodeDaemon for LoopbackDaemon {
    async fn create_vm(&self, op: &OpCtx, spec: &DomainSpec) -> RpcResult<()> {
        let spec = spec.clone();
        self.apply_op(op, move |inner| {
            inner
                .domains
                .entry(spec.vm_id.clone())
                .or_insert(DomainRecord {
                    spec,
                    state: DomainPowerState::Stopped,
                    ip_address: None,
                });
            Ok(())
        })
    }

    async fn start_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            let ip = {
                let next = inner.next_ip;
                inner.next_ip += 1;
                format!("192.0.2.{next}")
            };
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            rec.state = DomainPowerState::Running;
            if rec.ip_address.is_none() {
                rec.ip_address = Some(ip);
            }
            Self::emit(
                inner,
                NodeDaemonEvent::VmState {
                    vm_id,
                    state: DomainPowerState::Running,
                },
            );
            Ok(())
        })
    }

    async fn stop_vm(
        &self,
        op: &OpCtx,
        vm_id: &str,
        _graceful: bool,
        _timeout: Duration,
    ) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            rec.state = DomainPowerState::Stopped;
            Self::emit(
                inner,
                NodeDaemonEvent::VmState {
                    vm_id,
                    state: DomainPowerState::Stopped,
                },
            );
            Ok(())
        })
    }

    async fn force_stop_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        self.stop_vm(op, vm_id, false, Duration::ZERO).await
    }

    async fn reboot_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            rec.state = DomainPowerState::Running;
            Self::emit(
                inner,
                NodeDaemonEvent::VmState {
                    vm_id,
                    state: DomainPowerState::Running,
                },
            );
            Ok(())
        })
    }

    async fn pause_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            rec.state = DomainPowerState::Paused;
            Ok(())
        })
    }

    async fn resume_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            rec.state = DomainPowerState::Running;
            Ok(())
        })
    }

    async fn delete_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            inner.domains.remove(&vm_id);
            inner.quiesced.remove(&vm_id);
            Ok(())
        })
    }

    async fn get_vm_status(&self, vm_id: &str) -> RpcResult<Option<DomainState>> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        Ok(inner.domains.get(vm_id).map(|rec| DomainState {
            vm_id: vm_id.to_string(),
            state: rec.state,
            ip_address: rec.ip_address.clone(),
        }))
    }

    async fn list_vms(&self) -> RpcResult<Vec<DomainState>> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        Ok(inner
            .domains
            .iter()
            .map(|(id, rec)| DomainState {
                vm_id: id.clone(),
                state: rec.state,
                ip_address: rec.ip_address.clone(),
            })
            .collect())
    }

    async fn get_console(&self, vm_id: &str) -> RpcResult<String> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        if inner.domains.contains_key(vm_id) {
            Ok(format!("vnc://{}/{vm_id}", self.node_name))
        } else {
            Err(RpcError::not_found(format!("domain {vm_id} not defined")))
        }
    }

    async fn create_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let key = (volume_id.to_string(), snapshot_id.to_string());
        self.apply_op(op, move |inner| {
            inner.snapshots.insert(key);
            Ok(())
        })
    }

    async fn revert_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let key = (volume_id.to_string(), snapshot_id.to_string());
        self.apply_op(op, move |inner| {
            if inner.snapshots.contains(&key) {
                Ok(())
            } else {
                Err(RpcError::not_found(format!("snapshot {} missing", key.1)))
            }
        })
    }

    async fn delete_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let key = (volume_id.to_string(), snapshot_id.to_string());
        self.apply_op(op, move |inner| {
            inner.snapshots.remove(&key);
            Ok(())
        })
    }

    async fn list_snapshots(&self, volume_id: &str) -> RpcResult<Vec<SnapshotInfo>> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        Ok(inner
            .snapshots
            .iter()
            .filter(|(vol, _)| vol == volume_id)
            .map(|(vol, snap)| SnapshotInfo {
                snapshot_id: snap.clone(),
                volume_id: vol.clone(),
                size_bytes: 0,
            })
            .collect())
    }

    async fn attach_disk(&self, op: &OpCtx, vm_id: &str, disk: &DiskAttachment) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        let disk = disk.clone();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            if !rec.spec.disks.iter().any(|d| d.volume_id == disk.volume_id) {
                rec.spec.disks.push(disk);
            }
            Ok(())
        })
    }

    async fn detach_disk(&self, op: &OpCtx, vm_id: &str, volume_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        let volume_id = volume_id.to_string();
        self.apply_op(op, move |inner| {
            if let Some(rec) = inner.domains.get_mut(&vm_id) {
                rec.spec.disks.retain(|d| d.volume_id != volume_id);
            }
            Ok(())
        })
    }

    async fn attach_nic(&self, op: &OpCtx, vm_id: &str, nic: &NicAttachment) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        let nic = nic.clone();
        self.apply_op(op, move |inner| {
            let rec = inner
                .domains
                .get_mut(&vm_id)
                .ok_or_else(|| RpcError::not_found(format!("domain {vm_id} not defined")))?;
            if !rec.spec.nics.iter().any(|n| n.port_id == nic.port_id) {
                rec.spec.nics.push(nic);
            }
            Ok(())
        })
    }

    async fn detach_nic(&self, op: &OpCtx, vm_id: &str, port_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        let port_id = port_id.to_string();
        self.apply_op(op, move |inner| {
            if let Some(rec) = inner.domains.get_mut(&vm_id) {
                rec.spec.nics.retain(|n| n.port_id != port_id);
            }
            Ok(())
        })
    }

    async fn migrate_vm(
        &self,
        op: &OpCtx,
        vm_id: &str,
        target_uri: &str,
    ) -> RpcResult<mpsc::Receiver<MigrationTick>> {
        let fabric = self
            .fabric
            .lock()
            .expect("fabric lock")
            .as_ref()
            .and_then(|w| w.upgrade());
        let target = fabric.and_then(|f| f.daemon(target_uri));

        // Perform the move up front; the stream reports the phases. Take the
        // record out without holding both host locks at once.
        let moved = {
            let mut inner = self.inner.lock().expect("daemon lock");
            Self::check_reachable(&inner, &self.node_name)?;
            if inner.applied_ops.contains(&op.op_id) {
                None // replayed op: the record already moved
            } else {
                if !inner.domains.contains_key(vm_id) {
                    return Err(RpcError::not_found(format!("domain {vm_id} not defined")));
                }
                if target.is_none() {
                    return Err(RpcError::unavailable(format!(
                        "migration target {target_uri} unreachable"
                    )));
                }
                inner.applied_ops.put(op.op_id.clone(), ());
                inner.domains.remove(vm_id)
            }
        };
        if let (Some(rec), Some(target)) = (moved, &target) {
            target
                .inner
                .lock()
                .expect("daemon lock")
                .domains
                .insert(vm_id.to_string(), rec);
        }

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for (phase, percent) in [
                (MigrationPhase::Preparing, 0),
                (MigrationPhase::Transferring, 50),
                (MigrationPhase::Switchover, 90),
                (MigrationPhase::Completed, 100),
            ] {
                if tx
                    .send(MigrationTick {
                        phase,
                        percent,
                        message: None,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn ensure_pool(&self, op: &OpCtx, pool_id: &str, _backend_json: &str) -> RpcResult<()> {
        let pool_id = pool_id.to_string();
        self.apply_op(op, move |inner| {
            inner.pools.insert(pool_id);
            Ok(())
        })
    }

    async fn tear_down_pool(&self, op: &OpCtx, pool_id: &str) -> RpcResult<()> {
        let pool_id = pool_id.to_string();
        self.apply_op(op, move |inner| {
            inner.pools.remove(&pool_id);
            Ok(())
        })
    }

    async fn create_volume(&self, op: &OpCtx, params: &VolumeParams) -> RpcResult<()> {
        let params = params.clone();
        self.apply_op(op, move |inner| {
            inner.volumes.insert(params.volume_id.clone(), params);
            Ok(())
        })
    }

    async fn delete_volume(&self, op: &OpCtx, volume_id: &str, _pool_id: &str) -> RpcResult<()> {
        let volume_id = volume_id.to_string();
        self.apply_op(op, move |inner| {
            inner.volumes.remove(&volume_id);
            Ok(())
        })
    }

    async fn resize_volume(
        &self,
        op: &OpCtx,
        volume_id: &str,
        _pool_id: &str,
        size_gib: u64,
    ) -> RpcResult<()> {
        let volume_id = volume_id.to_string();
        self.apply_op(op, move |inner| {
            let vol = inner
                .volumes
                .get_mut(&volume_id)
                .ok_or_else(|| RpcError::not_found(format!("volume {volume_id} missing")))?;
            vol.size_gib = size_gib;
            Ok(())
        })
    }

    async fn ensure_network(
        &self,
        op: &OpCtx,
        network_id: &str,
        _kind: &str,
        _segment: u32,
    ) -> RpcResult<()> {
        let network_id = network_id.to_string();
        self.apply_op(op, move |inner| {
            inner.networks.insert(network_id);
            Ok(())
        })
    }

    async fn tear_down_network(&self, op: &OpCtx, network_id: &str) -> RpcResult<()> {
        let network_id = network_id.to_string();
        self.apply_op(op, move |inner| {
            inner.networks.remove(&network_id);
            Ok(())
        })
    }

    async fn create_port(&self, op: &OpCtx, params: &PortParams) -> RpcResult<()> {
        let params = params.clone();
        self.apply_op(op, move |inner| {
            let port_id = params.port_id.clone();
            inner.ports.insert(port_id.clone(), params);
            // Link comes up as soon as the logical switch port exists.
            Self::emit(inner, NodeDaemonEvent::PortLinkUp { port_id });
            Ok(())
        })
    }

    async fn delete_port(&self, op: &OpCtx, port_id: &str) -> RpcResult<()> {
        let port_id = port_id.to_string();
        self.apply_op(op, move |inner| {
            inner.ports.remove(&port_id);
            Ok(())
        })
    }

    async fn get_node_info(&self) -> RpcResult<NodeInfo> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        Ok(self.info.clone())
    }

    async fn stream_metrics(&self) -> RpcResult<mpsc::Receiver<MetricsSample>> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn stream_events(&self) -> RpcResult<mpsc::Receiver<NodeDaemonEvent>> {
        let mut inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        let (tx, rx) = mpsc::channel(64);
        inner.subscribers.push(tx);
        Ok(rx)
    }

    async fn quiesce_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            if !inner.guest_agent_available {
                return Err(RpcError::failed("guest agent not reachable"));
            }
            if !inner.domains.contains_key(&vm_id) {
                return Err(RpcError::not_found(format!("domain {vm_id} not defined")));
            }
            inner.quiesced.insert(vm_id);
            Ok(())
        })
    }

    async fn thaw_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            inner.quiesced.remove(&vm_id);
            Ok(())
        })
    }

    async fn sync_guest_time(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let vm_id = vm_id.to_string();
        self.apply_op(op, move |inner| {
            if !inner.guest_agent_available {
                return Err(RpcError::failed("guest agent not reachable"));
            }
            if !inner.domains.contains_key(&vm_id) {
                return Err(RpcError::not_found(format!("domain {vm_id} not defined")));
            }
            Ok(())
        })
    }

    async fn exec_in_guest(
        &self,
        _op: &OpCtx,
        vm_id: &str,
        _path: &str,
        _args: &[String],
    ) -> RpcResult<ExecResult> {
        let inner = self.inner.lock().expect("daemon lock");
        Self::check_reachable(&inner, &self.node_name)?;
        if !inner.guest_agent_available {
            return Err(RpcError::failed("guest agent not reachable"));
        }
        if !inner.domains.contains_key(vm_id) {
            return Err(RpcError::not_found(format!("domain {vm_id} not defined")));
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// A simulated fleet of loopback hosts.
#[derive(Default)]
pub struct LoopbackFabric {
    daemons: Mutex<HashMap<String, Arc<LoopbackDaemon>>>,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, daemon: Arc<LoopbackDaemon>) {
        *daemon.fabric.lock().expect("fabric lock") = Some(Arc::downgrade(self));
        self.daemons
            .lock()
            .expect("fabric lock")
            .insert(daemon.node_name.clone(), daemon);
    }

    /// Look up by node name (dev mode keys hosts by name, ids are assigned
    /// at registration).
    pub fn daemon(&self, node_name: &str) -> Option<Arc<LoopbackDaemon>> {
        self.daemons.lock().expect("fabric lock").get(node_name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.daemons.lock().expect("fabric lock").keys().cloned().collect()
    }
}

/// Connector handing out in-process daemons, keyed by node name.
pub struct LoopbackConnector {
    pub fabric: Arc<LoopbackFabric>,
}

#[async_trait]
impl DaemonConnector for LoopbackConnector {
    async fn connect(
        &self,
        node: &crate::model::NodeData,
    ) -> RpcResult<Arc<dyn NodeDaemon>> {
        self.fabric
            .daemon(&node.meta.name)
            .map(|d| d as Arc<dyn NodeDaemon>)
            .ok_or_else(|| RpcError::unavailable(format!("no loopback host {}", node.meta.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> NodeInfo {
        NodeInfo {
            hostname: "h1".to_string(),
            cpu_cores: 8,
            memory_mib: 16384,
            disk_gib: 500,
            numa_nodes: 1,
            sriov_vfs: 0,
        }
    }

    fn op(id: &str) -> OpCtx {
        OpCtx::new(id, Duration::from_secs(5))
    }

    fn domain(vm_id: &str) -> DomainSpec {
        DomainSpec {
            vm_id: vm_id.to_string(),
            name: vm_id.to_string(),
            cpu_cores: 2,
            memory_mib: 2048,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_op_id_dedup_makes_retry_a_noop() {
        let daemon = LoopbackDaemon::new("n1", info());
        daemon.create_vm(&op("create-1"), &domain("vm-1")).await.unwrap();
        daemon.start_vm(&op("start-1"), "vm-1").await.unwrap();

        // Replay of the same stop op is applied once.
        daemon
            .stop_vm(&op("stop-1"), "vm-1", true, Duration::from_secs(5))
            .await
            .unwrap();
        daemon.start_vm(&op("start-2"), "vm-1").await.unwrap();
        daemon
            .stop_vm(&op("stop-1"), "vm-1", true, Duration::from_secs(5))
            .await
            .unwrap();

        // The replayed stop did not stop the restarted VM.
        let state = daemon.get_vm_status("vm-1").await.unwrap().unwrap();
        assert_eq!(state.state, DomainPowerState::Running);
    }

    #[tokio::test]
    async fn test_unreachable_returns_retryable() {
        let daemon = LoopbackDaemon::new("n1", info());
        daemon.set_unreachable(true);
        let err = daemon.create_vm(&op("c"), &domain("vm-1")).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_events_stream_on_state_change() {
        let daemon = LoopbackDaemon::new("n1", info());
        let mut events = daemon.stream_events().await.unwrap();
        daemon.create_vm(&op("c"), &domain("vm-1")).await.unwrap();
        daemon.start_vm(&op("s"), "vm-1").await.unwrap();

        match events.recv().await.unwrap() {
            NodeDaemonEvent::VmState { vm_id, state } => {
                assert_eq!(vm_id, "vm-1");
                assert_eq!(state, DomainPowerState::Running);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_migration_moves_domain() {
        let fabric = LoopbackFabric::new();
        let src = LoopbackDaemon::new("n1", info());
        let dst = LoopbackDaemon::new("n2", info());
        fabric.register(src.clone());
        fabric.register(dst.clone());

        src.create_vm(&op("c"), &domain("vm-1")).await.unwrap();
        src.start_vm(&op("s"), "vm-1").await.unwrap();

        let mut ticks = src.migrate_vm(&op("m"), "vm-1", "n2").await.unwrap();
        let mut last = None;
        while let Some(tick) = ticks.recv().await {
            last = Some(tick.phase);
        }
        assert_eq!(last, Some(MigrationPhase::Completed));
        assert!(!src.has_domain("vm-1"));
        assert!(dst.has_domain("vm-1"));
    }

    #[tokio::test]
    async fn test_quiesce_requires_guest_agent() {
        let daemon = LoopbackDaemon::new("n1", info());
        daemon.create_vm(&op("c"), &domain("vm-1")).await.unwrap();
        daemon.set_guest_agent_available(false);
        let err = daemon.quiesce_filesystems(&op("q"), "vm-1").await.unwrap_err();
        assert!(!err.retryable);

        // Thaw still succeeds so the choreography can always run step 3.
        daemon.thaw_filesystems(&op("t"), "vm-1").await.unwrap();
    }
}
