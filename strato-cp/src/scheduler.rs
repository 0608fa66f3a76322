//! VM placement engine.
//!
//! A pure function over a snapshot: filter out nodes failing hard
//! constraints, score the survivors under the requested policy, pick
//! deterministically. The caller owns binding the result to the VM under
//! CAS and re-runs on conflict.

use std::collections::BTreeMap;

use crate::model::{
    ClusterData, NodeData, NodeState, PortBinding, PortData, SchedulingPolicy, StoragePoolData,
    VmData, VolumeData, labels_match,
};

/// Result of scheduling a VM.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub node_id: String,
    /// Human-readable selection rationale, surfaced in logs.
    pub reason: String,
}

/// Why one node was filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoFitReason {
    Excluded,
    NodeNotReady,
    NodePinMismatch,
    AffinityMismatch,
    AntiAffinity,
    InsufficientCpu,
    InsufficientMemory,
    InsufficientDisk,
    PoolNotReachable,
    NumaUnsatisfiable,
    HaReserveExceeded,
}

impl NoFitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoFitReason::Excluded => "excluded",
            NoFitReason::NodeNotReady => "node_not_ready",
            NoFitReason::NodePinMismatch => "node_pin_mismatch",
            NoFitReason::AffinityMismatch => "affinity_mismatch",
            NoFitReason::AntiAffinity => "anti_affinity",
            NoFitReason::InsufficientCpu => "insufficient_cpu",
            NoFitReason::InsufficientMemory => "insufficient_memory",
            NoFitReason::InsufficientDisk => "insufficient_disk",
            NoFitReason::PoolNotReachable => "pool_not_reachable",
            NoFitReason::NumaUnsatisfiable => "numa_unsatisfiable",
            NoFitReason::HaReserveExceeded => "ha_reserve_exceeded",
        }
    }
}

/// No node survived filtering; one reason per candidate.
#[derive(Debug, Clone)]
pub struct NoFit {
    pub reasons: BTreeMap<String, NoFitReason>,
}

impl std::fmt::Display for NoFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reasons.is_empty() {
            return write!(f, "no candidate nodes");
        }
        let mut first = true;
        for (node, reason) in &self.reasons {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{node}: {}", reason.as_str())?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for NoFit {}

/// Snapshot the scheduler works from, built per call.
pub struct ScheduleRequest<'a> {
    pub vm: &'a VmData,
    pub nodes: &'a [NodeData],
    /// Every VM in the cluster; used for reservations and anti-affinity.
    pub vms: &'a [VmData],
    pub pools: &'a [StoragePoolData],
    pub volumes: &'a [VolumeData],
    pub ports: &'a [PortData],
    pub cluster: Option<&'a ClusterData>,
    pub default_policy: SchedulingPolicy,
    /// Hard-excluded nodes (failed host on HA restart, source on migrate).
    pub exclude_nodes: &'a [String],
}

/// Per-VM resource reservation derived from its spec.
#[derive(Debug, Clone, Copy, Default)]
struct Reservation {
    cpu: u64,
    memory_mib: u64,
    disk_gib: u64,
}

fn reservation(vm: &VmData) -> Reservation {
    Reservation {
        cpu: vm.spec.cpu_cores as u64,
        memory_mib: vm.spec.memory_mib,
        disk_gib: vm.spec.disks.iter().map(|d| d.size_gib).sum(),
    }
}

/// Resources already reserved on a node, excluding the VM being placed.
fn reserved_on(node_id: &str, req: &ScheduleRequest<'_>) -> Reservation {
    let mut total = Reservation::default();
    for vm in req.vms {
        if vm.meta.id == req.vm.meta.id {
            continue;
        }
        if vm.status.node_id.as_deref() == Some(node_id) {
            let r = reservation(vm);
            total.cpu += r.cpu;
            total.memory_mib += r.memory_mib;
            total.disk_gib += r.disk_gib;
        }
    }
    total
}

fn pool_of_disk<'a>(
    disk: &crate::model::DiskSpec,
    req: &'a ScheduleRequest<'_>,
) -> Option<&'a StoragePoolData> {
    let pool_id = match (&disk.volume_id, &disk.pool_id) {
        (Some(vol_id), _) => {
            let vol = req.volumes.iter().find(|v| &v.meta.id == vol_id)?;
            vol.spec.pool_id.clone()
        }
        (None, Some(pool_id)) => pool_id.clone(),
        (None, None) => return None,
    };
    req.pools.iter().find(|p| p.meta.id == pool_id)
}

fn filter(node: &NodeData, req: &ScheduleRequest<'_>) -> Option<NoFitReason> {
    let spec = &req.vm.spec;

    if req.exclude_nodes.iter().any(|id| id == &node.meta.id) {
        return Some(NoFitReason::Excluded);
    }
    if node.status.state != NodeState::Ready {
        return Some(NoFitReason::NodeNotReady);
    }
    if let Some(pin) = &spec.placement.node_id {
        if pin != &node.meta.id && pin != &node.meta.name {
            return Some(NoFitReason::NodePinMismatch);
        }
    }
    if !spec.placement.affinity_labels.is_empty()
        && !labels_match(&node.meta.labels, &spec.placement.affinity_labels)
    {
        return Some(NoFitReason::AffinityMismatch);
    }
    if !spec.placement.anti_affinity_labels.is_empty() {
        let clash = req.vms.iter().any(|vm| {
            vm.meta.id != req.vm.meta.id
                && vm.status.node_id.as_deref() == Some(node.meta.id.as_str())
                && spec
                    .placement
                    .anti_affinity_labels
                    .iter()
                    .any(|(k, v)| vm.meta.labels.get(k) == Some(v))
        });
        if clash {
            return Some(NoFitReason::AntiAffinity);
        }
    }

    // Capacity against reservations of already-placed VMs.
    let used = reserved_on(&node.meta.id, req);
    let want = reservation(req.vm);
    let cap = &node.status.capacity;
    if used.cpu + want.cpu > cap.cpu_cores as u64 {
        return Some(NoFitReason::InsufficientCpu);
    }
    if used.memory_mib + want.memory_mib > cap.memory_mib {
        return Some(NoFitReason::InsufficientMemory);
    }

    // Pool reachability, and local-disk capacity for node-local pools.
    let mut local_disk_gib = 0u64;
    for disk in &spec.disks {
        let Some(pool) = pool_of_disk(disk, req) else {
            return Some(NoFitReason::PoolNotReachable);
        };
        if !pool.spec.assigned_nodes.iter().any(|n| n == &node.meta.id) {
            return Some(NoFitReason::PoolNotReachable);
        }
        if !pool.spec.backend.is_shared() {
            local_disk_gib += disk.size_gib;
        }
    }
    if local_disk_gib > 0 && used.disk_gib + local_disk_gib > cap.disk_gib {
        return Some(NoFitReason::InsufficientDisk);
    }

    // VHOST_USER needs a NUMA-aware host, SR-IOV needs free VFs advertised.
    for nic in &spec.nics {
        let binding = nic
            .port_id
            .as_ref()
            .and_then(|pid| req.ports.iter().find(|p| &p.meta.id == pid))
            .map(|p| p.spec.binding)
            .unwrap_or_default();
        match binding {
            PortBinding::VhostUser if cap.numa_nodes == 0 => {
                return Some(NoFitReason::NumaUnsatisfiable);
            }
            PortBinding::Sriov if cap.sriov_vfs == 0 => {
                return Some(NoFitReason::NumaUnsatisfiable);
            }
            _ => {}
        }
    }

    // HA admission control: post-placement reservations, inflated by the
    // failover factor ceil(N / (N - k)), must still fit the node.
    if let Some(cluster) = req.cluster {
        if cluster.spec.ha_admission_control && cluster.spec.ha_failover_capacity > 0 {
            let k = cluster.spec.ha_failover_capacity as u64;
            let n = req
                .nodes
                .iter()
                .filter(|n| n.status.state == NodeState::Ready)
                .count() as u64;
            if n <= k {
                return Some(NoFitReason::HaReserveExceeded);
            }
            let factor = n.div_ceil(n - k);
            if (used.cpu + want.cpu) * factor > cap.cpu_cores as u64 {
                return Some(NoFitReason::HaReserveExceeded);
            }
            if (used.memory_mib + want.memory_mib) * factor > cap.memory_mib {
                return Some(NoFitReason::HaReserveExceeded);
            }
        }
    }

    None
}

/// Score a surviving node; higher wins.
fn score(node: &NodeData, req: &ScheduleRequest<'_>, policy: SchedulingPolicy) -> u64 {
    let used = reserved_on(&node.meta.id, req);
    let want = reservation(req.vm);
    let cap = &node.status.capacity;

    let free_cpu_pct = if cap.cpu_cores > 0 {
        ((cap.cpu_cores as u64).saturating_sub(used.cpu + want.cpu)) * 100 / cap.cpu_cores as u64
    } else {
        0
    };
    let free_mem_pct = if cap.memory_mib > 0 {
        cap.memory_mib.saturating_sub(used.memory_mib + want.memory_mib) * 100 / cap.memory_mib
    } else {
        0
    };

    match policy {
        // Maximize post-placement headroom on every axis.
        SchedulingPolicy::Balanced => free_cpu_pct + free_mem_pct,
        // Fill occupied hosts first, fullest first.
        SchedulingPolicy::Packed => {
            let occupied = req.vms.iter().any(|vm| {
                vm.meta.id != req.vm.meta.id
                    && vm.status.node_id.as_deref() == Some(node.meta.id.as_str())
            });
            let bonus = if occupied { 1000 } else { 0 };
            bonus + (200 - (free_cpu_pct + free_mem_pct))
        }
    }
}

/// Pick a node for the VM, or explain per node why none fits.
pub fn schedule(req: &ScheduleRequest<'_>) -> Result<ScheduleResult, NoFit> {
    let policy = req
        .vm
        .spec
        .placement
        .policy
        .unwrap_or(req.default_policy);

    let mut reasons = BTreeMap::new();
    let mut survivors = Vec::new();
    for node in req.nodes {
        match filter(node, req) {
            Some(reason) => {
                reasons.insert(node.meta.id.clone(), reason);
            }
            None => survivors.push(node),
        }
    }
    if survivors.is_empty() {
        return Err(NoFit { reasons });
    }

    let vm_count = |node_id: &str| {
        req.vms
            .iter()
            .filter(|vm| vm.status.node_id.as_deref() == Some(node_id))
            .count()
    };

    // Highest score; ties broken by VM count then node id so the pick is
    // stable across replicas looking at the same snapshot.
    let best = survivors
        .into_iter()
        .map(|n| (score(n, req, policy), n))
        .max_by(|(sa, na), (sb, nb)| {
            sa.cmp(sb)
                .then_with(|| vm_count(&nb.meta.id).cmp(&vm_count(&na.meta.id)))
                .then_with(|| nb.meta.id.cmp(&na.meta.id))
        })
        .map(|(_, n)| n)
        .expect("survivors is not empty");

    Ok(ScheduleResult {
        node_id: best.meta.id.clone(),
        reason: format!(
            "selected node {} ({}) under {:?} policy",
            best.meta.id, best.meta.name, policy
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ClusterSpec, DiskSpec, Meta, NodeCapacity, PoolBackend, StoragePoolSpec, VmSpec, VmStatus,
    };
    use std::collections::HashMap;

    fn node(id: &str, cores: u32, mem_mib: u64) -> NodeData {
        NodeData {
            meta: Meta {
                id: id.to_string(),
                name: format!("host-{id}"),
                ..Default::default()
            },
            spec: Default::default(),
            status: crate::model::NodeStatus {
                state: NodeState::Ready,
                capacity: NodeCapacity {
                    cpu_cores: cores,
                    memory_mib: mem_mib,
                    disk_gib: 500,
                    numa_nodes: 2,
                    sriov_vfs: 0,
                },
                ..Default::default()
            },
        }
    }

    fn pool(id: &str, shared: bool, nodes: &[&str]) -> StoragePoolData {
        StoragePoolData {
            meta: Meta {
                id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            },
            spec: StoragePoolSpec {
                backend: if shared {
                    PoolBackend::Nfs {
                        server: "10.0.0.1".to_string(),
                        export: "/srv/vm".to_string(),
                    }
                } else {
                    PoolBackend::Lvm {
                        volume_group: "vg0".to_string(),
                    }
                },
                assigned_nodes: nodes.iter().map(|s| s.to_string()).collect(),
            },
            status: Default::default(),
        }
    }

    fn vm(id: &str, cores: u32, mem_mib: u64, pool_id: &str) -> VmData {
        VmData {
            meta: Meta {
                id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            },
            spec: VmSpec {
                cpu_cores: cores,
                memory_mib: mem_mib,
                disks: vec![DiskSpec {
                    pool_id: Some(pool_id.to_string()),
                    size_gib: 20,
                    ..Default::default()
                }],
                ..Default::default()
            },
            status: VmStatus::default(),
        }
    }

    fn placed(mut v: VmData, node_id: &str) -> VmData {
        v.status.node_id = Some(node_id.to_string());
        v
    }

    struct Fixture {
        nodes: Vec<NodeData>,
        vms: Vec<VmData>,
        pools: Vec<StoragePoolData>,
    }

    impl Fixture {
        fn request<'a>(&'a self, vm: &'a VmData) -> ScheduleRequest<'a> {
            ScheduleRequest {
                vm,
                nodes: &self.nodes,
                vms: &self.vms,
                pools: &self.pools,
                volumes: &[],
                ports: &[],
                cluster: None,
                default_policy: SchedulingPolicy::Balanced,
                exclude_nodes: &[],
            }
        }
    }

    #[test]
    fn test_balanced_prefers_emptier_node() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![placed(vm("busy", 16, 65536, "pool-a"), "n-1")],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-a");
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-2");
    }

    #[test]
    fn test_packed_prefers_occupied_node() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![placed(vm("busy", 4, 8192, "pool-a"), "n-1")],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let mut new_vm = vm("new", 4, 8192, "pool-a");
        new_vm.spec.placement.policy = Some(SchedulingPolicy::Packed);
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-1");
    }

    #[test]
    fn test_filters_not_ready_nodes() {
        let mut off = node("n-1", 32, 131072);
        off.status.state = NodeState::Offline;
        let fix = Fixture {
            nodes: vec![off, node("n-2", 32, 131072)],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-a");
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-2");
    }

    #[test]
    fn test_insufficient_memory_reported() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 4096)],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-a");
        let err = schedule(&fix.request(&new_vm)).unwrap_err();
        assert_eq!(err.reasons["n-1"], NoFitReason::InsufficientMemory);
    }

    #[test]
    fn test_anti_affinity_blocks_and_reports() {
        let mut db = placed(vm("db-0", 2, 4096, "pool-a"), "n-1");
        db.meta.labels.insert("role".to_string(), "db".to_string());

        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072)],
            vms: vec![db],
            pools: vec![pool("pool-a", true, &["n-1"])],
        };
        let mut new_vm = vm("db-1", 2, 4096, "pool-a");
        new_vm
            .spec
            .placement
            .anti_affinity_labels
            .insert("role".to_string(), "db".to_string());

        let err = schedule(&fix.request(&new_vm)).unwrap_err();
        assert_eq!(err.reasons["n-1"], NoFitReason::AntiAffinity);
    }

    #[test]
    fn test_affinity_label_selects_node() {
        let mut ssd = node("n-2", 32, 131072);
        ssd.meta.labels.insert("disk".to_string(), "ssd".to_string());
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), ssd],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let mut new_vm = vm("new", 4, 8192, "pool-a");
        new_vm
            .spec
            .placement
            .affinity_labels
            .insert("disk".to_string(), "ssd".to_string());
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-2");
    }

    #[test]
    fn test_local_pool_restricts_to_assigned_node() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![],
            pools: vec![pool("pool-local", false, &["n-2"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-local");
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-2");
    }

    #[test]
    fn test_node_pin() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let mut new_vm = vm("new", 4, 8192, "pool-a");
        new_vm.spec.placement.node_id = Some("n-1".to_string());
        let result = schedule(&fix.request(&new_vm)).unwrap();
        assert_eq!(result.node_id, "n-1");
    }

    #[test]
    fn test_exclude_nodes() {
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-a");
        let mut req = fix.request(&new_vm);
        let excluded = vec!["n-2".to_string()];
        req.exclude_nodes = &excluded;
        let result = schedule(&req).unwrap();
        assert_eq!(result.node_id, "n-1");
    }

    #[test]
    fn test_ha_admission_reserves_failover_capacity() {
        // Two nodes, tolerate one failure: each node may only be half full.
        let cluster = ClusterData {
            meta: Meta {
                id: "c-1".to_string(),
                ..Default::default()
            },
            spec: ClusterSpec {
                ha_enabled: true,
                ha_admission_control: true,
                ha_failover_capacity: 1,
                ..Default::default()
            },
            status: Default::default(),
        };
        let fix = Fixture {
            nodes: vec![node("n-1", 32, 131072), node("n-2", 32, 131072)],
            vms: vec![placed(vm("busy", 12, 49152, "pool-a"), "n-1")],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };

        // 12 + 8 = 20 cores on n-1 would exceed half of 32; n-2 still fits.
        let new_vm = vm("new", 8, 8192, "pool-a");
        let mut req = fix.request(&new_vm);
        req.cluster = Some(&cluster);
        let result = schedule(&req).unwrap();
        assert_eq!(result.node_id, "n-2");

        // A VM that would overfill every node under the reserve gets NoFit.
        let big = vm("big", 20, 8192, "pool-a");
        let mut req = fix.request(&big);
        req.cluster = Some(&cluster);
        let err = schedule(&req).unwrap_err();
        assert_eq!(err.reasons["n-1"], NoFitReason::HaReserveExceeded);
        assert_eq!(err.reasons["n-2"], NoFitReason::HaReserveExceeded);
    }

    #[test]
    fn test_ha_admission_factor_rounds_up() {
        // Four nodes tolerating one failure: ceil(4/3) = 2, so each node may
        // only be half full even though the exact fraction is 4/3.
        let cluster = ClusterData {
            meta: Meta {
                id: "c-1".to_string(),
                ..Default::default()
            },
            spec: ClusterSpec {
                ha_enabled: true,
                ha_admission_control: true,
                ha_failover_capacity: 1,
                ..Default::default()
            },
            status: Default::default(),
        };
        let fix = Fixture {
            nodes: vec![
                node("n-1", 32, 131072),
                node("n-2", 32, 131072),
                node("n-3", 32, 131072),
                node("n-4", 32, 131072),
            ],
            vms: vec![
                placed(vm("b-1", 5, 1024, "pool-a"), "n-1"),
                placed(vm("b-2", 5, 1024, "pool-a"), "n-2"),
                placed(vm("b-3", 5, 1024, "pool-a"), "n-3"),
                placed(vm("b-4", 5, 1024, "pool-a"), "n-4"),
            ],
            pools: vec![pool("pool-a", true, &["n-1", "n-2", "n-3", "n-4"])],
        };

        // (5 + 12) * 2 = 34 > 32 on every node; the exact fraction 4/3 would
        // have admitted it ((5 + 12) * 4 = 68 <= 32 * 3 = 96).
        let big = vm("big", 12, 1024, "pool-a");
        let mut req = fix.request(&big);
        req.cluster = Some(&cluster);
        let err = schedule(&req).unwrap_err();
        for node_id in ["n-1", "n-2", "n-3", "n-4"] {
            assert_eq!(err.reasons[node_id], NoFitReason::HaReserveExceeded);
        }

        // (5 + 10) * 2 = 30 <= 32 still fits under the rounded-up reserve.
        let ok = vm("ok", 10, 1024, "pool-a");
        let mut req = fix.request(&ok);
        req.cluster = Some(&cluster);
        assert!(schedule(&req).is_ok());
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        // Identical nodes, identical load: lowest node id wins.
        let fix = Fixture {
            nodes: vec![node("n-2", 32, 131072), node("n-1", 32, 131072)],
            vms: vec![],
            pools: vec![pool("pool-a", true, &["n-1", "n-2"])],
        };
        let new_vm = vm("new", 4, 8192, "pool-a");
        for _ in 0..5 {
            let result = schedule(&fix.request(&new_vm)).unwrap();
            assert_eq!(result.node_id, "n-1");
        }
    }
}
