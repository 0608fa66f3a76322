//! HA supervisor.
//!
//! Watches per-node liveness leases. A node whose lease has been expired
//! for the fencing window, while at least one peer in its cluster is still
//! fresh, is fenced: marked FAILED and its VMs restarted on survivors in
//! priority order. A fenced node that comes back is reconciled against the
//! store (control plane wins) before it is readmitted.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::controller::Ctx;
use crate::eventbus::requeue_capacity_waiters;
use crate::model::{NodeData, NodeState, VmData, VmState};
use crate::scheduler::{ScheduleRequest, schedule};
use crate::store::kv::KvStore;
use crate::store::{Result, StoreError};

/// Store key of a node's liveness lease, renewed by its heartbeat path.
pub fn alive_lease_key(node_id: &str) -> String {
    format!("node/{node_id}/alive")
}

#[derive(Debug, Clone)]
pub struct HaConfig {
    /// Liveness lease TTL the heartbeat path renews.
    pub t_alive: Duration,
    /// How long past expiry before fencing may fire.
    pub t_fence: Duration,
    pub check_interval: Duration,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            t_alive: Duration::from_secs(10),
            t_fence: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }
}

pub struct HaSupervisor {
    ctx: Ctx,
    kv: Arc<dyn KvStore>,
    cfg: HaConfig,
}

impl HaSupervisor {
    pub fn new(ctx: Ctx, kv: Arc<dyn KvStore>, cfg: HaConfig) -> Self {
        Self { ctx, kv, cfg }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if self.ctx.leader.borrow().is_leading() {
                if let Err(e) = self.pass().await {
                    warn!("ha pass failed: {e}");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn pass(&self) -> Result<()> {
        let nodes = self.ctx.regs.nodes.list(None, None).await?;

        for node in &nodes {
            match node.status.state {
                NodeState::Ready | NodeState::Draining => {
                    if self.lease_dead_for(&node.meta.id, self.cfg.t_fence).await?
                        && self.peer_is_fresh(&nodes, node).await?
                    {
                        self.fence(node).await?;
                    } else if self.lease_dead_for(&node.meta.id, Duration::ZERO).await? {
                        // Silent but inside the fencing window: OFFLINE. Its
                        // VMs freeze with node_lost until fencing decides.
                        self.ctx
                            .nodes()
                            .patch_status(&node.meta.project_id, &node.meta.id, |n| {
                                n.status.state = NodeState::Offline;
                                Ok(())
                            })
                            .await?;
                    }
                }
                NodeState::Offline => {
                    // The heartbeat path lifts OFFLINE back to READY; here
                    // only the fencing clock keeps running.
                    if self.lease_dead_for(&node.meta.id, self.cfg.t_fence).await?
                        && self.peer_is_fresh(&nodes, node).await?
                    {
                        self.fence(node).await?;
                    }
                }
                NodeState::Failed => {
                    if self.lease_fresh(&node.meta.id).await? {
                        self.readmit(node).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn lease_dead_for(&self, node_id: &str, window: Duration) -> Result<bool> {
        match self.kv.lease_info(&alive_lease_key(node_id)).await? {
            Some(info) => Ok(info.expired_for.map(|d| d >= window).unwrap_or(false)),
            // No lease was ever written; the registration path creates it,
            // so a missing lease on a READY node counts as silence.
            None => Ok(true),
        }
    }

    async fn lease_fresh(&self, node_id: &str) -> Result<bool> {
        match self.kv.lease_info(&alive_lease_key(node_id)).await? {
            Some(info) => Ok(info.expires_in.is_some()),
            None => Ok(false),
        }
    }

    /// Lease expiry alone is not enough: a partition between the control
    /// plane and the whole fleet must not fence everyone. Require at least
    /// one other node of the same cluster to be demonstrably alive.
    async fn peer_is_fresh(&self, nodes: &[NodeData], suspect: &NodeData) -> Result<bool> {
        for node in nodes {
            if node.meta.id == suspect.meta.id {
                continue;
            }
            if node.spec.cluster_id != suspect.spec.cluster_id {
                continue;
            }
            if self.lease_fresh(&node.meta.id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn fence(&self, node: &NodeData) -> Result<()> {
        warn!(node = %node.meta.id, name = %node.meta.name, "fencing: liveness lost");
        self.ctx
            .nodes()
            .patch_status(&node.meta.project_id, &node.meta.id, |n| {
                n.status.state = NodeState::Failed;
                n.status.error_message =
                    Some("liveness lease expired beyond fencing window".to_string());
                Ok(())
            })
            .await?;

        // Drop the cached connection; anything using it now fails fast.
        self.ctx.pool.remove(&node.meta.id).await;

        self.restart_vms_of(&node.meta.id).await
    }

    /// Restart the failed node's VMs on survivors, highest priority first.
    async fn restart_vms_of(&self, failed_node: &str) -> Result<()> {
        let mut victims: Vec<VmData> = self
            .ctx
            .regs
            .vms
            .list(None, None)
            .await?
            .into_iter()
            .filter(|vm| vm.status.node_id.as_deref() == Some(failed_node))
            .collect();
        victims.sort_by(|a, b| b.spec.ha_restart_priority.cmp(&a.spec.ha_restart_priority));

        let exclude = vec![failed_node.to_string()];
        for vm in victims {
            let placed = self.place_excluding(&vm, &exclude).await?;
            match placed {
                Some(node_id) => {
                    info!(vm = %vm.meta.id, node = %node_id, "ha restart");
                    self.ctx
                        .vms()
                        .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                            v.status.node_id = Some(node_id.clone());
                            v.status.state = VmState::Creating;
                            v.status.node_lost = false;
                            v.status.reason = None;
                            v.status.error_message = None;
                            Ok(())
                        })
                        .await?;
                }
                None => {
                    warn!(vm = %vm.meta.id, "ha restart: no capacity");
                    self.ctx
                        .vms()
                        .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                            v.status.node_id = None;
                            v.status.state = VmState::Error;
                            v.status.node_lost = false;
                            v.status.reason = Some("no_capacity".to_string());
                            v.status.error_message = Some(format!(
                                "host {failed_node} failed and no survivor has capacity"
                            ));
                            Ok(())
                        })
                        .await?;
                }
            }
            self.ctx.queues.vm.add(&vm.meta.id);
        }
        Ok(())
    }

    async fn place_excluding(&self, vm: &VmData, exclude: &[String]) -> Result<Option<String>> {
        let regs = &self.ctx.regs;
        let nodes = regs.nodes.list(None, None).await?;
        let vms = regs.vms.list(None, None).await?;
        let pools = regs.pools.list(None, None).await?;
        let volumes = regs.volumes.list(None, None).await?;
        let ports = regs.ports.list(None, None).await?;
        let clusters = regs.clusters.list(None, None).await?;
        let request = ScheduleRequest {
            vm,
            nodes: &nodes,
            vms: &vms,
            pools: &pools,
            volumes: &volumes,
            ports: &ports,
            cluster: clusters.first(),
            default_policy: self.ctx.cfg.default_policy,
            exclude_nodes: exclude,
        };
        Ok(schedule(&request).ok().map(|r| r.node_id))
    }

    /// A fenced node is heartbeating again. The store is authoritative: any
    /// domain still running locally that the store no longer maps there is
    /// stopped and undefined before the node is readmitted.
    async fn readmit(&self, node: &NodeData) -> Result<()> {
        info!(node = %node.meta.id, "failed node is back; resolving split-brain");
        let daemon = match self.ctx.pool.daemon(node).await {
            Ok(d) => d,
            Err(e) => return Err(e),
        };
        let local = daemon.list_vms().await.map_err(StoreError::from)?;
        let vms = self.ctx.regs.vms.list(None, None).await?;

        for domain in local {
            let mapped_here = vms.iter().any(|vm| {
                vm.meta.id == domain.vm_id
                    && vm.status.node_id.as_deref() == Some(node.meta.id.as_str())
            });
            if !mapped_here {
                warn!(node = %node.meta.id, vm = %domain.vm_id, "stopping stray domain");
                let op = crate::nodeclient::OpCtx::new(
                    format!("{}:split-brain:{}", domain.vm_id, node.meta.id),
                    self.ctx.cfg.rpc_timeout,
                );
                if let Err(e) = daemon.force_stop_vm(&op, &domain.vm_id).await {
                    if !e.is_not_found() {
                        return Err(e.into());
                    }
                }
                if let Err(e) = daemon.delete_vm(&op, &domain.vm_id).await {
                    if !e.is_not_found() {
                        return Err(e.into());
                    }
                }
            }
        }

        self.ctx
            .nodes()
            .patch_status(&node.meta.project_id, &node.meta.id, |n| {
                n.status.state = NodeState::Ready;
                n.status.error_message = None;
                Ok(())
            })
            .await?;

        // New capacity: wake anything parked on no_capacity.
        requeue_capacity_waiters(&self.ctx.regs, &self.ctx.queues).await;
        Ok(())
    }
}
