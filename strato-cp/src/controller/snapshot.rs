//! Volume snapshot controller.
//!
//! Creation is a three-step choreography: quiesce the guest filesystems if
//! the owning VM is running and the agent is reachable, take the backend
//! snapshot, thaw. Thaw always runs, even when the snapshot step failed.
//! Deletion refuses to proceed while cloned volumes reference the snapshot.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{SnapshotPhase, VmState, VolumeSnapshotData, VolumeSource};
use crate::store::{Result, StoreError};

pub struct SnapshotController {
    ctx: Ctx,
}

impl SnapshotController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    async fn set_error(&self, snap: &VolumeSnapshotData, message: String) -> Result<()> {
        self.ctx
            .snapshots()
            .patch_status(&snap.meta.project_id, &snap.meta.id, |s| {
                s.status.phase = SnapshotPhase::Error;
                s.status.error_message = Some(message.clone());
                s.status.observed_generation = s.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reconcile_create(&self, snap: VolumeSnapshotData) -> Result<Outcome> {
        let Some(volume) = self.ctx.regs.volumes.get_by_id(&snap.spec.volume_id).await? else {
            self.set_error(&snap, format!("volume {} does not exist", snap.spec.volume_id))
                .await?;
            return Ok(Outcome::Done);
        };

        // Find the host doing the work: the attached VM's node, else any
        // node realizing the pool.
        let attached_vm = if volume.status.attached_vm_id.is_empty() {
            None
        } else {
            self.ctx.regs.vms.get_by_id(&volume.status.attached_vm_id).await?
        };
        let node_id = match (&attached_vm, &volume.status.node_id) {
            (Some(vm), _) if vm.status.node_id.is_some() => vm.status.node_id.clone(),
            (_, Some(node)) => Some(node.clone()),
            _ => {
                let pool = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await?;
                pool.and_then(|p| p.status.ready_nodes.first().cloned())
            }
        };
        let Some(node_id) = node_id else {
            return Err(StoreError::Unavailable(format!(
                "no node can snapshot volume {}",
                volume.meta.name
            )));
        };
        let (_, daemon) = self.ctx.daemon(&node_id).await?;

        if snap.status.phase == SnapshotPhase::Pending {
            self.ctx
                .snapshots()
                .patch_status(&snap.meta.project_id, &snap.meta.id, |s| {
                    s.status.phase = SnapshotPhase::Creating;
                    Ok(())
                })
                .await?;
        }

        // Step 1: quiesce, best effort unless crash consistency is
        // forbidden.
        let running_vm = attached_vm
            .as_ref()
            .filter(|vm| vm.status.state == VmState::Running);
        let mut consistent = false;
        if let Some(vm) = running_vm {
            let op = self.ctx.op(&snap.meta.id, "quiesce", snap.meta.generation);
            match daemon.quiesce_filesystems(&op, &vm.meta.id).await {
                Ok(()) => consistent = true,
                Err(e) => {
                    warn!(snapshot = %snap.meta.id, vm = %vm.meta.id, "quiesce failed: {e}");
                    if snap.spec.crash_consistent_forbidden {
                        self.set_error(
                            &snap,
                            format!("quiesce failed and crash-consistent snapshots are forbidden: {e}"),
                        )
                        .await?;
                        return Ok(Outcome::Done);
                    }
                }
            }
        } else {
            // Nothing running against the volume: the snapshot is clean.
            consistent = true;
        }

        // Step 2: backend snapshot. Step 3: thaw, even on failure.
        let op = self.ctx.op(&snap.meta.id, "snapshot", snap.meta.generation);
        let snap_result = daemon
            .create_snapshot(&op, &volume.meta.id, &snap.meta.id)
            .await;
        if let Some(vm) = running_vm {
            let op = self.ctx.op(&snap.meta.id, "thaw", snap.meta.generation);
            if let Err(e) = daemon.thaw_filesystems(&op, &vm.meta.id).await {
                warn!(snapshot = %snap.meta.id, vm = %vm.meta.id, "thaw failed: {e}");
            }
        }
        if let Err(e) = snap_result {
            if e.retryable {
                return Err(e.into());
            }
            self.set_error(&snap, format!("backend snapshot failed: {e}")).await?;
            return Ok(Outcome::Done);
        }

        self.ctx
            .snapshots()
            .patch_status(&snap.meta.project_id, &snap.meta.id, |s| {
                s.status.phase = SnapshotPhase::Ready;
                s.status.consistent = consistent;
                s.status.observed_generation = s.meta.generation;
                s.status.error_message = None;
                Ok(())
            })
            .await?;
        info!(snapshot = %snap.meta.id, volume = %volume.meta.id, consistent, "snapshot ready");
        Ok(Outcome::Done)
    }

    async fn finalize(&self, snap: VolumeSnapshotData) -> Result<Outcome> {
        // Clones pin the snapshot.
        let volumes = self.ctx.regs.volumes.list(None, None).await?;
        let pinned = volumes.iter().any(|v| {
            matches!(&v.spec.source, Some(VolumeSource::Snapshot { snapshot_id }) if snapshot_id == &snap.meta.id)
        });
        if pinned {
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        if snap.status.phase != SnapshotPhase::Deleting {
            self.ctx
                .snapshots()
                .patch_status(&snap.meta.project_id, &snap.meta.id, |s| {
                    s.status.phase = SnapshotPhase::Deleting;
                    Ok(())
                })
                .await?;
        }

        if let Some(volume) = self.ctx.regs.volumes.get_by_id(&snap.spec.volume_id).await? {
            let node_id = match &volume.status.node_id {
                Some(node) => Some(node.clone()),
                None => {
                    let pool = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await?;
                    pool.and_then(|p| p.status.ready_nodes.first().cloned())
                }
            };
            if let Some(node_id) = node_id {
                let (_, daemon) = self.ctx.daemon(&node_id).await?;
                let op = self.ctx.op(&snap.meta.id, "snap-delete", snap.meta.generation);
                daemon
                    .delete_snapshot(&op, &volume.meta.id, &snap.meta.id)
                    .await
                    .map_err(StoreError::from)?;
            }
            // Volume deletion may be waiting on this snapshot.
            self.ctx.queues.volume.add(&volume.meta.id);
        }

        self.ctx
            .snapshots()
            .remove(&snap.meta.project_id, &snap.meta.id)
            .await?;
        info!(snapshot = %snap.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for SnapshotController {
    fn kind(&self) -> &'static str {
        "snapshot"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(snap) = self.ctx.regs.snapshots.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if snap.meta.deleting() {
            return self.finalize(snap).await;
        }

        match snap.status.phase {
            SnapshotPhase::Pending | SnapshotPhase::Creating => self.reconcile_create(snap).await,
            SnapshotPhase::Ready => Ok(Outcome::Done),
            SnapshotPhase::Error => Ok(Outcome::Done),
            SnapshotPhase::Deleting => self.finalize(snap).await,
        }
    }
}
