//! Volume controller.
//!
//! PENDING → CREATING (backend carve) → READY; IN_USE while attached,
//! RESIZING while the backend grows the device. A volume on a node-local
//! pool is realized on the pool's node and may only ever attach to VMs
//! there; the scheduler enforces the placement side of that invariant.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{
    NodeState, PoolPhase, StoragePoolData, VolumeData, VolumePhase, VolumeSource,
};
use crate::nodeclient::VolumeParams;
use crate::store::{Result, StoreError};

pub struct VolumeController {
    ctx: Ctx,
}

impl VolumeController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    async fn set_error(&self, volume: &VolumeData, message: String) -> Result<()> {
        self.ctx
            .volumes()
            .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                v.status.phase = VolumePhase::Error;
                v.status.error_message = Some(message.clone());
                v.status.observed_generation = v.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// The node that realizes this volume: a local pool's single node, or
    /// any ready node a shared pool is assigned to.
    async fn realization_node(&self, pool: &StoragePoolData) -> Result<Option<String>> {
        for node_id in &pool.spec.assigned_nodes {
            if let Some(node) = self.ctx.regs.nodes.get_by_id(node_id).await? {
                if node.status.state == NodeState::Ready {
                    return Ok(Some(node_id.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn reconcile_create(&self, volume: VolumeData) -> Result<Outcome> {
        let Some(pool) = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await? else {
            self.set_error(&volume, format!("pool {} does not exist", volume.spec.pool_id))
                .await?;
            return Ok(Outcome::Done);
        };
        if pool.meta.deleting() {
            self.set_error(&volume, format!("pool {} is being deleted", pool.meta.name))
                .await?;
            return Ok(Outcome::Done);
        }
        if pool.status.phase != PoolPhase::Ready && pool.status.phase != PoolPhase::Degraded {
            // Pool controller is still mounting; try again shortly.
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        // Snapshot clones must reference a live snapshot.
        let mut source_image = None;
        let mut source_snapshot = None;
        match &volume.spec.source {
            Some(VolumeSource::Image { image_id }) => {
                if self.ctx.regs.images.get_by_id(image_id).await?.is_none() {
                    self.set_error(&volume, format!("image {image_id} does not exist"))
                        .await?;
                    return Ok(Outcome::Done);
                }
                source_image = Some(image_id.clone());
            }
            Some(VolumeSource::Snapshot { snapshot_id }) => {
                if self.ctx.regs.snapshots.get_by_id(snapshot_id).await?.is_none() {
                    self.set_error(&volume, format!("snapshot {snapshot_id} does not exist"))
                        .await?;
                    return Ok(Outcome::Done);
                }
                source_snapshot = Some(snapshot_id.clone());
            }
            None => {}
        }

        let Some(node_id) = self.realization_node(&pool).await? else {
            return Err(StoreError::Unavailable(format!(
                "no ready node for pool {}",
                pool.meta.name
            )));
        };

        if volume.status.phase == VolumePhase::Pending {
            self.ctx
                .volumes()
                .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                    v.status.phase = VolumePhase::Creating;
                    Ok(())
                })
                .await?;
        }

        let (_, daemon) = self.ctx.daemon(&node_id).await?;
        let params = VolumeParams {
            volume_id: volume.meta.id.clone(),
            pool_id: pool.meta.id.clone(),
            size_gib: volume.spec.size_gib,
            source_image_id: source_image,
            source_snapshot_id: source_snapshot,
        };
        let op = self.ctx.op(&volume.meta.id, "vol-create", volume.meta.generation);
        daemon.create_volume(&op, &params).await.map_err(StoreError::from)?;

        self.ctx
            .volumes()
            .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                v.status.phase = if v.status.attached_vm_id.is_empty() {
                    VolumePhase::Ready
                } else {
                    VolumePhase::InUse
                };
                v.status.node_id = if pool.spec.backend.is_shared() {
                    None
                } else {
                    Some(node_id.clone())
                };
                v.status.size_gib = v.spec.size_gib;
                v.status.observed_generation = v.meta.generation;
                v.status.error_message = None;
                Ok(())
            })
            .await?;
        info!(volume = %volume.meta.id, pool = %pool.meta.id, "volume ready");
        Ok(Outcome::Done)
    }

    async fn reconcile_steady(&self, volume: VolumeData) -> Result<Outcome> {
        // Grow the backing device when the spec asks for more.
        if volume.spec.size_gib != volume.status.size_gib {
            if volume.spec.size_gib < volume.status.size_gib {
                self.set_error(&volume, "volumes cannot shrink".to_string()).await?;
                return Ok(Outcome::Done);
            }
            let Some(pool) = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await? else {
                self.set_error(&volume, format!("pool {} does not exist", volume.spec.pool_id))
                    .await?;
                return Ok(Outcome::Done);
            };
            let Some(node_id) = self.realization_node(&pool).await? else {
                return Err(StoreError::Unavailable(format!(
                    "no ready node for pool {}",
                    pool.meta.name
                )));
            };

            self.ctx
                .volumes()
                .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                    v.status.phase = VolumePhase::Resizing;
                    Ok(())
                })
                .await?;

            let (_, daemon) = self.ctx.daemon(&node_id).await?;
            let op = self.ctx.op(
                &volume.meta.id,
                &format!("vol-resize-{}", volume.spec.size_gib),
                volume.meta.generation,
            );
            daemon
                .resize_volume(&op, &volume.meta.id, &pool.meta.id, volume.spec.size_gib)
                .await
                .map_err(StoreError::from)?;

            self.ctx
                .volumes()
                .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                    v.status.size_gib = v.spec.size_gib;
                    v.status.phase = if v.status.attached_vm_id.is_empty() {
                        VolumePhase::Ready
                    } else {
                        VolumePhase::InUse
                    };
                    v.status.observed_generation = v.meta.generation;
                    Ok(())
                })
                .await?;
            return Ok(Outcome::Done);
        }

        // Keep IN_USE exactly in step with the attachment field.
        let want = if volume.status.attached_vm_id.is_empty() {
            VolumePhase::Ready
        } else {
            VolumePhase::InUse
        };
        if volume.status.phase != want {
            self.ctx
                .volumes()
                .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                    v.status.phase = want;
                    Ok(())
                })
                .await?;
        }
        Ok(Outcome::Done)
    }

    async fn finalize(&self, volume: VolumeData) -> Result<Outcome> {
        if !volume.status.attached_vm_id.is_empty() {
            // Still attached; the VM teardown detaches first.
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        // Snapshots of this volume block removal until they are gone.
        let snapshots = self.ctx.regs.snapshots.list(None, None).await?;
        if snapshots.iter().any(|s| s.spec.volume_id == volume.meta.id) {
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        if volume.status.phase != VolumePhase::Deleting {
            self.ctx
                .volumes()
                .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                    v.status.phase = VolumePhase::Deleting;
                    Ok(())
                })
                .await?;
        }

        if let Some(pool) = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await? {
            if let Some(node_id) = self.realization_node(&pool).await? {
                let (_, daemon) = self.ctx.daemon(&node_id).await?;
                let op = self.ctx.op(&volume.meta.id, "vol-delete", volume.meta.generation);
                daemon
                    .delete_volume(&op, &volume.meta.id, &pool.meta.id)
                    .await
                    .map_err(StoreError::from)?;
            }
            // Pool deletion may be waiting on this volume.
            self.ctx.queues.pool.add(&pool.meta.id);
        }

        self.ctx
            .volumes()
            .remove(&volume.meta.project_id, &volume.meta.id)
            .await?;
        info!(volume = %volume.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for VolumeController {
    fn kind(&self) -> &'static str {
        "volume"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(volume) = self.ctx.regs.volumes.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if volume.meta.deleting() {
            return self.finalize(volume).await;
        }

        match volume.status.phase {
            VolumePhase::Pending | VolumePhase::Creating => self.reconcile_create(volume).await,
            VolumePhase::Ready | VolumePhase::InUse | VolumePhase::Resizing => {
                self.reconcile_steady(volume).await
            }
            VolumePhase::Error => {
                if volume.status.observed_generation < volume.meta.generation {
                    self.ctx
                        .volumes()
                        .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                            v.status.phase = VolumePhase::Pending;
                            v.status.error_message = None;
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::RequeueAfter(Duration::ZERO));
                }
                Ok(Outcome::Done)
            }
            VolumePhase::Deleting => self.finalize(volume).await,
        }
    }
}
