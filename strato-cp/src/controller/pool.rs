//! Storage pool controller.
//!
//! Mounts/realizes the backend on every assigned node. READY when all
//! assigned nodes confirmed, DEGRADED while only some have. Deletion waits
//! for every volume on the pool to go away (the API layer refuses the
//! delete, or cascades it, before the marker is ever set).

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{NodeState, PoolPhase, StoragePoolData};
use crate::store::{Result, StoreError};

pub struct PoolController {
    ctx: Ctx,
}

impl PoolController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    async fn reconcile_ensure(&self, pool: StoragePoolData) -> Result<Outcome> {
        let backend_json = serde_json::to_string(&pool.spec.backend)
            .map_err(|e| StoreError::Internal(format!("encode backend: {e}")))?;

        let mut ready_nodes = Vec::new();
        let mut pending = 0usize;
        for node_id in &pool.spec.assigned_nodes {
            let Some(node) = self.ctx.regs.nodes.get_by_id(node_id).await? else {
                warn!(pool = %pool.meta.id, node = %node_id, "assigned node does not exist");
                continue;
            };
            if node.status.state != NodeState::Ready {
                pending += 1;
                continue;
            }
            let daemon = match self.ctx.pool.daemon(&node).await {
                Ok(d) => d,
                Err(_) => {
                    pending += 1;
                    continue;
                }
            };
            let op = self.ctx.op(
                &pool.meta.id,
                &format!("pool-ensure-{node_id}"),
                pool.meta.generation,
            );
            match daemon.ensure_pool(&op, &pool.meta.id, &backend_json).await {
                Ok(()) => ready_nodes.push(node_id.clone()),
                Err(e) if e.retryable => pending += 1,
                Err(e) => {
                    self.ctx
                        .pools()
                        .patch_status(&pool.meta.project_id, &pool.meta.id, |p| {
                            p.status.phase = PoolPhase::Error;
                            p.status.error_message =
                                Some(format!("mount failed on {node_id}: {}", e.message));
                            p.status.observed_generation = p.meta.generation;
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::Done);
                }
            }
        }

        let phase = if ready_nodes.len() == pool.spec.assigned_nodes.len() && pending == 0 {
            PoolPhase::Ready
        } else if !ready_nodes.is_empty() {
            PoolPhase::Degraded
        } else {
            PoolPhase::Pending
        };

        let unchanged = pool.status.phase == phase
            && pool.status.ready_nodes == ready_nodes
            && pool.status.observed_generation == pool.meta.generation;
        if unchanged {
            return if phase == PoolPhase::Ready {
                Ok(Outcome::Done)
            } else {
                Ok(Outcome::RequeueAfter(Duration::from_secs(2)))
            };
        }

        self.ctx
            .pools()
            .patch_status(&pool.meta.project_id, &pool.meta.id, |p| {
                p.status.phase = phase;
                p.status.ready_nodes = ready_nodes.clone();
                p.status.observed_generation = p.meta.generation;
                if phase != PoolPhase::Pending {
                    p.status.error_message = None;
                }
                Ok(())
            })
            .await?;

        if phase == PoolPhase::Ready {
            info!(pool = %pool.meta.id, nodes = ready_nodes.len(), "pool ready");
            Ok(Outcome::Done)
        } else {
            Ok(Outcome::RequeueAfter(Duration::from_secs(2)))
        }
    }

    async fn finalize(&self, pool: StoragePoolData) -> Result<Outcome> {
        let volumes = self.ctx.regs.volumes.list(None, None).await?;
        let remaining = volumes
            .iter()
            .filter(|v| v.spec.pool_id == pool.meta.id)
            .count();
        if remaining > 0 {
            // Cascade marked them; wait for the volume controller.
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        if pool.status.phase != PoolPhase::Deleting {
            self.ctx
                .pools()
                .patch_status(&pool.meta.project_id, &pool.meta.id, |p| {
                    p.status.phase = PoolPhase::Deleting;
                    Ok(())
                })
                .await?;
        }

        for node_id in &pool.spec.assigned_nodes {
            let Some(node) = self.ctx.regs.nodes.get_by_id(node_id).await? else {
                continue;
            };
            if node.status.state != NodeState::Ready {
                continue;
            }
            if let Ok(daemon) = self.ctx.pool.daemon(&node).await {
                let op = self.ctx.op(
                    &pool.meta.id,
                    &format!("pool-teardown-{node_id}"),
                    pool.meta.generation,
                );
                daemon
                    .tear_down_pool(&op, &pool.meta.id)
                    .await
                    .map_err(StoreError::from)?;
            }
        }

        self.ctx.pools().remove(&pool.meta.project_id, &pool.meta.id).await?;
        info!(pool = %pool.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for PoolController {
    fn kind(&self) -> &'static str {
        "pool"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(pool) = self.ctx.regs.pools.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if pool.meta.deleting() {
            return self.finalize(pool).await;
        }

        match pool.status.phase {
            PoolPhase::Pending | PoolPhase::Degraded | PoolPhase::Ready => {
                self.reconcile_ensure(pool).await
            }
            PoolPhase::Error => {
                if pool.status.observed_generation < pool.meta.generation {
                    self.ctx
                        .pools()
                        .patch_status(&pool.meta.project_id, &pool.meta.id, |p| {
                            p.status.phase = PoolPhase::Pending;
                            p.status.error_message = None;
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::RequeueAfter(Duration::ZERO));
                }
                Ok(Outcome::Done)
            }
            PoolPhase::Deleting => self.finalize(pool).await,
        }
    }
}
