//! Virtual network controller.
//!
//! PENDING → READY once the segment id is settled; realization on a host is
//! lazy, done by the port controller when the first port lands there.
//! Deletion waits for every port on the network to go away, then tears the
//! segment down on the nodes that realized it.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{NetworkKind, NetworkPhase, VirtualNetworkData};
use crate::store::{Result, StoreError};

pub struct NetworkController {
    ctx: Ctx,
}

impl NetworkController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Stable VNI derived from the object id; user-set tags win.
    fn segment_for(net: &VirtualNetworkData) -> u32 {
        match net.spec.kind {
            NetworkKind::Vlan { tag } => tag as u32,
            NetworkKind::Overlay { vni } if vni != 0 => vni,
            NetworkKind::Overlay { .. } => {
                // 24-bit Geneve VNI space, clear of the low well-known ids.
                let mut h: u32 = 2166136261;
                for b in net.meta.id.bytes() {
                    h ^= b as u32;
                    h = h.wrapping_mul(16777619);
                }
                (h % 0xFF_FF00) + 0x100
            }
        }
    }

    async fn finalize(&self, net: VirtualNetworkData) -> Result<Outcome> {
        let ports = self.ctx.regs.ports.list(None, None).await?;
        let blockers: Vec<_> = ports
            .iter()
            .filter(|p| p.spec.network_id == net.meta.id)
            .collect();
        if !blockers.is_empty() {
            // Cascade marking is the API's call; the controller just waits.
            return Ok(Outcome::RequeueAfter(Duration::from_millis(500)));
        }

        if net.status.phase != NetworkPhase::Deleting {
            self.ctx
                .networks()
                .patch_status(&net.meta.project_id, &net.meta.id, |n| {
                    n.status.phase = NetworkPhase::Deleting;
                    Ok(())
                })
                .await?;
        }

        // Best-effort teardown on every node that could have realized it.
        let nodes = self.ctx.regs.nodes.list(None, None).await?;
        for node in nodes {
            if !node.status.state.hosts_vms() {
                continue;
            }
            if let Some(daemon) = self.ctx.pool.existing(&node.meta.id).await {
                let op = self.ctx.op(&net.meta.id, "net-teardown", net.meta.generation);
                let _ = daemon.tear_down_network(&op, &net.meta.id).await;
            }
        }

        self.ctx
            .networks()
            .remove(&net.meta.project_id, &net.meta.id)
            .await?;
        info!(network = %net.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for NetworkController {
    fn kind(&self) -> &'static str {
        "network"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(net) = self.ctx.regs.networks.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if net.meta.deleting() {
            return self.finalize(net).await;
        }

        let segment = Self::segment_for(&net);
        let ports = self.ctx.regs.ports.list(None, None).await?;
        let port_count = ports
            .iter()
            .filter(|p| p.spec.network_id == net.meta.id && !p.meta.deleting())
            .count() as u32;

        let stale = net.status.phase != NetworkPhase::Ready
            || net.status.segment_id != Some(segment)
            || net.status.port_count != port_count
            || net.status.observed_generation != net.meta.generation;
        if stale {
            self.ctx
                .networks()
                .patch_status(&net.meta.project_id, &net.meta.id, |n| {
                    n.status.phase = NetworkPhase::Ready;
                    n.status.segment_id = Some(segment);
                    n.status.port_count = port_count;
                    n.status.observed_generation = n.meta.generation;
                    n.status.error_message = None;
                    Ok(())
                })
                .await?;
        }
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Meta;

    fn net(id: &str, kind: NetworkKind) -> VirtualNetworkData {
        let mut n = VirtualNetworkData::default();
        n.meta = Meta {
            id: id.to_string(),
            ..Default::default()
        };
        n.spec.kind = kind;
        n
    }

    #[test]
    fn test_vlan_tag_is_segment() {
        let n = net("a", NetworkKind::Vlan { tag: 42 });
        assert_eq!(NetworkController::segment_for(&n), 42);
    }

    #[test]
    fn test_explicit_vni_wins() {
        let n = net("a", NetworkKind::Overlay { vni: 7001 });
        assert_eq!(NetworkController::segment_for(&n), 7001);
    }

    #[test]
    fn test_auto_vni_is_stable_and_nonzero() {
        let a = net("01hq3k", NetworkKind::Overlay { vni: 0 });
        let b = net("01hq3k", NetworkKind::Overlay { vni: 0 });
        let c = net("01hq3m", NetworkKind::Overlay { vni: 0 });
        assert_eq!(
            NetworkController::segment_for(&a),
            NetworkController::segment_for(&b)
        );
        assert!(NetworkController::segment_for(&a) >= 0x100);
        assert_ne!(
            NetworkController::segment_for(&a),
            NetworkController::segment_for(&c)
        );
    }
}
