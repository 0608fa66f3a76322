//! Edge object controllers: floating IPs and load balancers.
//!
//! Both follow the 4-phase pattern: allocate an address from the external
//! network, mark READY, release on delete. The data-plane NAT/VIP wiring is
//! the SDN's concern and rides on the port realization path.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::info;

use crate::controller::port::allocate_ipv4;
use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{FloatingIpData, LoadBalancerData, NetworkPhase, VirtualNetworkData};
use crate::store::{Result, StoreError};

/// Every address currently held on the network by ports, floating IPs, and
/// load balancer VIPs.
async fn edge_addresses_in_use(ctx: &Ctx, network_id: &str) -> Result<BTreeSet<String>> {
    let mut used = BTreeSet::new();
    for port in ctx.regs.ports.list(None, None).await? {
        if port.spec.network_id == network_id {
            if let Some(ip) = port.status.ipv4_address {
                used.insert(ip);
            }
        }
    }
    for fip in ctx.regs.floating_ips.list(None, None).await? {
        if fip.spec.network_id == network_id {
            if let Some(ip) = fip.status.address {
                used.insert(ip);
            }
        }
    }
    for lb in ctx.regs.load_balancers.list(None, None).await? {
        if lb.spec.network_id == network_id {
            if let Some(ip) = lb.status.vip {
                used.insert(ip);
            }
        }
    }
    Ok(used)
}

async fn network_of(ctx: &Ctx, network_id: &str) -> Result<VirtualNetworkData> {
    ctx.regs
        .networks
        .get_by_id(network_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("network {network_id}")))
}

// =============================================================================
// Floating IPs
// =============================================================================

pub struct FloatingIpController {
    ctx: Ctx,
}

impl FloatingIpController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Controller for FloatingIpController {
    fn kind(&self) -> &'static str {
        "floating-ip"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(fip) = self.ctx.regs.floating_ips.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if fip.meta.deleting() {
            self.ctx
                .floating_ips()
                .remove(&fip.meta.project_id, &fip.meta.id)
                .await?;
            info!(fip = %fip.meta.id, "deleted");
            return Ok(Outcome::Done);
        }

        if fip.status.address.is_some() && fip.status.observed_generation == fip.meta.generation {
            return Ok(Outcome::Done);
        }

        // Associated port must exist when named.
        if let Some(port_id) = &fip.spec.port_id {
            if self.ctx.regs.ports.get_by_id(port_id).await?.is_none() {
                self.ctx
                    .floating_ips()
                    .patch_status(&fip.meta.project_id, &fip.meta.id, |f| {
                        f.status.phase = NetworkPhase::Error;
                        f.status.error_message = Some(format!("port {port_id} does not exist"));
                        f.status.observed_generation = f.meta.generation;
                        Ok(())
                    })
                    .await?;
                return Ok(Outcome::Done);
            }
        }

        let network = network_of(&self.ctx, &fip.spec.network_id).await?;
        let used = edge_addresses_in_use(&self.ctx, &fip.spec.network_id).await?;
        let address = match &fip.status.address {
            Some(addr) => addr.clone(),
            None => match allocate_ipv4(&network, &used, fip.spec.address.as_deref()) {
                Ok(addr) => addr,
                Err(e @ StoreError::ResourceExhausted(_)) => {
                    self.ctx
                        .floating_ips()
                        .patch_status(&fip.meta.project_id, &fip.meta.id, |f| {
                            f.status.phase = NetworkPhase::Error;
                            f.status.error_message = Some(e.to_string());
                            f.status.observed_generation = f.meta.generation;
                            Ok(())
                        })
                        .await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            },
        };

        self.ctx
            .floating_ips()
            .patch_status(&fip.meta.project_id, &fip.meta.id, |f| {
                f.status.phase = NetworkPhase::Ready;
                f.status.address = Some(address.clone());
                f.status.observed_generation = f.meta.generation;
                f.status.error_message = None;
                Ok(())
            })
            .await?;
        info!(fip = %fip.meta.id, address, "floating ip ready");
        Ok(Outcome::Done)
    }
}

// =============================================================================
// Load balancers
// =============================================================================

pub struct LoadBalancerController {
    ctx: Ctx,
}

impl LoadBalancerController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Controller for LoadBalancerController {
    fn kind(&self) -> &'static str {
        "load-balancer"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(lb) = self.ctx.regs.load_balancers.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if lb.meta.deleting() {
            self.ctx
                .load_balancers()
                .remove(&lb.meta.project_id, &lb.meta.id)
                .await?;
            info!(lb = %lb.meta.id, "deleted");
            return Ok(Outcome::Done);
        }

        // Member ports must resolve.
        for listener in &lb.spec.listeners {
            for port_id in &listener.member_port_ids {
                if self.ctx.regs.ports.get_by_id(port_id).await?.is_none() {
                    self.ctx
                        .load_balancers()
                        .patch_status(&lb.meta.project_id, &lb.meta.id, |l| {
                            l.status.phase = NetworkPhase::Error;
                            l.status.error_message =
                                Some(format!("member port {port_id} does not exist"));
                            l.status.observed_generation = l.meta.generation;
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::Done);
                }
            }
        }

        if lb.status.vip.is_some() && lb.status.observed_generation == lb.meta.generation {
            return Ok(Outcome::Done);
        }

        let network = network_of(&self.ctx, &lb.spec.network_id).await?;
        let used = edge_addresses_in_use(&self.ctx, &lb.spec.network_id).await?;
        let vip = match &lb.status.vip {
            Some(vip) => vip.clone(),
            None => allocate_ipv4(&network, &used, lb.spec.vip.as_deref())?,
        };

        self.ctx
            .load_balancers()
            .patch_status(&lb.meta.project_id, &lb.meta.id, |l| {
                l.status.phase = NetworkPhase::Ready;
                l.status.vip = Some(vip.clone());
                l.status.observed_generation = l.meta.generation;
                l.status.error_message = None;
                Ok(())
            })
            .await?;
        info!(lb = %lb.meta.id, vip, "load balancer ready");
        Ok(Outcome::Done)
    }
}
