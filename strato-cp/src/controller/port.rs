//! Port controller.
//!
//! PENDING: allocate MAC and addresses from the network's pools. A port
//! without a VM sits in DOWN; once its VM is placed, the logical switch
//! port is created on that node with the security-group ACL batch and the
//! port goes ACTIVE. Address exhaustion surfaces as ResourceExhausted and
//! clears when a port on the network is reclaimed.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

use crate::controller::{Controller, Ctx, Outcome};
use crate::model::{
    PortData, PortPhase, RuleDirection, SecurityGroupData, VirtualNetworkData, ipv4_to_u32,
    parse_ipv4_cidr, u32_to_ipv4,
};
use crate::nodeclient::PortParams;
use crate::store::{Result, StoreError};

pub struct PortController {
    ctx: Ctx,
}

/// Allocate an IPv4 address from the network's allocation pools, honoring
/// reserved addresses, already-allocated addresses, and a requested static
/// binding.
pub(crate) fn allocate_ipv4(
    network: &VirtualNetworkData,
    in_use: &BTreeSet<String>,
    fixed: Option<&str>,
) -> Result<String> {
    let Some(cidr) = &network.spec.ipv4_cidr else {
        return Err(StoreError::InvalidArgument(format!(
            "network {} has no IPv4 subnet",
            network.meta.name
        )));
    };
    let (net_addr, prefix) = parse_ipv4_cidr(cidr).map_err(StoreError::InvalidArgument)?;
    let size: u64 = 1u64 << (32 - prefix);
    let broadcast = net_addr + (size - 1) as u32;
    // First host is the gateway by convention.
    let gateway = net_addr + 1;

    let reserved: BTreeSet<u32> = network
        .spec
        .reserved_ips
        .iter()
        .filter_map(|ip| ipv4_to_u32(ip).ok())
        .collect();
    let taken: BTreeSet<u32> = in_use.iter().filter_map(|ip| ipv4_to_u32(ip).ok()).collect();

    let available = |addr: u32| -> bool {
        addr > gateway
            && addr < broadcast
            && !reserved.contains(&addr)
            && !taken.contains(&addr)
    };
    let in_pools = |addr: u32| -> bool {
        if network.spec.allocation_pools.is_empty() {
            return true;
        }
        network.spec.allocation_pools.iter().any(|range| {
            match (ipv4_to_u32(&range.start), ipv4_to_u32(&range.end)) {
                (Ok(start), Ok(end)) => addr >= start && addr <= end,
                _ => false,
            }
        })
    };

    if let Some(fixed) = fixed {
        let addr = ipv4_to_u32(fixed).map_err(StoreError::InvalidArgument)?;
        if addr <= net_addr || addr >= broadcast {
            return Err(StoreError::InvalidArgument(format!(
                "{fixed} is outside {cidr}"
            )));
        }
        if !in_pools(addr) || !available(addr) {
            return Err(StoreError::Conflict(format!("{fixed} is not available")));
        }
        return Ok(fixed.to_string());
    }

    for offset in 0..size as u32 {
        let addr = net_addr + offset;
        if in_pools(addr) && available(addr) {
            return Ok(u32_to_ipv4(addr));
        }
    }
    Err(StoreError::ResourceExhausted(format!(
        "no free addresses in {} ({cidr})",
        network.meta.name
    )))
}

/// Stable locally-administered MAC derived from the port id.
pub(crate) fn derive_mac(port_id: &str) -> String {
    let mut h: u64 = 14695981039346656037;
    for b in port_id.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        (h >> 16) as u8,
        (h >> 8) as u8,
        h as u8
    )
}

/// Render a security group into the flat ACL batch the daemon applies
/// atomically. Rule order is preserved; first match wins on the host.
pub(crate) fn render_acl(groups: &[SecurityGroupData]) -> Vec<String> {
    let mut rules = Vec::new();
    for group in groups {
        for rule in &group.spec.rules {
            let dir = match rule.direction {
                RuleDirection::Ingress => "in",
                RuleDirection::Egress => "out",
            };
            let proto = rule.protocol.as_deref().unwrap_or("any");
            let ports = match (rule.port_range_start, rule.port_range_end) {
                (Some(start), Some(end)) => format!("{start}-{end}"),
                (Some(start), None) => format!("{start}"),
                _ => "any".to_string(),
            };
            let cidr = rule.cidr.as_deref().unwrap_or("0.0.0.0/0");
            let stateful = if group.spec.stateful { "ct" } else { "stateless" };
            rules.push(format!("{dir} {proto} {ports} {cidr} {stateful} allow"));
        }
    }
    rules
}

impl PortController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    async fn network_of(&self, port: &PortData) -> Result<VirtualNetworkData> {
        self.ctx
            .regs
            .networks
            .get_by_id(&port.spec.network_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("network {}", port.spec.network_id)))
    }

    /// Addresses currently held by other ports on the same network.
    async fn addresses_in_use(&self, network_id: &str, except_port: &str) -> Result<BTreeSet<String>> {
        let ports = self.ctx.regs.ports.list(None, None).await?;
        Ok(ports
            .iter()
            .filter(|p| p.spec.network_id == network_id && p.meta.id != except_port)
            .filter_map(|p| p.status.ipv4_address.clone())
            .collect())
    }

    async fn set_error(&self, port: &PortData, e: &StoreError) -> Result<()> {
        self.ctx
            .ports()
            .patch_status(&port.meta.project_id, &port.meta.id, |p| {
                p.status.phase = PortPhase::Error;
                p.status.error_message = Some(e.to_string());
                p.status.observed_generation = p.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reconcile_pending(&self, port: PortData) -> Result<Outcome> {
        let network = self.network_of(&port).await?;
        let in_use = self
            .addresses_in_use(&port.spec.network_id, &port.meta.id)
            .await?;

        // MAC: user-provided wins, uniqueness checked across the network.
        let mac = match &port.spec.mac_address {
            Some(mac) => {
                let ports = self.ctx.regs.ports.list(None, None).await?;
                let clash = ports.iter().any(|p| {
                    p.meta.id != port.meta.id
                        && p.spec.network_id == port.spec.network_id
                        && p.status.mac_address.as_deref() == Some(mac.as_str())
                });
                if clash {
                    let e = StoreError::Conflict(format!("MAC {mac} already in use"));
                    self.set_error(&port, &e).await?;
                    return Ok(Outcome::Done);
                }
                mac.clone()
            }
            None => derive_mac(&port.meta.id),
        };

        let ipv4 = if network.spec.ipv4_cidr.is_some() {
            match allocate_ipv4(&network, &in_use, port.spec.fixed_ipv4.as_deref()) {
                Ok(ip) => Some(ip),
                Err(e @ StoreError::ResourceExhausted(_)) => {
                    self.set_error(&port, &e).await?;
                    return Err(e);
                }
                Err(e) => {
                    self.set_error(&port, &e).await?;
                    return Ok(Outcome::Done);
                }
            }
        } else {
            None
        };

        self.ctx
            .ports()
            .patch_status(&port.meta.project_id, &port.meta.id, |p| {
                p.status.phase = PortPhase::Build;
                p.status.mac_address = Some(mac.clone());
                p.status.ipv4_address = ipv4.clone();
                p.status.observed_generation = p.meta.generation;
                p.status.error_message = None;
                Ok(())
            })
            .await?;

        // Keep the network's allocation ledger current.
        if let Some(ip) = ipv4 {
            self.ctx
                .networks()
                .patch_status(&network.meta.project_id, &network.meta.id, |n| {
                    if !n.status.allocated_ips.contains(&ip) {
                        n.status.allocated_ips.push(ip.clone());
                    }
                    Ok(())
                })
                .await?;
        }
        self.ctx.queues.network.add(&network.meta.id);
        Ok(Outcome::RequeueAfter(Duration::ZERO))
    }

    async fn reconcile_build(&self, port: PortData) -> Result<Outcome> {
        // Unbound ports sit allocated but down.
        let Some(vm_id) = port.spec.vm_id.clone() else {
            if port.status.phase != PortPhase::Down {
                self.ctx
                    .ports()
                    .patch_status(&port.meta.project_id, &port.meta.id, |p| {
                        p.status.phase = PortPhase::Down;
                        Ok(())
                    })
                    .await?;
            }
            return Ok(Outcome::Done);
        };

        let Some(vm) = self.ctx.regs.vms.get_by_id(&vm_id).await? else {
            // Referent VM is gone; release the binding.
            self.ctx
                .ports()
                .patch_spec(&port.meta.project_id, &port.meta.id, |p| {
                    p.spec.vm_id = None;
                    Ok(())
                })
                .await?;
            return Ok(Outcome::RequeueAfter(Duration::ZERO));
        };
        let Some(node_id) = vm.status.node_id.clone() else {
            return Ok(Outcome::Done); // placed later; the VM controller re-enqueues
        };

        // Already realized on the VM's current host against the current
        // spec: steady state.
        if port.status.phase == PortPhase::Active
            && port.status.observed_generation == port.meta.generation
            && port.status.realized_node_id.as_deref() == Some(node_id.as_str())
        {
            return Ok(Outcome::Done);
        }

        let network = self.network_of(&port).await?;
        let (_, daemon) = self.ctx.daemon(&node_id).await?;

        // The segment must exist on the host before the switch port.
        let kind = match network.spec.kind {
            crate::model::NetworkKind::Overlay { .. } => "overlay",
            crate::model::NetworkKind::Vlan { .. } => "vlan",
        };
        let segment = network.status.segment_id.unwrap_or_default();
        let op = self
            .ctx
            .op(&network.meta.id, &format!("net-ensure-{node_id}"), network.meta.generation);
        daemon
            .ensure_network(&op, &network.meta.id, kind, segment)
            .await
            .map_err(StoreError::from)?;

        // Resolve the ACL batch from the referenced groups, in order.
        let mut groups = Vec::new();
        for group_id in &port.spec.security_group_ids {
            match self.ctx.regs.security_groups.get_by_id(group_id).await? {
                Some(group) => groups.push(group),
                None => {
                    let e = StoreError::NotFound(format!("security group {group_id}"));
                    self.set_error(&port, &e).await?;
                    return Ok(Outcome::Done);
                }
            }
        }

        let params = PortParams {
            port_id: port.meta.id.clone(),
            network_id: network.meta.id.clone(),
            mac_address: port.status.mac_address.clone().unwrap_or_default(),
            ipv4_address: port.status.ipv4_address.clone(),
            ipv6_address: port.status.ipv6_address.clone(),
            acl_rules: render_acl(&groups),
        };
        let op = self.ctx.op(&port.meta.id, "port-create", port.meta.generation);
        daemon.create_port(&op, &params).await.map_err(StoreError::from)?;

        self.ctx
            .ports()
            .patch_status(&port.meta.project_id, &port.meta.id, |p| {
                p.status.phase = PortPhase::Active;
                p.status.ovn_port = Some(format!("lsp-{}", p.meta.id));
                p.status.realized_node_id = Some(node_id.clone());
                p.status.observed_generation = p.meta.generation;
                Ok(())
            })
            .await?;
        info!(port = %port.meta.id, node = %node_id, "port active");
        Ok(Outcome::Done)
    }

    async fn finalize(&self, port: PortData) -> Result<Outcome> {
        // Tear the switch port down wherever the VM lives.
        if let Some(vm_id) = &port.spec.vm_id {
            if let Some(vm) = self.ctx.regs.vms.get_by_id(vm_id).await? {
                if let Some(node_id) = &vm.status.node_id {
                    if let Ok((_, daemon)) = self.ctx.daemon(node_id).await {
                        let op = self.ctx.op(&port.meta.id, "port-delete", port.meta.generation);
                        daemon
                            .delete_port(&op, &port.meta.id)
                            .await
                            .map_err(StoreError::from)?;
                    }
                }
            }
        }

        // Release the address back to the network pool.
        if let Some(ip) = &port.status.ipv4_address {
            if let Some(network) = self.ctx.regs.networks.get_by_id(&port.spec.network_id).await? {
                self.ctx
                    .networks()
                    .patch_status(&network.meta.project_id, &network.meta.id, |n| {
                        n.status.allocated_ips.retain(|a| a != ip);
                        Ok(())
                    })
                    .await?;
                self.ctx.queues.network.add(&network.meta.id);
            }
        }

        self.ctx
            .ports()
            .remove(&port.meta.project_id, &port.meta.id)
            .await?;
        info!(port = %port.meta.id, "deleted");
        Ok(Outcome::Done)
    }
}

#[async_trait]
impl Controller for PortController {
    fn kind(&self) -> &'static str {
        "port"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(port) = self.ctx.regs.ports.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if port.meta.deleting() {
            return self.finalize(port).await;
        }

        match port.status.phase {
            PortPhase::Pending => self.reconcile_pending(port).await,
            PortPhase::Build | PortPhase::Down | PortPhase::Active => {
                self.reconcile_build(port).await
            }
            PortPhase::Error => {
                if port.status.observed_generation < port.meta.generation {
                    self.ctx
                        .ports()
                        .patch_status(&port.meta.project_id, &port.meta.id, |p| {
                            p.status.phase = PortPhase::Pending;
                            p.status.error_message = None;
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::RequeueAfter(Duration::ZERO));
                }
                Ok(Outcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IpRange, Meta};

    fn network(cidr: &str) -> VirtualNetworkData {
        let mut n = VirtualNetworkData::default();
        n.meta = Meta {
            id: "net-1".to_string(),
            name: "net-1".to_string(),
            ..Default::default()
        };
        n.spec.ipv4_cidr = Some(cidr.to_string());
        n
    }

    #[test]
    fn test_allocates_first_free_host() {
        let net = network("10.0.0.0/24");
        let ip = allocate_ipv4(&net, &BTreeSet::new(), None).unwrap();
        // .0 network, .1 gateway -> first allocatable is .2
        assert_eq!(ip, "10.0.0.2");
    }

    #[test]
    fn test_skips_reserved_and_taken() {
        let mut net = network("10.0.0.0/24");
        net.spec.reserved_ips = vec!["10.0.0.2".to_string()];
        let mut used = BTreeSet::new();
        used.insert("10.0.0.3".to_string());
        let ip = allocate_ipv4(&net, &used, None).unwrap();
        assert_eq!(ip, "10.0.0.4");
    }

    #[test]
    fn test_exhaustion_then_reclaim() {
        // /29: 8 addresses, minus network/gateway/broadcast = 5 usable.
        let net = network("10.0.0.0/29");
        let mut used = BTreeSet::new();
        for _ in 0..5 {
            let ip = allocate_ipv4(&net, &used, None).unwrap();
            used.insert(ip);
        }
        assert!(matches!(
            allocate_ipv4(&net, &used, None),
            Err(StoreError::ResourceExhausted(_))
        ));

        // Reclaim one address; the next allocation succeeds with it.
        used.remove("10.0.0.4");
        assert_eq!(allocate_ipv4(&net, &used, None).unwrap(), "10.0.0.4");
    }

    #[test]
    fn test_fixed_binding_honored() {
        let net = network("10.0.0.0/24");
        let ip = allocate_ipv4(&net, &BTreeSet::new(), Some("10.0.0.50")).unwrap();
        assert_eq!(ip, "10.0.0.50");

        let mut used = BTreeSet::new();
        used.insert("10.0.0.50".to_string());
        assert!(matches!(
            allocate_ipv4(&net, &used, Some("10.0.0.50")),
            Err(StoreError::Conflict(_))
        ));
        assert!(allocate_ipv4(&net, &BTreeSet::new(), Some("10.1.0.50")).is_err());
    }

    #[test]
    fn test_allocation_pools_constrain_range() {
        let mut net = network("10.0.0.0/24");
        net.spec.allocation_pools = vec![IpRange {
            start: "10.0.0.100".to_string(),
            end: "10.0.0.101".to_string(),
        }];
        let mut used = BTreeSet::new();
        assert_eq!(allocate_ipv4(&net, &used, None).unwrap(), "10.0.0.100");
        used.insert("10.0.0.100".to_string());
        assert_eq!(allocate_ipv4(&net, &used, None).unwrap(), "10.0.0.101");
        used.insert("10.0.0.101".to_string());
        assert!(matches!(
            allocate_ipv4(&net, &used, None),
            Err(StoreError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_derived_mac_is_stable_and_local() {
        let a = derive_mac("01hq3kabc");
        let b = derive_mac("01hq3kabc");
        let c = derive_mac("01hq3kxyz");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("52:54:00:"));
    }

    #[test]
    fn test_render_acl_preserves_order() {
        let mut group = SecurityGroupData::default();
        group.spec.stateful = true;
        group.spec.rules = vec![
            crate::model::SecurityGroupRule {
                direction: RuleDirection::Ingress,
                protocol: Some("tcp".to_string()),
                port_range_start: Some(22),
                port_range_end: None,
                cidr: Some("10.0.0.0/8".to_string()),
                description: None,
            },
            crate::model::SecurityGroupRule {
                direction: RuleDirection::Egress,
                protocol: None,
                port_range_start: None,
                port_range_end: None,
                cidr: None,
                description: None,
            },
        ];
        let rules = render_acl(&[group]);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], "in tcp 22 10.0.0.0/8 ct allow");
        assert_eq!(rules[1], "out any any 0.0.0.0/0 ct allow");
    }
}
