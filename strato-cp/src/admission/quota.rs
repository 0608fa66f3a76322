//! Per-project quota accounting.
//!
//! Quota is enforced at admission against the sum of stored specs plus the
//! requested delta, and reconciled onto `Project.status.used` by a
//! background pass so operators can see consumption.

use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::controller::Ctx;
use crate::model::{QuotaSpec, QuotaUsage};
use crate::registries::Registries;
use crate::store::{Result, StoreError};

/// Resources a request would add to the project.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaDelta {
    pub vcpus: u64,
    pub memory_mib: u64,
    pub volume_gib: u64,
    pub vms: u64,
}

/// Current consumption computed from stored specs.
pub async fn usage(regs: &Registries, project_id: &str) -> Result<QuotaUsage> {
    let mut used = QuotaUsage::default();
    for vm in regs.vms.list(Some(project_id), None).await? {
        used.vms += 1;
        used.vcpus += vm.spec.cpu_cores as u64;
        used.memory_mib += vm.spec.memory_mib;
    }
    for volume in regs.volumes.list(Some(project_id), None).await? {
        used.volume_gib += volume.spec.size_gib;
    }
    Ok(used)
}

fn exceeded(limit: u64, used: u64, delta: u64) -> bool {
    limit != 0 && used + delta > limit
}

/// Admission check: fail with `ResourceExhausted` when any axis would go
/// over its ceiling.
pub fn check(quota: &QuotaSpec, used: &QuotaUsage, delta: &QuotaDelta) -> Result<()> {
    if exceeded(quota.max_vms, used.vms, delta.vms) {
        return Err(StoreError::ResourceExhausted(format!(
            "VM quota exceeded ({}/{})",
            used.vms, quota.max_vms
        )));
    }
    if exceeded(quota.max_vcpus, used.vcpus, delta.vcpus) {
        return Err(StoreError::ResourceExhausted(format!(
            "vCPU quota exceeded ({}/{})",
            used.vcpus, quota.max_vcpus
        )));
    }
    if exceeded(quota.max_memory_mib, used.memory_mib, delta.memory_mib) {
        return Err(StoreError::ResourceExhausted(format!(
            "memory quota exceeded ({} MiB/{} MiB)",
            used.memory_mib, quota.max_memory_mib
        )));
    }
    if exceeded(quota.max_volume_gib, used.volume_gib, delta.volume_gib) {
        return Err(StoreError::ResourceExhausted(format!(
            "volume quota exceeded ({} GiB/{} GiB)",
            used.volume_gib, quota.max_volume_gib
        )));
    }
    Ok(())
}

/// Background pass reconciling observed use onto project status.
pub async fn run_reconciler(ctx: Ctx, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if ctx.leader.borrow().is_leading() {
            if let Err(e) = reconcile_once(&ctx).await {
                warn!("quota reconcile failed: {e}");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

async fn reconcile_once(ctx: &Ctx) -> Result<()> {
    let projects = ctx.regs.projects.list(None, None).await?;
    for project in projects {
        let used = usage(&ctx.regs, &project.meta.id).await?;
        let stale = project.status.used.vms != used.vms
            || project.status.used.vcpus != used.vcpus
            || project.status.used.memory_mib != used.memory_mib
            || project.status.used.volume_gib != used.volume_gib;
        if stale {
            ctx.regs
                .projects
                .patch_status(&project.meta.project_id, &project.meta.id, |p| {
                    p.status.used = used.clone();
                    Ok(())
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(vms: u64, vcpus: u64) -> QuotaSpec {
        QuotaSpec {
            max_vms: vms,
            max_vcpus: vcpus,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let used = QuotaUsage {
            vms: 1000,
            vcpus: 4000,
            ..Default::default()
        };
        assert!(check(&QuotaSpec::default(), &used, &QuotaDelta::default()).is_ok());
    }

    #[test]
    fn test_delta_pushes_over_limit() {
        let used = QuotaUsage {
            vms: 4,
            vcpus: 14,
            ..Default::default()
        };
        let delta = QuotaDelta {
            vms: 1,
            vcpus: 4,
            ..Default::default()
        };
        // 5 VMs fits, 18 vCPUs does not.
        assert!(matches!(
            check(&quota(5, 16), &used, &delta),
            Err(StoreError::ResourceExhausted(_))
        ));
        assert!(check(&quota(5, 32), &used, &delta).is_ok());
    }

    #[test]
    fn test_at_limit_is_allowed() {
        let used = QuotaUsage {
            vms: 4,
            ..Default::default()
        };
        let delta = QuotaDelta {
            vms: 1,
            ..Default::default()
        };
        assert!(check(&quota(5, 0), &used, &delta).is_ok());
    }
}
