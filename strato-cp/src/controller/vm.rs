//! VM controller.
//!
//! Drives the VirtualMachine state machine: materialize child volumes and
//! ports, place the VM through the scheduler and bind it under CAS, define
//! the domain on the node, converge power state, run live migrations, and
//! tear everything down on delete. Long operations are observed across
//! passes; every node call is idempotent by derived op id, so a retried or
//! re-led pass converges instead of duplicating work.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::controller::{Controller, Ctx, Outcome};
use crate::eventbus::requeue_capacity_waiters;
use crate::model::{
    DesiredRunState, MigrationPhase, MigrationStatus, PortData, PortSpec, VmData, VmState,
    VolumeData, VolumePhase, VolumeSource, VolumeSpec,
};
use crate::nodeclient::{DiskAttachment, DomainPowerState, DomainSpec, NicAttachment};
use crate::scheduler::{NoFit, NoFitReason, ScheduleRequest, schedule};
use crate::store::{Result, StoreError};

/// Delay between passes while waiting on children or node acks.
const SETTLE: Duration = Duration::from_millis(300);
/// Bound on schedule-then-bind CAS races before backing off.
const BIND_ATTEMPTS: usize = 3;

pub struct VmController {
    ctx: Ctx,
}

impl VmController {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// NoFit caused purely by missing capacity retries on capacity change;
    /// anything else needs a spec change.
    fn nofit_reason(nofit: &NoFit) -> &'static str {
        let capacity_only = !nofit.reasons.is_empty()
            && nofit.reasons.values().all(|r| {
                matches!(
                    r,
                    NoFitReason::InsufficientCpu
                        | NoFitReason::InsufficientMemory
                        | NoFitReason::InsufficientDisk
                        | NoFitReason::HaReserveExceeded
                        | NoFitReason::NodeNotReady
                )
            });
        if capacity_only { "no_capacity" } else { "no_fit" }
    }

    async fn set_error(&self, vm: &VmData, reason: &str, message: String) -> Result<()> {
        // Re-asserting the same error would trigger the watch for nothing.
        let unchanged = vm.status.state == VmState::Error
            && vm.status.reason.as_deref() == Some(reason)
            && vm.status.error_message.as_deref() == Some(message.as_str())
            && vm.status.observed_generation == vm.meta.generation;
        if unchanged {
            return Ok(());
        }
        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = VmState::Error;
                v.status.reason = Some(reason.to_string());
                v.status.error_message = Some(message.clone());
                v.status.observed_generation = v.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // PENDING: materialize children, schedule, bind
    // ------------------------------------------------------------------

    async fn ensure_children(&self, vm: &VmData) -> Result<VmData> {
        let volumes = self.ctx.volumes();
        let ports = self.ctx.ports();
        let mut disk_volume_ids = vm.status.disk_volume_ids.clone();
        let mut nic_port_ids = vm.status.nic_port_ids.clone();

        for (i, disk) in vm.spec.disks.iter().enumerate() {
            if let Some(id) = &disk.volume_id {
                if disk_volume_ids.get(i).is_none() {
                    disk_volume_ids.push(id.clone());
                }
                continue;
            }
            if disk_volume_ids.get(i).is_some() {
                continue;
            }
            let name = format!("{}-disk-{i}", vm.meta.name);
            let created = match volumes
                .create(child_volume(vm, &name, disk))
                .await
            {
                Ok(v) => v,
                Err(StoreError::AlreadyExists(_)) => volumes
                    .get_by_name(&vm.meta.project_id, &name)
                    .await?
                    .ok_or_else(|| StoreError::Conflict(format!("volume {name} vanished")))?,
                Err(e) => return Err(e),
            };
            disk_volume_ids.push(created.meta.id);
        }

        let disks_done = disk_volume_ids.len() >= vm.spec.disks.len();
        for (i, nic) in vm.spec.nics.iter().enumerate() {
            if let Some(id) = &nic.port_id {
                if nic_port_ids.get(i).is_none() {
                    nic_port_ids.push(id.clone());
                    // Claim the existing port for this VM.
                    ports
                        .patch_spec(&vm.meta.project_id, id, |p| {
                            match &p.spec.vm_id {
                                None => p.spec.vm_id = Some(vm.meta.id.clone()),
                                Some(owner) if owner == &vm.meta.id => {}
                                Some(owner) => {
                                    return Err(StoreError::FailedPrecondition(format!(
                                        "port {} already bound to VM {owner}",
                                        p.meta.id
                                    )));
                                }
                            }
                            Ok(())
                        })
                        .await?;
                }
                continue;
            }
            if nic_port_ids.get(i).is_some() {
                continue;
            }
            let network_id = nic
                .network_id
                .clone()
                .ok_or_else(|| StoreError::InvalidArgument("nic without network".to_string()))?;
            let name = format!("{}-nic-{i}", vm.meta.name);
            let mut port = PortData::default();
            port.meta.name = name.clone();
            port.meta.project_id = vm.meta.project_id.clone();
            port.spec = PortSpec {
                network_id,
                vm_id: Some(vm.meta.id.clone()),
                mac_address: nic.mac_address.clone(),
                security_group_ids: nic.security_group_ids.clone(),
                ..Default::default()
            };
            let created = match ports.create(port).await {
                Ok(p) => p,
                Err(StoreError::AlreadyExists(_)) => ports
                    .get_by_name(&vm.meta.project_id, &name)
                    .await?
                    .ok_or_else(|| StoreError::Conflict(format!("port {name} vanished")))?,
                Err(e) => return Err(e),
            };
            nic_port_ids.push(created.meta.id);
        }

        // Children already recorded: nothing to write.
        if disks_done
            && vm.status.disk_volume_ids == disk_volume_ids
            && vm.status.nic_port_ids == nic_port_ids
        {
            return Ok(vm.clone());
        }
        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.disk_volume_ids = disk_volume_ids.clone();
                v.status.nic_port_ids = nic_port_ids.clone();
                Ok(())
            })
            .await
    }

    async fn place(&self, vm: &VmData, exclude: &[String]) -> Result<Option<String>> {
        let regs = &self.ctx.regs;
        for attempt in 0..BIND_ATTEMPTS {
            let nodes = regs.nodes.list(None, None).await?;
            let vms = regs.vms.list(None, None).await?;
            let pools = regs.pools.list(None, None).await?;
            let volumes = regs.volumes.list(None, None).await?;
            let ports = regs.ports.list(None, None).await?;
            let clusters = regs.clusters.list(None, None).await?;

            let current = vms
                .iter()
                .find(|v| v.meta.id == vm.meta.id)
                .cloned()
                .unwrap_or_else(|| vm.clone());

            let request = ScheduleRequest {
                vm: &current,
                nodes: &nodes,
                vms: &vms,
                pools: &pools,
                volumes: &volumes,
                ports: &ports,
                cluster: clusters.first(),
                default_policy: self.ctx.cfg.default_policy,
                exclude_nodes: exclude,
            };
            let chosen = match schedule(&request) {
                Ok(result) => result,
                Err(nofit) => {
                    let reason = Self::nofit_reason(&nofit);
                    self.set_error(vm, reason, format!("no node fits: {nofit}"))
                        .await?;
                    return Ok(None);
                }
            };

            // Bind under CAS against the revision the snapshot saw; a lost
            // race re-schedules against fresh state.
            let mut bound = current;
            bound.status.node_id = Some(chosen.node_id.clone());
            bound.status.state = VmState::Creating;
            bound.status.node_lost = false;
            bound.status.reason = None;
            bound.status.error_message = None;
            bound.status.observed_generation = bound.meta.generation;
            match self.ctx.vms().update_status(bound).await {
                Ok(_) => {
                    info!(vm = %vm.meta.id, node = %chosen.node_id, "placed: {}", chosen.reason);
                    return Ok(Some(chosen.node_id));
                }
                Err(StoreError::Conflict(_)) if attempt + 1 < BIND_ATTEMPTS => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Conflict(
            "placement raced with concurrent updates".to_string(),
        ))
    }

    async fn reconcile_pending(&self, vm: VmData) -> Result<Outcome> {
        let vm = self.ensure_children(&vm).await?;
        if self.place(&vm, &[]).await?.is_none() {
            return Ok(Outcome::Done);
        }
        Ok(Outcome::RequeueAfter(Duration::ZERO))
    }

    // ------------------------------------------------------------------
    // CREATING: wait for children, define the domain
    // ------------------------------------------------------------------

    async fn children_ready(&self, vm: &VmData) -> Result<Option<(Vec<DiskAttachment>, Vec<NicAttachment>)>> {
        let regs = &self.ctx.regs;

        let mut disks = Vec::new();
        for (i, volume_id) in vm.status.disk_volume_ids.iter().enumerate() {
            let Some(volume) = regs.volumes.get_by_id(volume_id).await? else {
                return Err(StoreError::NotFound(format!("volume {volume_id}")));
            };
            match volume.status.phase {
                VolumePhase::Ready | VolumePhase::InUse => {}
                VolumePhase::Error => {
                    return Err(StoreError::FailedPrecondition(format!(
                        "volume {} failed: {}",
                        volume.meta.name,
                        volume.status.error_message.unwrap_or_default()
                    )));
                }
                _ => return Ok(None),
            }
            let readonly = vm.spec.disks.get(i).map(|d| d.readonly).unwrap_or(false);
            disks.push(DiskAttachment {
                volume_id: volume_id.clone(),
                device: format!("vd{}", (b'a' + i as u8) as char),
                readonly,
                boot: i == 0,
            });
        }

        let mut nics = Vec::new();
        for port_id in &vm.status.nic_port_ids {
            let Some(port) = regs.ports.get_by_id(port_id).await? else {
                return Err(StoreError::NotFound(format!("port {port_id}")));
            };
            let Some(mac) = port.status.mac_address.clone() else {
                return Ok(None); // port controller has not allocated yet
            };
            nics.push(NicAttachment {
                port_id: port_id.clone(),
                mac_address: mac,
                binding: format!("{:?}", port.spec.binding).to_lowercase(),
            });
        }

        Ok(Some((disks, nics)))
    }

    async fn reconcile_creating(&self, vm: VmData) -> Result<Outcome> {
        let Some(node_id) = vm.status.node_id.clone() else {
            // Lost the binding; go around again.
            return self.reset_to_pending(&vm).await;
        };

        let Some((disks, nics)) = self.children_ready(&vm).await? else {
            return Ok(Outcome::RequeueAfter(SETTLE));
        };

        let customization = match &vm.spec.customization_id {
            Some(id) => {
                let spec = self
                    .ctx
                    .regs
                    .customizations
                    .get_by_id(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("customization {id}")))?;
                Some(serde_json::to_string(&spec.spec).map_err(|e| {
                    StoreError::Internal(format!("render customization: {e}"))
                })?)
            }
            None => None,
        };

        let (_, daemon) = self.ctx.daemon(&node_id).await?;
        let domain = DomainSpec {
            vm_id: vm.meta.id.clone(),
            name: vm.meta.name.clone(),
            cpu_cores: vm.spec.cpu_cores,
            memory_mib: vm.spec.memory_mib,
            disks,
            nics,
            customization,
        };
        let op = self.ctx.op(&vm.meta.id, "create", vm.meta.generation);
        daemon.create_vm(&op, &domain).await.map_err(StoreError::from)?;

        // Mark volumes attached now that the domain references them.
        for volume_id in &vm.status.disk_volume_ids {
            if let Some(volume) = self.ctx.regs.volumes.get_by_id(volume_id).await? {
                self.ctx
                    .volumes()
                    .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                        v.status.attached_vm_id = vm.meta.id.clone();
                        v.status.phase = VolumePhase::InUse;
                        Ok(())
                    })
                    .await?;
            }
        }

        // Domain acknowledged: the VM is defined and stopped.
        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = VmState::Stopped;
                v.status.observed_generation = v.meta.generation;
                Ok(())
            })
            .await?;

        // The port controller can realize switch ports now that the VM has
        // a home.
        for port_id in &vm.status.nic_port_ids {
            self.ctx.queues.port.add(port_id);
        }

        Ok(Outcome::RequeueAfter(Duration::ZERO))
    }

    async fn reset_to_pending(&self, vm: &VmData) -> Result<Outcome> {
        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = VmState::Pending;
                v.status.node_id = None;
                v.status.reason = None;
                v.status.error_message = None;
                Ok(())
            })
            .await?;
        Ok(Outcome::RequeueAfter(Duration::ZERO))
    }

    // ------------------------------------------------------------------
    // Power convergence
    // ------------------------------------------------------------------

    async fn reconcile_power(&self, vm: VmData) -> Result<Outcome> {
        let Some(node_id) = vm.status.node_id.clone() else {
            return self.reset_to_pending(&vm).await;
        };

        // A dead host freezes the VM until the HA supervisor decides.
        let node = self
            .ctx
            .regs
            .nodes
            .get_by_id(&node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        if !node.status.state.hosts_vms() {
            if !vm.status.node_lost {
                self.ctx
                    .vms()
                    .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                        v.status.node_lost = true;
                        Ok(())
                    })
                    .await?;
            }
            return Ok(Outcome::Done);
        }

        let (_, daemon) = self.ctx.daemon(&node_id).await?;
        let observed = daemon
            .get_vm_status(&vm.meta.id)
            .await
            .map_err(StoreError::from)?;

        let Some(domain) = observed else {
            // Domain vanished under us; define it again.
            self.ctx
                .vms()
                .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                    v.status.state = VmState::Creating;
                    Ok(())
                })
                .await?;
            return Ok(Outcome::RequeueAfter(Duration::ZERO));
        };

        if domain.state == DomainPowerState::Crashed {
            return self.handle_crash(&vm, &node_id).await;
        }

        // Pending one-shot requests first.
        if let Some(nonce) = vm.spec.reboot_nonce.clone() {
            if vm.status.last_reboot_nonce.as_deref() != Some(nonce.as_str())
                && domain.state == DomainPowerState::Running
            {
                let op = self.ctx.op(&vm.meta.id, "reboot", vm.meta.generation);
                daemon.reboot_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
                self.ctx
                    .vms()
                    .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                        v.status.last_reboot_nonce = Some(nonce.clone());
                        Ok(())
                    })
                    .await?;
                return Ok(Outcome::RequeueAfter(SETTLE));
            }
        }
        if let Some(request) = vm.spec.migration.clone() {
            let handled = vm
                .status
                .migration
                .as_ref()
                .map(|m| m.nonce == request.nonce)
                .unwrap_or(false);
            if !handled && domain.state == DomainPowerState::Running {
                return self.begin_migration(&vm, &node_id, &request.nonce, request.target_node_id)
                    .await;
            }
        }

        let desired = vm.spec.run_state;
        let outcome = match (desired, domain.state) {
            (DesiredRunState::Running, DomainPowerState::Stopped) => {
                let op = self.ctx.op(&vm.meta.id, "start", vm.meta.generation);
                daemon.start_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
                self.write_state(&vm, VmState::Starting, None).await?;
                Outcome::RequeueAfter(SETTLE)
            }
            (DesiredRunState::Running, DomainPowerState::Starting) => {
                self.write_state(&vm, VmState::Starting, domain.ip_address).await?;
                Outcome::RequeueAfter(SETTLE)
            }
            (DesiredRunState::Running, DomainPowerState::Running) => {
                self.write_state(&vm, VmState::Running, domain.ip_address).await?;
                Outcome::Done
            }
            (DesiredRunState::Running, DomainPowerState::Paused)
            | (DesiredRunState::Running, DomainPowerState::Suspended) => {
                let op = self.ctx.op(&vm.meta.id, "resume", vm.meta.generation);
                daemon.resume_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
                self.write_state(&vm, VmState::Starting, None).await?;
                Outcome::RequeueAfter(SETTLE)
            }
            (DesiredRunState::Stopped, DomainPowerState::Stopped) => {
                self.write_state(&vm, VmState::Stopped, None).await?;
                Outcome::Done
            }
            (DesiredRunState::Stopped, DomainPowerState::Running)
            | (DesiredRunState::Stopped, DomainPowerState::Starting)
            | (DesiredRunState::Stopped, DomainPowerState::Paused)
            | (DesiredRunState::Stopped, DomainPowerState::Suspended) => {
                if vm.status.state == VmState::Stopping {
                    // Graceful window elapsed? The status timestamp marks
                    // when stopping began.
                    let elapsed = chrono::DateTime::parse_from_rfc3339(&vm.meta.updated_at)
                        .map(|t| chrono::Utc::now().signed_duration_since(t))
                        .map(|d| d.to_std().unwrap_or_default())
                        .unwrap_or_default();
                    if elapsed >= self.ctx.cfg.stop_grace {
                        let op = self.ctx.op(&vm.meta.id, "force-stop", vm.meta.generation);
                        daemon
                            .force_stop_vm(&op, &vm.meta.id)
                            .await
                            .map_err(StoreError::from)?;
                    }
                    Outcome::RequeueAfter(SETTLE)
                } else {
                    let op = self.ctx.op(&vm.meta.id, "stop", vm.meta.generation);
                    daemon
                        .stop_vm(&op, &vm.meta.id, true, self.ctx.cfg.stop_grace)
                        .await
                        .map_err(StoreError::from)?;
                    self.write_state(&vm, VmState::Stopping, None).await?;
                    Outcome::RequeueAfter(SETTLE)
                }
            }
            (DesiredRunState::Paused, DomainPowerState::Running) => {
                let op = self.ctx.op(&vm.meta.id, "pause", vm.meta.generation);
                daemon.pause_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
                self.write_state(&vm, VmState::Paused, None).await?;
                Outcome::Done
            }
            (DesiredRunState::Paused, DomainPowerState::Paused) => {
                self.write_state(&vm, VmState::Paused, None).await?;
                Outcome::Done
            }
            (DesiredRunState::Paused, DomainPowerState::Stopped) => {
                // Start first; pause on the next pass.
                let op = self.ctx.op(&vm.meta.id, "start", vm.meta.generation);
                daemon.start_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
                self.write_state(&vm, VmState::Starting, None).await?;
                Outcome::RequeueAfter(SETTLE)
            }
            // Crashed is handled before the match; if a crash lands between
            // the two reads, the next pass catches it.
            (_, DomainPowerState::Crashed) => Outcome::RequeueAfter(SETTLE),
            (DesiredRunState::Paused, DomainPowerState::Starting)
            | (DesiredRunState::Paused, DomainPowerState::Suspended) => {
                Outcome::RequeueAfter(SETTLE)
            }
        };
        Ok(outcome)
    }

    async fn write_state(
        &self,
        vm: &VmData,
        state: VmState,
        ip: Option<String>,
    ) -> Result<()> {
        // Skip the write when nothing moves; a no-op status write would
        // trigger the watch and spin the queue.
        let unchanged = vm.status.state == state
            && (ip.is_none() || vm.status.ip_address == ip)
            && vm.status.observed_generation == vm.meta.generation
            && (state != VmState::Running || vm.status.error_message.is_none());
        if unchanged {
            return Ok(());
        }
        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = state;
                if let Some(ip) = &ip {
                    v.status.ip_address = Some(ip.clone());
                }
                if state == VmState::Running {
                    v.status.reason = None;
                    v.status.error_message = None;
                }
                v.status.observed_generation = v.meta.generation;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn handle_crash(&self, vm: &VmData, node_id: &str) -> Result<Outcome> {
        warn!(vm = %vm.meta.id, node = %node_id, "domain crashed");
        let (_, daemon) = self.ctx.daemon(node_id).await?;
        let op = self.ctx.op(&vm.meta.id, "crash-cleanup", vm.meta.generation);
        daemon.delete_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;

        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = VmState::Error;
                v.status.node_id = None;
                v.status.reason = Some("crashed".to_string());
                v.status.error_message = Some("guest crashed; domain cleaned up".to_string());
                Ok(())
            })
            .await?;

        // HA-enabled clusters restart crashed guests without user action.
        let clusters = self.ctx.regs.clusters.list(None, None).await?;
        let ha = clusters.first().map(|c| c.spec.ha_enabled).unwrap_or(false);
        if ha && vm.spec.run_state == DesiredRunState::Running {
            return self.reset_to_pending(vm).await;
        }
        Ok(Outcome::Done)
    }

    // ------------------------------------------------------------------
    // Live migration
    // ------------------------------------------------------------------

    async fn begin_migration(
        &self,
        vm: &VmData,
        source_node: &str,
        nonce: &str,
        target: Option<String>,
    ) -> Result<Outcome> {
        // Live migration needs every disk on a shared pool.
        for volume_id in &vm.status.disk_volume_ids {
            let Some(volume) = self.ctx.regs.volumes.get_by_id(volume_id).await? else {
                continue;
            };
            let Some(pool) = self.ctx.regs.pools.get_by_id(&volume.spec.pool_id).await? else {
                continue;
            };
            if !pool.spec.backend.is_shared() {
                self.ctx
                    .vms()
                    .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                        v.status.migration = Some(MigrationStatus {
                            nonce: nonce.to_string(),
                            phase: MigrationPhase::Failed,
                            percent: 0,
                            target_node_id: None,
                            message: Some(format!(
                                "volume {} is on a node-local pool",
                                volume.meta.name
                            )),
                        });
                        Ok(())
                    })
                    .await?;
                return Ok(Outcome::Done);
            }
        }

        let target_node = match target {
            Some(t) => t,
            None => {
                let exclude = vec![source_node.to_string()];
                match self.pick_migration_target(vm, &exclude).await? {
                    Some(node) => node,
                    None => {
                        self.ctx
                            .vms()
                            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                                v.status.migration = Some(MigrationStatus {
                                    nonce: nonce.to_string(),
                                    phase: MigrationPhase::Failed,
                                    percent: 0,
                                    target_node_id: None,
                                    message: Some("no eligible migration target".to_string()),
                                });
                                Ok(())
                            })
                            .await?;
                        return Ok(Outcome::Done);
                    }
                }
            }
        };

        self.ctx
            .vms()
            .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                v.status.state = VmState::Migrating;
                v.status.migration = Some(MigrationStatus {
                    nonce: nonce.to_string(),
                    phase: MigrationPhase::Preparing,
                    percent: 0,
                    target_node_id: Some(target_node.clone()),
                    message: None,
                });
                Ok(())
            })
            .await?;
        Ok(Outcome::RequeueAfter(Duration::ZERO))
    }

    async fn pick_migration_target(
        &self,
        vm: &VmData,
        exclude: &[String],
    ) -> Result<Option<String>> {
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

    async fn reconcile_migrating(&self, vm: VmData) -> Result<Outcome> {
        let Some(migration) = vm.status.migration.clone() else {
            return self.reset_to_pending(&vm).await;
        };
        let Some(source_node) = vm.status.node_id.clone() else {
            return self.reset_to_pending(&vm).await;
        };
        let Some(target_node) = migration.target_node_id.clone() else {
            return self.reset_to_pending(&vm).await;
        };

        let (_, source) = self.ctx.daemon(&source_node).await?;
        let (target_data, _) = self.ctx.daemon(&target_node).await?;

        let op = self
            .ctx
            .op(&vm.meta.id, &format!("migrate-{}", migration.nonce), vm.meta.generation);
        let mut ticks = source
            .migrate_vm(&op, &vm.meta.id, &target_data.meta.name)
            .await
            .map_err(StoreError::from)?;

        // Drain progress inside the pass budget; an unfinished stream is
        // resumed by re-issuing the same idempotent op next pass.
        let budget = self.ctx.cfg.reconcile_timeout / 2;
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            let tick = tokio::select! {
                t = ticks.recv() => t,
                _ = tokio::time::sleep_until(deadline) => {
                    return Ok(Outcome::RequeueAfter(Duration::from_secs(1)));
                }
            };
            let Some(tick) = tick else {
                // Stream ended without a terminal phase; check again soon.
                return Ok(Outcome::RequeueAfter(Duration::from_secs(1)));
            };

            match tick.phase {
                MigrationPhase::Completed => {
                    self.ctx
                        .vms()
                        .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                            v.status.node_id = Some(target_node.clone());
                            v.status.state = VmState::Running;
                            if let Some(m) = &mut v.status.migration {
                                m.phase = MigrationPhase::Completed;
                                m.percent = 100;
                            }
                            Ok(())
                        })
                        .await?;
                    info!(vm = %vm.meta.id, from = %source_node, to = %target_node, "migration complete");
                    // Switch ports follow the domain to the target host.
                    for port_id in &vm.status.nic_port_ids {
                        self.ctx.queues.port.add(port_id);
                    }
                    return Ok(Outcome::Done);
                }
                MigrationPhase::Failed => {
                    // Revert: the domain stays on the source.
                    self.ctx
                        .vms()
                        .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                            v.status.state = VmState::Running;
                            if let Some(m) = &mut v.status.migration {
                                m.phase = MigrationPhase::Failed;
                                m.message = tick.message.clone();
                            }
                            Ok(())
                        })
                        .await?;
                    return Ok(Outcome::Done);
                }
                phase => {
                    self.ctx
                        .vms()
                        .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                            if let Some(m) = &mut v.status.migration {
                                m.phase = phase;
                                m.percent = tick.percent;
                            }
                            Ok(())
                        })
                        .await?;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // ERROR / FAILED recovery
    // ------------------------------------------------------------------

    async fn reconcile_error(&self, vm: VmData) -> Result<Outcome> {
        let spec_changed = vm.status.observed_generation < vm.meta.generation;
        let capacity_wait = matches!(
            vm.status.reason.as_deref(),
            Some("no_capacity") | Some("no_fit")
        );
        if spec_changed || capacity_wait {
            // Run the pending logic in place rather than bouncing through a
            // PENDING write: a still-failing schedule re-asserts the same
            // error without touching the store.
            return self.reconcile_pending(vm).await;
        }
        Ok(Outcome::Done)
    }

    // ------------------------------------------------------------------
    // DELETING
    // ------------------------------------------------------------------

    async fn finalize(&self, vm: VmData) -> Result<Outcome> {
        if vm.status.state != VmState::Deleting {
            self.ctx
                .vms()
                .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                    v.status.state = VmState::Deleting;
                    Ok(())
                })
                .await?;
        }

        // Remove the domain first so nothing references ports or volumes. A
        // fenced or vanished node cannot be reached; split-brain resolution
        // cleans it up if it ever returns.
        if let Some(node_id) = vm.status.node_id.clone() {
            let node = self.ctx.regs.nodes.get_by_id(&node_id).await?;
            let reachable = node
                .as_ref()
                .map(|n| n.status.state.hosts_vms())
                .unwrap_or(false);
            if reachable {
                let (_, daemon) = self.ctx.daemon(&node_id).await?;
                let op = self.ctx.op(&vm.meta.id, "delete-stop", vm.meta.generation);
                match daemon.force_stop_vm(&op, &vm.meta.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {} // already gone
                    Err(e) => return Err(e.into()),
                }
                let op = self.ctx.op(&vm.meta.id, "delete-domain", vm.meta.generation);
                daemon.delete_vm(&op, &vm.meta.id).await.map_err(StoreError::from)?;
            }
            self.ctx
                .vms()
                .patch_status(&vm.meta.project_id, &vm.meta.id, |v| {
                    v.status.node_id = None;
                    Ok(())
                })
                .await?;
        }

        // Detach volumes.
        for volume_id in &vm.status.disk_volume_ids {
            if let Some(volume) = self.ctx.regs.volumes.get_by_id(volume_id).await? {
                if volume.status.attached_vm_id == vm.meta.id {
                    self.ctx
                        .volumes()
                        .patch_status(&volume.meta.project_id, &volume.meta.id, |v| {
                            v.status.attached_vm_id = String::new();
                            if v.status.phase == VolumePhase::InUse {
                                v.status.phase = VolumePhase::Ready;
                            }
                            Ok(())
                        })
                        .await?;
                }
            }
        }

        // Delete ports bound to this VM and wait for their teardown.
        let ports = self.ctx.regs.ports.list(Some(&vm.meta.project_id), None).await?;
        let mut waiting = false;
        for port in ports {
            if port.spec.vm_id.as_deref() == Some(vm.meta.id.as_str()) {
                if !port.meta.deleting() {
                    self.ctx
                        .ports()
                        .mark_deleted(&port.meta.project_id, &port.meta.id)
                        .await?;
                    self.ctx.queues.port.add(&port.meta.id);
                }
                waiting = true;
            }
        }
        if waiting {
            return Ok(Outcome::RequeueAfter(SETTLE));
        }

        self.ctx.vms().remove(&vm.meta.project_id, &vm.meta.id).await?;
        info!(vm = %vm.meta.id, "deleted");

        // Freed capacity may unblock ERROR no_capacity VMs.
        requeue_capacity_waiters(&self.ctx.regs, &self.ctx.queues).await;
        Ok(Outcome::Done)
    }
}

fn child_volume(vm: &VmData, name: &str, disk: &crate::model::DiskSpec) -> VolumeData {
    let mut volume = VolumeData::default();
    volume.meta.name = name.to_string();
    volume.meta.project_id = vm.meta.project_id.clone();
    volume.spec = VolumeSpec {
        pool_id: disk.pool_id.clone().unwrap_or_default(),
        size_gib: disk.size_gib,
        source: disk.image_id.clone().map(|image_id| VolumeSource::Image { image_id }),
    };
    volume
}

#[async_trait]
impl Controller for VmController {
    fn kind(&self) -> &'static str {
        "vm"
    }

    async fn reconcile(&self, id: &str) -> Result<Outcome> {
        let Some(vm) = self.ctx.regs.vms.get_by_id(id).await? else {
            return Ok(Outcome::Done);
        };

        if vm.meta.deleting() {
            return self.finalize(vm).await;
        }

        match vm.status.state {
            VmState::Pending => self.reconcile_pending(vm).await,
            VmState::Creating => self.reconcile_creating(vm).await,
            VmState::Migrating => self.reconcile_migrating(vm).await,
            VmState::Error | VmState::Failed => self.reconcile_error(vm).await,
            VmState::Deleting => self.finalize(vm).await,
            VmState::Starting
            | VmState::Running
            | VmState::Stopping
            | VmState::Stopped
            | VmState::Paused
            | VmState::Suspended => self.reconcile_power(vm).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::NoFit;
    use std::collections::BTreeMap;

    #[test]
    fn test_nofit_reason_classification() {
        let mut reasons = BTreeMap::new();
        reasons.insert("n-1".to_string(), NoFitReason::InsufficientMemory);
        reasons.insert("n-2".to_string(), NoFitReason::HaReserveExceeded);
        assert_eq!(VmController::nofit_reason(&NoFit { reasons }), "no_capacity");

        let mut reasons = BTreeMap::new();
        reasons.insert("n-1".to_string(), NoFitReason::AntiAffinity);
        reasons.insert("n-2".to_string(), NoFitReason::InsufficientCpu);
        assert_eq!(VmController::nofit_reason(&NoFit { reasons }), "no_fit");

        let empty = NoFit {
            reasons: BTreeMap::new(),
        };
        assert_eq!(VmController::nofit_reason(&empty), "no_fit");
    }
}
