//! tonic-backed [`NodeDaemon`] implementation.
//!
//! One instance per connected node. Calls are bounded by the per-call
//! deadline from the reconcile budget; server streams are pumped into
//! channels so consumers never hold a tonic type.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tonic::transport::Channel;

use crate::model::MigrationPhase;
use crate::proto::node as pb;
use crate::proto::node::node_daemon_client::NodeDaemonClient;

use super::{
    DiskAttachment, DomainPowerState, DomainSpec, DomainState, ExecResult, MetricsSample,
    MigrationTick, NicAttachment, NodeDaemon, NodeDaemonEvent, NodeInfo, OpCtx, PortParams,
    RpcError, RpcResult, SnapshotInfo, VolumeParams,
};

pub struct GrpcNodeDaemon {
    client: NodeDaemonClient<Channel>,
    rpc_timeout: Duration,
}

impl GrpcNodeDaemon {
    pub async fn connect(address: &str, rpc_timeout: Duration) -> RpcResult<Self> {
        let endpoint = Channel::from_shared(address.to_string())
            .map_err(|e| RpcError::failed(format!("invalid daemon address {address}: {e}")))?
            .connect_timeout(rpc_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RpcError::unavailable(format!("connect {address}: {e}")))?;
        Ok(Self {
            client: NodeDaemonClient::new(channel),
            rpc_timeout,
        })
    }

    fn budget(&self, op: Option<&OpCtx>) -> Duration {
        op.map(|o| o.deadline.min(self.rpc_timeout))
            .unwrap_or(self.rpc_timeout)
    }

    async fn unary<F, Fut>(&self, op: Option<&OpCtx>, call: F) -> RpcResult<pb::OpResult>
    where
        F: FnOnce(NodeDaemonClient<Channel>) -> Fut,
        Fut: Future<Output = Result<tonic::Response<pb::OpResult>, tonic::Status>>,
    {
        let client = self.client.clone();
        let reply = tokio::time::timeout(self.budget(op), call(client))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?;
        Ok(reply.into_inner())
    }
}

fn status_to_rpc(status: tonic::Status) -> RpcError {
    let retryable = matches!(
        status.code(),
        tonic::Code::Unavailable | tonic::Code::DeadlineExceeded | tonic::Code::Aborted
    );
    RpcError {
        code: status.code() as u32,
        retryable,
        message: status.message().to_string(),
    }
}

fn check(result: pb::OpResult) -> RpcResult<()> {
    if result.code == 0 {
        Ok(())
    } else {
        Err(RpcError {
            code: result.code,
            retryable: result.retryable,
            message: result.message,
        })
    }
}

fn parse_migration_phase(s: &str) -> MigrationPhase {
    match s {
        "preparing" => MigrationPhase::Preparing,
        "transferring" => MigrationPhase::Transferring,
        "switchover" => MigrationPhase::Switchover,
        "completed" => MigrationPhase::Completed,
        _ => MigrationPhase::Failed,
    }
}

#[async_trait]
impl NodeDaemon for GrpcNodeDaemon {
    async fn create_vm(&self, op: &OpCtx, spec: &DomainSpec) -> RpcResult<()> {
        let request = pb::CreateVmRequest {
            op_id: op.op_id.clone(),
            vm_id: spec.vm_id.clone(),
            name: spec.name.clone(),
            cpu_cores: spec.cpu_cores,
            memory_mib: spec.memory_mib,
            disks: spec
                .disks
                .iter()
                .map(|d| pb::DiskAttachment {
                    volume_id: d.volume_id.clone(),
                    device: d.device.clone(),
                    readonly: d.readonly,
                    boot: d.boot,
                })
                .collect(),
            nics: spec
                .nics
                .iter()
                .map(|n| pb::NicAttachment {
                    port_id: n.port_id.clone(),
                    mac_address: n.mac_address.clone(),
                    binding: n.binding.clone(),
                })
                .collect(),
            customization: spec.customization.clone().unwrap_or_default(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.create_vm(request).await })
                .await?,
        )
    }

    async fn start_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.start_vm(request).await })
                .await?,
        )
    }

    async fn stop_vm(
        &self,
        op: &OpCtx,
        vm_id: &str,
        graceful: bool,
        timeout: Duration,
    ) -> RpcResult<()> {
        let request = pb::StopVmRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            graceful,
            timeout_secs: timeout.as_secs() as u32,
        };
        check(
            self.unary(Some(op), |mut c| async move { c.stop_vm(request).await })
                .await?,
        )
    }

    async fn force_stop_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.force_stop_vm(request).await })
                .await?,
        )
    }

    async fn reboot_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.reboot_vm(request).await })
                .await?,
        )
    }

    async fn pause_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.pause_vm(request).await })
                .await?,
        )
    }

    async fn resume_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.resume_vm(request).await })
                .await?,
        )
    }

    async fn delete_vm(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::VmOpRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.delete_vm(request).await })
                .await?,
        )
    }

    async fn get_vm_status(&self, vm_id: &str) -> RpcResult<Option<DomainState>> {
        let request = pb::GetVmStatusRequest {
            vm_id: vm_id.to_string(),
        };
        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.rpc_timeout, client.get_vm_status(request))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?
            .into_inner();
        if !reply.exists {
            return Ok(None);
        }
        Ok(Some(DomainState {
            vm_id: reply.vm_id,
            state: DomainPowerState::parse(&reply.state).unwrap_or(DomainPowerState::Stopped),
            ip_address: if reply.ip_address.is_empty() {
                None
            } else {
                Some(reply.ip_address)
            },
        }))
    }

    async fn list_vms(&self) -> RpcResult<Vec<DomainState>> {
        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.rpc_timeout, client.list_vms(pb::ListVmsRequest {}))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?
            .into_inner();
        Ok(reply
            .vms
            .into_iter()
            .map(|v| DomainState {
                vm_id: v.vm_id,
                state: DomainPowerState::parse(&v.state).unwrap_or(DomainPowerState::Stopped),
                ip_address: if v.ip_address.is_empty() {
                    None
                } else {
                    Some(v.ip_address)
                },
            })
            .collect())
    }

    async fn get_console(&self, vm_id: &str) -> RpcResult<String> {
        let request = pb::GetConsoleRequest {
            vm_id: vm_id.to_string(),
        };
        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.rpc_timeout, client.get_console(request))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?
            .into_inner();
        Ok(reply.uri)
    }

    async fn create_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let request = pb::SnapshotRequest {
            op_id: op.op_id.clone(),
            vm_id: String::new(),
            volume_id: volume_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.create_snapshot(request).await })
                .await?,
        )
    }

    async fn revert_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let request = pb::SnapshotRequest {
            op_id: op.op_id.clone(),
            vm_id: String::new(),
            volume_id: volume_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.revert_snapshot(request).await })
                .await?,
        )
    }

    async fn delete_snapshot(
        &self,
        op: &OpCtx,
        volume_id: &str,
        snapshot_id: &str,
    ) -> RpcResult<()> {
        let request = pb::SnapshotRequest {
            op_id: op.op_id.clone(),
            vm_id: String::new(),
            volume_id: volume_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.delete_snapshot(request).await })
                .await?,
        )
    }

    async fn list_snapshots(&self, volume_id: &str) -> RpcResult<Vec<SnapshotInfo>> {
        let request = pb::ListSnapshotsRequest {
            volume_id: volume_id.to_string(),
        };
        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.rpc_timeout, client.list_snapshots(request))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?
            .into_inner();
        Ok(reply
            .snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                snapshot_id: s.snapshot_id,
                volume_id: s.volume_id,
                size_bytes: s.size_bytes,
            })
            .collect())
    }

    async fn attach_disk(&self, op: &OpCtx, vm_id: &str, disk: &DiskAttachment) -> RpcResult<()> {
        let request = pb::AttachDiskRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            disk: Some(pb::DiskAttachment {
                volume_id: disk.volume_id.clone(),
                device: disk.device.clone(),
                readonly: disk.readonly,
                boot: disk.boot,
            }),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.attach_disk(request).await })
                .await?,
        )
    }

    async fn detach_disk(&self, op: &OpCtx, vm_id: &str, volume_id: &str) -> RpcResult<()> {
        let request = pb::DetachDiskRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            volume_id: volume_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.detach_disk(request).await })
                .await?,
        )
    }

    async fn attach_nic(&self, op: &OpCtx, vm_id: &str, nic: &NicAttachment) -> RpcResult<()> {
        let request = pb::AttachNicRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            nic: Some(pb::NicAttachment {
                port_id: nic.port_id.clone(),
                mac_address: nic.mac_address.clone(),
                binding: nic.binding.clone(),
            }),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.attach_nic(request).await })
                .await?,
        )
    }

    async fn detach_nic(&self, op: &OpCtx, vm_id: &str, port_id: &str) -> RpcResult<()> {
        let request = pb::DetachNicRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            port_id: port_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.detach_nic(request).await })
                .await?,
        )
    }

    async fn migrate_vm(
        &self,
        op: &OpCtx,
        vm_id: &str,
        target_uri: &str,
    ) -> RpcResult<mpsc::Receiver<MigrationTick>> {
        let request = pb::MigrateVmRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            target_uri: target_uri.to_string(),
        };
        let mut client = self.client.clone();
        let mut stream = client
            .migrate_vm(request)
            .await
            .map_err(status_to_rpc)?
            .into_inner();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(Ok(progress)) = stream.next().await {
                let tick = MigrationTick {
                    phase: parse_migration_phase(&progress.phase),
                    percent: progress.percent,
                    message: if progress.message.is_empty() {
                        None
                    } else {
                        Some(progress.message)
                    },
                };
                if tx.send(tick).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn ensure_pool(&self, op: &OpCtx, pool_id: &str, backend_json: &str) -> RpcResult<()> {
        let request = pb::EnsurePoolRequest {
            op_id: op.op_id.clone(),
            pool_id: pool_id.to_string(),
            backend_json: backend_json.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.ensure_pool(request).await })
                .await?,
        )
    }

    async fn tear_down_pool(&self, op: &OpCtx, pool_id: &str) -> RpcResult<()> {
        let request = pb::PoolOpRequest {
            op_id: op.op_id.clone(),
            pool_id: pool_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.tear_down_pool(request).await })
                .await?,
        )
    }

    async fn create_volume(&self, op: &OpCtx, params: &VolumeParams) -> RpcResult<()> {
        let request = pb::CreateVolumeRequest {
            op_id: op.op_id.clone(),
            volume_id: params.volume_id.clone(),
            pool_id: params.pool_id.clone(),
            size_gib: params.size_gib,
            source_image_id: params.source_image_id.clone().unwrap_or_default(),
            source_snapshot_id: params.source_snapshot_id.clone().unwrap_or_default(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.create_volume(request).await })
                .await?,
        )
    }

    async fn delete_volume(&self, op: &OpCtx, volume_id: &str, pool_id: &str) -> RpcResult<()> {
        let request = pb::VolumeOpRequest {
            op_id: op.op_id.clone(),
            volume_id: volume_id.to_string(),
            pool_id: pool_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.delete_volume(request).await })
                .await?,
        )
    }

    async fn resize_volume(
        &self,
        op: &OpCtx,
        volume_id: &str,
        pool_id: &str,
        size_gib: u64,
    ) -> RpcResult<()> {
        let request = pb::ResizeVolumeRequest {
            op_id: op.op_id.clone(),
            volume_id: volume_id.to_string(),
            pool_id: pool_id.to_string(),
            size_gib,
        };
        check(
            self.unary(Some(op), |mut c| async move { c.resize_volume(request).await })
                .await?,
        )
    }

    async fn ensure_network(
        &self,
        op: &OpCtx,
        network_id: &str,
        kind: &str,
        segment: u32,
    ) -> RpcResult<()> {
        let request = pb::EnsureNetworkRequest {
            op_id: op.op_id.clone(),
            network_id: network_id.to_string(),
            kind: kind.to_string(),
            segment,
        };
        check(
            self.unary(Some(op), |mut c| async move { c.ensure_network(request).await })
                .await?,
        )
    }

    async fn tear_down_network(&self, op: &OpCtx, network_id: &str) -> RpcResult<()> {
        let request = pb::NetworkOpRequest {
            op_id: op.op_id.clone(),
            network_id: network_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.tear_down_network(request).await })
                .await?,
        )
    }

    async fn create_port(&self, op: &OpCtx, params: &PortParams) -> RpcResult<()> {
        let request = pb::CreatePortRequest {
            op_id: op.op_id.clone(),
            port_id: params.port_id.clone(),
            network_id: params.network_id.clone(),
            mac_address: params.mac_address.clone(),
            ipv4_address: params.ipv4_address.clone().unwrap_or_default(),
            ipv6_address: params.ipv6_address.clone().unwrap_or_default(),
            acl_rules: params.acl_rules.clone(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.create_port(request).await })
                .await?,
        )
    }

    async fn delete_port(&self, op: &OpCtx, port_id: &str) -> RpcResult<()> {
        let request = pb::PortOpRequest {
            op_id: op.op_id.clone(),
            port_id: port_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.delete_port(request).await })
                .await?,
        )
    }

    async fn get_node_info(&self) -> RpcResult<NodeInfo> {
        let mut client = self.client.clone();
        let reply =
            tokio::time::timeout(self.rpc_timeout, client.get_node_info(pb::GetNodeInfoRequest {}))
                .await
                .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
                .map_err(status_to_rpc)?
                .into_inner();
        Ok(NodeInfo {
            hostname: reply.hostname,
            cpu_cores: reply.cpu_cores,
            memory_mib: reply.memory_mib,
            disk_gib: reply.disk_gib,
            numa_nodes: reply.numa_nodes,
            sriov_vfs: reply.sriov_vfs,
        })
    }

    async fn stream_metrics(&self) -> RpcResult<mpsc::Receiver<MetricsSample>> {
        let mut client = self.client.clone();
        let mut stream = client
            .stream_metrics(pb::StreamRequest {})
            .await
            .map_err(status_to_rpc)?
            .into_inner();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(Ok(sample)) = stream.next().await {
                let sample = MetricsSample {
                    timestamp_ms: sample.timestamp_ms,
                    cpu_used_cores: sample.cpu_used_cores,
                    memory_used_mib: sample.memory_used_mib,
                    disk_used_gib: sample.disk_used_gib,
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn stream_events(&self) -> RpcResult<mpsc::Receiver<NodeDaemonEvent>> {
        let mut client = self.client.clone();
        let mut stream = client
            .stream_events(pb::StreamRequest {})
            .await
            .map_err(status_to_rpc)?
            .into_inner();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(Ok(event)) = stream.next().await {
                let mapped = match event.kind.as_str() {
                    "vm_state" => DomainPowerState::parse(&event.detail).map(|state| {
                        NodeDaemonEvent::VmState {
                            vm_id: event.object_id.clone(),
                            state,
                        }
                    }),
                    "vm_crashed" => Some(NodeDaemonEvent::VmCrashed {
                        vm_id: event.object_id.clone(),
                    }),
                    "port_link_up" => Some(NodeDaemonEvent::PortLinkUp {
                        port_id: event.object_id.clone(),
                    }),
                    "pool_degraded" => Some(NodeDaemonEvent::PoolDegraded {
                        pool_id: event.object_id.clone(),
                        detail: event.detail.clone(),
                    }),
                    _ => None,
                };
                if let Some(mapped) = mapped {
                    if tx.send(mapped).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn quiesce_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::GuestRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.quiesce_filesystems(request).await })
                .await?,
        )
    }

    async fn thaw_filesystems(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::GuestRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.thaw_filesystems(request).await })
                .await?,
        )
    }

    async fn sync_guest_time(&self, op: &OpCtx, vm_id: &str) -> RpcResult<()> {
        let request = pb::GuestRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
        };
        check(
            self.unary(Some(op), |mut c| async move { c.sync_guest_time(request).await })
                .await?,
        )
    }

    async fn exec_in_guest(
        &self,
        op: &OpCtx,
        vm_id: &str,
        path: &str,
        args: &[String],
    ) -> RpcResult<ExecResult> {
        let request = pb::ExecInGuestRequest {
            op_id: op.op_id.clone(),
            vm_id: vm_id.to_string(),
            path: path.to_string(),
            args: args.to_vec(),
        };
        let mut client = self.client.clone();
        let reply = tokio::time::timeout(self.budget(Some(op)), client.exec_in_guest(request))
            .await
            .map_err(|_| RpcError::unavailable("rpc deadline exceeded"))?
            .map_err(status_to_rpc)?
            .into_inner();
        Ok(ExecResult {
            exit_code: reply.exit_code,
            stdout: reply.stdout,
            stderr: reply.stderr,
        })
    }
}
