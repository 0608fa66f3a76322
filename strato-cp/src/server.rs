//! Control-plane assembly.
//!
//! Wires the store, registries, elector, queues, controllers, event bus,
//! HA supervisor, and admission into one runnable unit. `main` and the
//! test server both start here; dev mode additionally seeds a loopback
//! fleet so the whole reconcile path runs in-process.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::admission::{Admission, RegisterNodeRequest};
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::controller::{
    ControllerRunner, Ctx,
    edge::{FloatingIpController, LoadBalancerController},
    image::ImageController,
    network::NetworkController,
    pool::PoolController,
    port::PortController,
    snapshot::SnapshotController,
    vm::VmController,
    volume::VolumeController,
};
use crate::elector::LeaderElector;
use crate::eventbus::{EventBus, Queues};
use crate::ha::HaSupervisor;
use crate::model::{ClusterData, NodeData};
use crate::nodeclient::loopback::{LoopbackConnector, LoopbackDaemon, LoopbackFabric};
use crate::nodeclient::pool::{DaemonConnector, GrpcConnector};
use crate::nodeclient::{NodeInfo, NodePool};
use crate::registries::Registries;
use crate::rest::AppState;
use crate::store::kv::KvStore;
use crate::store::{Result, StoreError};

/// A running control plane (minus the HTTP listener, which the caller
/// binds).
pub struct ControlPlane {
    pub state: Arc<AppState>,
    pub ctx: Ctx,
    pub kv: Arc<dyn KvStore>,
    pub admission: Arc<Admission>,
    pub queues: Arc<Queues>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    pub async fn start(
        cfg: &Config,
        kv: Arc<dyn KvStore>,
        connector: Arc<dyn DaemonConnector>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self> {
        let regs = Registries::new(kv.clone());
        let queues = Queues::new();
        let pool = Arc::new(NodePool::new(connector));
        let admission = Arc::new(Admission::new(
            regs.clone(),
            kv.clone(),
            audit.clone(),
            cfg.t_alive,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Leader election gates every controller.
        let (elector, leader_rx) = LeaderElector::new(kv.clone(), "main", cfg.lease_ttl);
        let mut handles = vec![tokio::spawn(elector.run(shutdown_rx.clone()))];

        let ctx = Ctx {
            regs: regs.clone(),
            pool: pool.clone(),
            queues: queues.clone(),
            leader: leader_rx.clone(),
            cfg: cfg.controller(),
        };

        // Controllers.
        let workers = cfg.controller_workers.max(1);
        handles.extend(
            ControllerRunner {
                controller: Arc::new(VmController::new(ctx.clone())),
                registry: regs.vms.clone(),
                queue: queues.vm.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers: workers * 2,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(NetworkController::new(ctx.clone())),
                registry: regs.networks.clone(),
                queue: queues.network.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(PortController::new(ctx.clone())),
                registry: regs.ports.clone(),
                queue: queues.port.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(VolumeController::new(ctx.clone())),
                registry: regs.volumes.clone(),
                queue: queues.volume.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(PoolController::new(ctx.clone())),
                registry: regs.pools.clone(),
                queue: queues.pool.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(SnapshotController::new(ctx.clone())),
                registry: regs.snapshots.clone(),
                queue: queues.snapshot.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(ImageController::new(ctx.clone())),
                registry: regs.images.clone(),
                queue: queues.image.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(FloatingIpController::new(ctx.clone())),
                registry: regs.floating_ips.clone(),
                queue: queues.floating_ip.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );
        handles.extend(
            ControllerRunner {
                controller: Arc::new(LoadBalancerController::new(ctx.clone())),
                registry: regs.load_balancers.clone(),
                queue: queues.load_balancer.clone(),
                leader: leader_rx.clone(),
                cfg: cfg.controller(),
                workers,
            }
            .spawn(shutdown_rx.clone()),
        );

        // Event bus and HA supervision.
        let bus = EventBus::new(regs.clone(), pool.clone(), queues.clone());
        handles.push(tokio::spawn(bus.run(shutdown_rx.clone())));
        let ha = HaSupervisor::new(ctx.clone(), kv.clone(), cfg.ha());
        handles.push(tokio::spawn(ha.run(shutdown_rx.clone())));
        handles.push(tokio::spawn(crate::admission::quota::run_reconciler(
            ctx.clone(),
            shutdown_rx.clone(),
        )));

        let state = Arc::new(AppState {
            regs,
            admission: admission.clone(),
            audit,
            queues: queues.clone(),
            leader: leader_rx,
            cfg: cfg.controller(),
        });

        Ok(Self {
            state,
            ctx,
            kv,
            admission,
            queues,
            shutdown_tx,
            handles,
        })
    }

    /// Stop controllers, release leadership, drain workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.queues.shut_down();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("control plane stopped");
    }
}

/// A simulated fleet for dev mode and tests.
pub struct DevFleet {
    pub fabric: Arc<LoopbackFabric>,
    pub cluster: ClusterData,
    pub nodes: Vec<NodeData>,
    pub token: String,
}

/// Default shape of a simulated host.
pub fn dev_node_info(name: &str) -> NodeInfo {
    NodeInfo {
        hostname: name.to_string(),
        cpu_cores: 32,
        memory_mib: 131072,
        disk_gib: 1024,
        numa_nodes: 2,
        sriov_vfs: 0,
    }
}

/// One loopback host: daemon in the fabric, real token-gated registration,
/// and a background heartbeat that stops beating while the daemon is
/// unreachable (which is how tests trigger fencing).
pub async fn add_dev_node(
    cp: &ControlPlane,
    fabric: &Arc<LoopbackFabric>,
    cluster_id: &str,
    token: &str,
    name: &str,
    info: NodeInfo,
    shutdown: watch::Receiver<bool>,
) -> Result<NodeData> {
    let daemon = LoopbackDaemon::new(name, info.clone());
    fabric.register(daemon);

    let node = cp
        .admission
        .register_node(
            token,
            RegisterNodeRequest {
                name: name.to_string(),
                address: format!("loopback://{name}"),
                cluster_id: cluster_id.to_string(),
                registration_nonce: format!("{name}-nonce"),
                capacity: info.capacity(),
                labels: Default::default(),
            },
        )
        .await?;
    // First heartbeat brings the node READY.
    let node = cp.admission.heartbeat(&node.meta.id, None, None).await?;

    let admission = cp.admission.clone();
    let fabric = fabric.clone();
    let hb_name = name.to_string();
    let hb_id = node.meta.id.clone();
    let interval = cp.admission.t_alive / 3;
    let mut shutdown = shutdown;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            let beating = fabric
                .daemon(&hb_name)
                .map(|d| !d.is_unreachable())
                .unwrap_or(false);
            if beating {
                let _ = admission.heartbeat(&hb_id, None, None).await;
            }
        }
    });

    Ok(node)
}

/// Stand up `n` identical loopback hosts behind one cluster and join token.
pub async fn seed_dev_fleet(
    cp: &ControlPlane,
    fabric: Arc<LoopbackFabric>,
    n: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<DevFleet> {
    // One cluster with HA on.
    let mut cluster = ClusterData::default();
    cluster.meta.name = "default".to_string();
    cluster.spec.ha_enabled = true;
    let cluster = cp.ctx.regs.clusters.create(cluster).await?;

    // A multi-use join token.
    let secret = crate::admission::token::generate();
    let mut token = crate::model::RegistrationTokenData::default();
    token.meta.name = "dev-join".to_string();
    token.spec.secret = secret.clone();
    token.spec.max_uses = 0;
    cp.ctx.regs.tokens.create(token).await?;

    let mut nodes = Vec::new();
    for i in 0..n {
        let name = format!("dev-{i}");
        let node = add_dev_node(
            cp,
            &fabric,
            &cluster.meta.id,
            &secret,
            &name,
            dev_node_info(&name),
            shutdown.clone(),
        )
        .await?;
        nodes.push(node);
    }

    info!(nodes = n, "dev fleet ready");
    Ok(DevFleet {
        fabric,
        cluster,
        nodes,
        token: secret,
    })
}

/// Pick the connector for the configured mode.
pub fn make_connector(cfg: &Config, fabric: Option<Arc<LoopbackFabric>>) -> Arc<dyn DaemonConnector> {
    match fabric {
        Some(fabric) => Arc::new(LoopbackConnector { fabric }),
        None => Arc::new(GrpcConnector {
            rpc_timeout: cfg.rpc_timeout,
        }),
    }
}

/// The only supported store scheme today is `memory`; a replicated backend
/// plugs in behind [`KvStore`].
pub fn make_store(cfg: &Config) -> Result<Arc<dyn KvStore>> {
    match cfg.store.as_str() {
        "memory" => Ok(Arc::new(crate::store::MemStore::new())),
        other => Err(StoreError::InvalidArgument(format!(
            "unsupported store '{other}' (expected 'memory')"
        ))),
    }
}
