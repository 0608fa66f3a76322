//! Controller harness.
//!
//! Every controller follows the same loop: pull a key from its queue, load
//! the object, drive one step of its state machine, CAS-write status, and
//! classify errors into retry-with-backoff or terminal. A pass is bounded
//! by the reconcile deadline and canceled the moment leadership is lost;
//! in-flight node RPCs are idempotent by op id, so the next pass converges.

pub mod edge;
pub mod image;
pub mod network;
pub mod pool;
pub mod port;
pub mod snapshot;
pub mod vm;
pub mod volume;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::elector::LeaderState;
use crate::eventbus::Queues;
use crate::model::{
    FloatingIpData, ImageData, LoadBalancerData, NodeData, PortData, Resource, SchedulingPolicy,
    StoragePoolData, VirtualNetworkData, VmData, VolumeData, VolumeSnapshotData,
};
use crate::nodeclient::{NodeDaemon, NodePool, OpCtx, derived_op_id};
use crate::queue::WorkQueue;
use crate::registries::Registries;
use crate::store::kv::Fence;
use crate::store::registry::{Registry, RegistryEvent};
use crate::store::{Result, StoreError};

/// Timing and policy knobs shared by all controllers.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconcile_timeout: Duration,
    pub rpc_timeout: Duration,
    pub stop_grace: Duration,
    pub resync_interval: Duration,
    pub migration_timeout: Duration,
    pub default_policy: SchedulingPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(15),
            stop_grace: Duration::from_secs(30),
            resync_interval: Duration::from_secs(60),
            migration_timeout: Duration::from_secs(30 * 60),
            default_policy: SchedulingPolicy::Balanced,
        }
    }
}

/// Shared state handed to every controller.
#[derive(Clone)]
pub struct Ctx {
    pub regs: Registries,
    pub pool: Arc<NodePool>,
    pub queues: Arc<Queues>,
    pub leader: watch::Receiver<LeaderState>,
    pub cfg: ControllerConfig,
}

fn with_fence<R: Resource>(reg: &Registry<R>, fence: Option<Fence>) -> Registry<R> {
    match fence {
        Some(f) => reg.fenced(f),
        None => reg.clone(),
    }
}

impl Ctx {
    pub fn fence(&self) -> Option<Fence> {
        self.leader.borrow().fence().cloned()
    }

    // Fenced registries: controller writes die with the leadership that
    // issued them.
    pub fn vms(&self) -> Registry<VmData> {
        with_fence(&self.regs.vms, self.fence())
    }

    pub fn nodes(&self) -> Registry<NodeData> {
        with_fence(&self.regs.nodes, self.fence())
    }

    pub fn networks(&self) -> Registry<VirtualNetworkData> {
        with_fence(&self.regs.networks, self.fence())
    }

    pub fn ports(&self) -> Registry<PortData> {
        with_fence(&self.regs.ports, self.fence())
    }

    pub fn volumes(&self) -> Registry<VolumeData> {
        with_fence(&self.regs.volumes, self.fence())
    }

    pub fn pools(&self) -> Registry<StoragePoolData> {
        with_fence(&self.regs.pools, self.fence())
    }

    pub fn snapshots(&self) -> Registry<VolumeSnapshotData> {
        with_fence(&self.regs.snapshots, self.fence())
    }

    pub fn images(&self) -> Registry<ImageData> {
        with_fence(&self.regs.images, self.fence())
    }

    pub fn floating_ips(&self) -> Registry<FloatingIpData> {
        with_fence(&self.regs.floating_ips, self.fence())
    }

    pub fn load_balancers(&self) -> Registry<LoadBalancerData> {
        with_fence(&self.regs.load_balancers, self.fence())
    }

    /// Node plus a live daemon handle for it.
    pub async fn daemon(&self, node_id: &str) -> Result<(NodeData, Arc<dyn NodeDaemon>)> {
        let node = self
            .regs
            .nodes
            .get_by_id(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        let daemon = self.pool.daemon(&node).await?;
        Ok((node, daemon))
    }

    /// Op context with a stable id: retries and successor leaders re-issue
    /// the identical op and the daemon dedups it.
    pub fn op(&self, object_id: &str, action: &str, generation: u64) -> OpCtx {
        OpCtx::new(derived_op_id(object_id, action, generation), self.cfg.rpc_timeout)
    }
}

/// What a successful pass wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Steady state reached (or nothing to do).
    Done,
    /// Progress made or long operation in flight; look again after a delay.
    RequeueAfter(Duration),
}

/// One reconciler. Keys are object ids.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    fn kind(&self) -> &'static str;
    async fn reconcile(&self, id: &str) -> Result<Outcome>;
}

/// Resolves when the leadership epoch identified by `fence` ends.
async fn epoch_ended(mut leader: watch::Receiver<LeaderState>, fence: Option<Fence>) {
    loop {
        {
            let current = leader.borrow();
            if current.fence().cloned() != fence {
                return;
            }
        }
        if leader.changed().await.is_err() {
            return;
        }
    }
}

/// Drives one controller: watch pump, periodic resync, and worker tasks.
pub struct ControllerRunner<R: Resource> {
    pub controller: Arc<dyn Controller>,
    pub registry: Registry<R>,
    pub queue: Arc<WorkQueue>,
    pub leader: watch::Receiver<LeaderState>,
    pub cfg: ControllerConfig,
    pub workers: usize,
}

impl<R: Resource> ControllerRunner<R> {
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Watch pump: store changes become queue items.
        {
            let registry = self.registry.clone();
            let queue = self.queue.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut events = match registry.watch().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        error!(kind = R::KIND, "watch failed: {e}");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(RegistryEvent::Applied(obj)) => queue.add(&obj.meta().id),
                            Some(RegistryEvent::Deleted { key }) => {
                                if let Some(id) = key.rsplit('/').next() {
                                    queue.add(id);
                                }
                            }
                            Some(RegistryEvent::Resync) => {
                                if let Ok(objs) = registry.list(None, None).await {
                                    for obj in objs {
                                        queue.add(&obj.meta().id);
                                    }
                                }
                            }
                            None => return,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        // Resync: full re-list on promotion and on a timer, so dropped
        // triggers and capacity-waiters are never stuck forever.
        {
            let registry = self.registry.clone();
            let queue = self.queue.clone();
            let mut leader = self.leader.clone();
            let mut shutdown = shutdown.clone();
            let interval = self.cfg.resync_interval;
            handles.push(tokio::spawn(async move {
                loop {
                    let leading = leader.borrow().is_leading();
                    if leading {
                        if let Ok(objs) = registry.list(None, None).await {
                            debug!(kind = R::KIND, count = objs.len(), "resync");
                            for obj in objs {
                                queue.add(&obj.meta().id);
                            }
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        r = leader.changed() => {
                            if r.is_err() {
                                return;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        // Workers.
        for worker in 0..self.workers.max(1) {
            let controller = self.controller.clone();
            let queue = self.queue.clone();
            let leader = self.leader.clone();
            let cfg = self.cfg.clone();
            handles.push(tokio::spawn(async move {
                info!(kind = controller.kind(), worker, "controller worker started");
                while let Some(token) = queue.get().await {
                    let key = token.key.clone();

                    let fence = {
                        let state = leader.borrow();
                        if !state.is_leading() {
                            // Standby replicas drain without processing; the
                            // promotion resync rebuilds the queue.
                            queue.done(token);
                            continue;
                        }
                        state.fence().cloned()
                    };

                    let pass = tokio::select! {
                        r = tokio::time::timeout(cfg.reconcile_timeout, controller.reconcile(&key)) => {
                            match r {
                                Ok(r) => r,
                                Err(_) => Err(StoreError::Unavailable(
                                    "reconcile deadline exceeded".to_string(),
                                )),
                            }
                        }
                        _ = epoch_ended(leader.clone(), fence) => {
                            Err(StoreError::Unavailable("leadership revoked".to_string()))
                        }
                    };

                    match pass {
                        Ok(Outcome::Done) => {
                            queue.forget(&key);
                            queue.done(token);
                        }
                        Ok(Outcome::RequeueAfter(delay)) => {
                            queue.forget(&key);
                            queue.done(token);
                            queue.add_after(&key, delay);
                        }
                        Err(e) if e.is_retryable() => {
                            debug!(kind = controller.kind(), key, "retryable: {e}");
                            queue.retry(token);
                        }
                        Err(e) => {
                            // Terminal: the controller has already written
                            // ERROR status; wait for spec change or event.
                            warn!(kind = controller.kind(), key, "terminal: {e}");
                            queue.done(token);
                        }
                    }
                }
            }));
        }

        handles
    }
}
