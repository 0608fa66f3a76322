//! Node event fan-in.
//!
//! One stream task per connected node turns daemon events into reconcile
//! triggers on the owning controller's queue. Events are advisory: they
//! accelerate reconciliation, the store stays the source of truth. Stream
//! loss drops the pooled connection and forces a reconcile of everything
//! believed to live on that node.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::model::{NodeData, NodeState};
use crate::nodeclient::{NodeDaemonEvent, NodePool};
use crate::queue::WorkQueue;
use crate::registries::Registries;

/// The per-controller work queues, shared so controllers and the bus can
/// trigger each other.
pub struct Queues {
    pub vm: Arc<WorkQueue>,
    pub network: Arc<WorkQueue>,
    pub port: Arc<WorkQueue>,
    pub volume: Arc<WorkQueue>,
    pub pool: Arc<WorkQueue>,
    pub snapshot: Arc<WorkQueue>,
    pub image: Arc<WorkQueue>,
    pub floating_ip: Arc<WorkQueue>,
    pub load_balancer: Arc<WorkQueue>,
}

impl Queues {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vm: Arc::new(WorkQueue::default()),
            network: Arc::new(WorkQueue::default()),
            port: Arc::new(WorkQueue::default()),
            volume: Arc::new(WorkQueue::default()),
            pool: Arc::new(WorkQueue::default()),
            snapshot: Arc::new(WorkQueue::default()),
            image: Arc::new(WorkQueue::default()),
            floating_ip: Arc::new(WorkQueue::default()),
            load_balancer: Arc::new(WorkQueue::default()),
        })
    }

    pub fn shut_down(&self) {
        self.vm.shut_down();
        self.network.shut_down();
        self.port.shut_down();
        self.volume.shut_down();
        self.pool.shut_down();
        self.snapshot.shut_down();
        self.image.shut_down();
        self.floating_ip.shut_down();
        self.load_balancer.shut_down();
    }
}

pub struct EventBus {
    regs: Registries,
    pool: Arc<NodePool>,
    queues: Arc<Queues>,
    streaming: Arc<Mutex<HashSet<String>>>,
    /// Consecutive stream failures per node, for reconnect backoff.
    failures: Arc<Mutex<HashMap<String, u32>>>,
    sweep_interval: Duration,
}

impl EventBus {
    pub fn new(regs: Registries, pool: Arc<NodePool>, queues: Arc<Queues>) -> Self {
        Self {
            regs,
            pool,
            queues,
            streaming: Arc::new(Mutex::new(HashSet::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            sweep_interval: Duration::from_secs(2),
        }
    }

    /// Periodically ensure a stream task exists for every READY node.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let nodes = self.regs.nodes.list(None, None).await.unwrap_or_default();
            for node in nodes {
                if node.status.state != NodeState::Ready {
                    continue;
                }
                let already = {
                    let streaming = self.streaming.lock().expect("bus lock");
                    streaming.contains(&node.meta.id)
                };
                if !already {
                    self.spawn_stream(node);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn spawn_stream(&self, node: NodeData) {
        let node_id = node.meta.id.clone();
        {
            let mut streaming = self.streaming.lock().expect("bus lock");
            if !streaming.insert(node_id.clone()) {
                return;
            }
        }

        let pool = self.pool.clone();
        let queues = self.queues.clone();
        let regs = self.regs.clone();
        let streaming = self.streaming.clone();
        let failures = self.failures.clone();

        tokio::spawn(async move {
            let result = async {
                let daemon = pool.daemon(&node).await?;
                let mut events = daemon
                    .stream_events()
                    .await
                    .map_err(crate::store::StoreError::from)?;
                info!(node = %node_id, "event stream open");
                failures.lock().expect("bus lock").remove(&node_id);

                // Metrics ride the same connection; samples refresh the
                // node's observed usage. Dies with the event stream.
                if let Ok(mut metrics) = daemon.stream_metrics().await {
                    let regs = regs.clone();
                    let usage_node = node_id.clone();
                    tokio::spawn(async move {
                        while let Some(sample) = metrics.recv().await {
                            let _ = regs
                                .nodes
                                .patch_status("", &usage_node, |n| {
                                    n.status.usage.cpu_used_cores = sample.cpu_used_cores;
                                    n.status.usage.memory_used_mib = sample.memory_used_mib;
                                    n.status.usage.disk_used_gib = sample.disk_used_gib;
                                    Ok(())
                                })
                                .await;
                        }
                    });
                }

                while let Some(event) = events.recv().await {
                    dispatch(&queues, event);
                }
                Ok::<_, crate::store::StoreError>(())
            }
            .await;

            // Exponential reconnect: the next sweep may not re-spawn until
            // the hold-off elapses.
            let hold_off = if let Err(e) = result {
                warn!(node = %node_id, "event stream failed: {e}");
                let mut failures = failures.lock().expect("bus lock");
                let n = failures.entry(node_id.clone()).or_insert(0);
                *n += 1;
                Duration::from_secs(1u64 << (*n).min(6))
            } else {
                debug!(node = %node_id, "event stream closed");
                Duration::ZERO
            };

            // Connection identity is gone; drop it and force-reconcile every
            // object believed to live on this node.
            pool.remove(&node_id).await;
            force_reconcile_node(&regs, &queues, &node_id).await;
            if !hold_off.is_zero() {
                tokio::time::sleep(hold_off).await;
            }
            streaming.lock().expect("bus lock").remove(&node_id);
        });
    }
}

fn dispatch(queues: &Queues, event: NodeDaemonEvent) {
    match event {
        NodeDaemonEvent::VmState { vm_id, .. } | NodeDaemonEvent::VmCrashed { vm_id } => {
            queues.vm.add(&vm_id);
        }
        NodeDaemonEvent::PortLinkUp { port_id } => {
            queues.port.add(&port_id);
        }
        NodeDaemonEvent::PoolDegraded { pool_id, .. } => {
            queues.pool.add(&pool_id);
        }
    }
}

/// Enqueue every VM bound to the node and every pool assigned to it; their
/// controllers re-list remote state on the next pass.
pub async fn force_reconcile_node(regs: &Registries, queues: &Queues, node_id: &str) {
    if let Ok(vms) = regs.vms.list(None, None).await {
        for vm in vms {
            if vm.status.node_id.as_deref() == Some(node_id) {
                queues.vm.add(&vm.meta.id);
            }
        }
    }
    if let Ok(pools) = regs.pools.list(None, None).await {
        for pool in pools {
            if pool.spec.assigned_nodes.iter().any(|n| n == node_id) {
                queues.pool.add(&pool.meta.id);
            }
        }
    }
}

/// Enqueue every VM in ERROR that is waiting for capacity; called when any
/// node's capacity changes (join, recovery, VM teardown).
pub async fn requeue_capacity_waiters(regs: &Registries, queues: &Queues) {
    if let Ok(vms) = regs.vms.list(None, None).await {
        for vm in vms {
            if vm.status.reason.as_deref() == Some("no_capacity")
                || vm.status.reason.as_deref() == Some("no_fit")
            {
                queues.vm.add(&vm.meta.id);
            }
        }
    }
}

