//! Per-node daemon connections.
//!
//! One live [`NodeDaemon`] per node, created on first use after the node
//! turns READY and dropped when the node leaves the fleet. Reconnects are
//! serialized per node; controllers share the handles.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::NodeData;
use crate::store::StoreError;

use super::grpc::GrpcNodeDaemon;
use super::{NodeDaemon, RpcResult};

/// Dials a node daemon. Split out so dev mode can hand out in-process
/// daemons through the same pool.
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    async fn connect(&self, node: &NodeData) -> RpcResult<Arc<dyn NodeDaemon>>;
}

/// Production connector: gRPC to `node.spec.address`.
pub struct GrpcConnector {
    pub rpc_timeout: Duration,
}

#[async_trait]
impl DaemonConnector for GrpcConnector {
    async fn connect(&self, node: &NodeData) -> RpcResult<Arc<dyn NodeDaemon>> {
        let daemon = GrpcNodeDaemon::connect(&node.spec.address, self.rpc_timeout).await?;
        Ok(Arc::new(daemon))
    }
}

pub struct NodePool {
    connector: Arc<dyn DaemonConnector>,
    /// node id -> live daemon. The mutex also serializes reconnects.
    daemons: Mutex<HashMap<String, Arc<dyn NodeDaemon>>>,
}

impl NodePool {
    pub fn new(connector: Arc<dyn DaemonConnector>) -> Self {
        Self {
            connector,
            daemons: Mutex::new(HashMap::new()),
        }
    }

    /// Daemon handle for a node, connecting on first use.
    pub async fn daemon(&self, node: &NodeData) -> Result<Arc<dyn NodeDaemon>, StoreError> {
        let mut daemons = self.daemons.lock().await;
        if let Some(d) = daemons.get(&node.meta.id) {
            return Ok(d.clone());
        }
        debug!(node = %node.meta.id, address = %node.spec.address, "connecting node daemon");
        let daemon = self
            .connector
            .connect(node)
            .await
            .map_err(StoreError::from)?;
        daemons.insert(node.meta.id.clone(), daemon.clone());
        Ok(daemon)
    }

    /// Daemon handle without a connect attempt.
    pub async fn existing(&self, node_id: &str) -> Option<Arc<dyn NodeDaemon>> {
        self.daemons.lock().await.get(node_id).cloned()
    }

    /// Drop a connection (node removed, stream loss, fencing). The next call
    /// reconnects.
    pub async fn remove(&self, node_id: &str) {
        self.daemons.lock().await.remove(node_id);
    }

    pub async fn connected_nodes(&self) -> Vec<String> {
        self.daemons.lock().await.keys().cloned().collect()
    }
}
