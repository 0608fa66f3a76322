//! Shared test utilities for strato-cp integration tests.

#![allow(dead_code)]

use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

use strato_cp::audit::AuditLogger;
use strato_cp::config::Config;
use strato_cp::nodeclient::NodeInfo;
use strato_cp::nodeclient::loopback::LoopbackFabric;
use strato_cp::rest::create_router;
use strato_cp::server::{ControlPlane, DevFleet, add_dev_node, make_connector, seed_dev_fleet};
use strato_cp::store::MemStore;

/// Timings compressed for tests: fencing fires in well under a second.
pub fn test_config() -> Config {
    Config {
        lease_ttl: Duration::from_millis(600),
        reconcile_timeout: Duration::from_secs(10),
        rpc_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(2),
        resync_interval: Duration::from_millis(800),
        t_alive: Duration::from_millis(300),
        t_fence: Duration::from_millis(700),
        dev: true,
        ..Default::default()
    }
}

/// Single-process control plane with a loopback fleet and a bound REST
/// listener.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub fleet: DevFleet,
    cp: Option<ControlPlane>,
    rest_shutdown: tokio::sync::oneshot::Sender<()>,
    fleet_shutdown: watch::Sender<bool>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_nodes(2).await
    }

    pub async fn spawn_with_nodes(n: usize) -> Self {
        let cfg = test_config();
        let kv = Arc::new(MemStore::new());
        let fabric = LoopbackFabric::new();
        let connector = make_connector(&cfg, Some(fabric.clone()));
        let audit = Arc::new(AuditLogger::new_noop());

        let cp = ControlPlane::start(&cfg, kv, connector, audit)
            .await
            .expect("control plane start");

        let (fleet_shutdown, fleet_shutdown_rx) = watch::channel(false);
        let fleet = seed_dev_fleet(&cp, fabric, n, fleet_shutdown_rx)
            .await
            .expect("dev fleet");

        // Wait for leadership so controllers actually run.
        let mut leader = cp.state.leader.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !leader.borrow().is_leading() {
                leader.changed().await.expect("elector alive");
            }
        })
        .await
        .expect("leader election");

        let router = create_router(cp.state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let (rest_shutdown, rest_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rest_shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        // Small delay so the listener is accepting.
        tokio::time::sleep(Duration::from_millis(30)).await;

        Self {
            addr,
            client: Client::new(),
            fleet,
            cp: Some(cp),
            rest_shutdown,
            fleet_shutdown,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api/v1", self.addr)
    }

    pub fn control_plane(&self) -> &ControlPlane {
        self.cp.as_ref().expect("control plane running")
    }

    /// Join another simulated host mid-test.
    pub async fn add_node(&self, name: &str, info: NodeInfo) -> String {
        let node = add_dev_node(
            self.control_plane(),
            &self.fleet.fabric,
            &self.fleet.cluster.meta.id,
            &self.fleet.token,
            name,
            info,
            self.fleet_shutdown.subscribe(),
        )
        .await
        .expect("add node");
        node.meta.id.clone()
    }

    /// Stop a host's heartbeats and fail its daemon calls.
    pub fn kill_node(&self, name: &str) {
        self.fleet
            .fabric
            .daemon(name)
            .expect("daemon exists")
            .set_unreachable(true);
    }

    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("request failed")
    }

    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("request failed")
    }

    pub async fn patch_json<T: Serialize>(
        &self,
        path: &str,
        revision: u64,
        body: &T,
    ) -> ReqwestResponse {
        self.client
            .patch(format!("{}{}", self.base_url(), path))
            .header("If-Match", revision.to_string())
            .json(body)
            .send()
            .await
            .expect("request failed")
    }

    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("request failed")
    }

    /// Poll `path` until `pred` holds on the JSON body, or panic after
    /// `timeout`.
    pub async fn wait_for<F>(&self, path: &str, timeout: Duration, pred: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = Value::Null;
        while tokio::time::Instant::now() < deadline {
            let response = self.get(path).await;
            if response.status().is_success() {
                let body: Value = response.json().await.expect("json body");
                if pred(&body) {
                    return body;
                }
                last = body;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting on {path}; last observation: {last}");
    }

    /// Poll until `path` answers 404.
    pub async fn wait_gone(&self, path: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.get(path).await.status() == 404 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("{path} still present after {timeout:?}");
    }

    pub async fn shutdown(mut self) {
        let _ = self.rest_shutdown.send(());
        let _ = self.fleet_shutdown.send(true);
        if let Some(cp) = self.cp.take() {
            cp.shutdown().await;
        }
    }
}

/// Convenience builders for request bodies.
pub mod bodies {
    use serde_json::{Value, json};

    pub fn project(id: &str) -> Value {
        json!({ "id": id })
    }

    pub fn nfs_pool(name: &str, nodes: &[&str]) -> Value {
        json!({
            "name": name,
            "spec": {
                "backend": { "type": "nfs", "server": "10.0.0.1", "export": "/srv/vm" },
                "assigned_nodes": nodes,
            }
        })
    }

    pub fn network(name: &str, cidr: &str) -> Value {
        json!({
            "name": name,
            "spec": {
                "kind": { "type": "overlay", "vni": 0 },
                "ipv4_cidr": cidr,
            }
        })
    }

    pub fn vm(name: &str, cores: u32, memory_mib: u64, pool_id: &str, network_id: &str) -> Value {
        json!({
            "name": name,
            "spec": {
                "cpu_cores": cores,
                "memory_mib": memory_mib,
                "disks": [ { "pool_id": pool_id, "size_gib": 20 } ],
                "nics": [ { "network_id": network_id } ],
                "run_state": "running",
            }
        })
    }
}
