//! Admission: the pre-write gate on every client-initiated mutation.
//!
//! Order: identity (left to the deployment's auth proxy, hook kept here),
//! policy rules, quota, and, for node joins, the registration-token gate.
//! Everything here happens before the registry write; controllers never
//! pass through admission.

pub mod policy;
pub mod quota;
pub mod token;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::audit::AuditLogger;
use crate::ha::alive_lease_key;
use crate::model::{
    NodeCapacity, NodeData, NodeState, NodeUsage, RegistrationTokenData, now_rfc3339,
};
use crate::registries::Registries;
use crate::store::kv::KvStore;
use crate::store::{Result, StoreError};

pub use quota::QuotaDelta;

/// One admission-checked write.
pub struct AdmissionRequest<'a> {
    pub kind: &'static str,
    pub verb: &'a str,
    pub project_id: &'a str,
    pub labels: &'a HashMap<String, String>,
    pub delta: QuotaDelta,
}

/// Parameters of a node join.
#[derive(Debug, Clone)]
pub struct RegisterNodeRequest {
    pub name: String,
    pub address: String,
    pub cluster_id: String,
    /// Physical identity; a re-join with a known nonce updates in place.
    pub registration_nonce: String,
    pub capacity: NodeCapacity,
    pub labels: HashMap<String, String>,
}

pub struct Admission {
    regs: Registries,
    kv: Arc<dyn KvStore>,
    audit: Arc<AuditLogger>,
    /// Liveness lease TTL granted per heartbeat.
    pub t_alive: Duration,
}

impl Admission {
    pub fn new(
        regs: Registries,
        kv: Arc<dyn KvStore>,
        audit: Arc<AuditLogger>,
        t_alive: Duration,
    ) -> Self {
        Self {
            regs,
            kv,
            audit,
            t_alive,
        }
    }

    /// Gate a client write. Returns policy warnings to annotate the
    /// response with.
    pub async fn check(&self, req: &AdmissionRequest<'_>) -> Result<Vec<String>> {
        // Policy rules live on the cluster object.
        let clusters = self.regs.clusters.list(None, None).await?;
        let rules = clusters
            .first()
            .map(|c| c.spec.policy_rules.clone())
            .unwrap_or_default();
        let warnings = match policy::evaluate(&rules, req.kind, req.verb, req.labels) {
            policy::PolicyDecision::Allow { warnings } => warnings,
            policy::PolicyDecision::Deny { rule, message } => {
                self.audit.denied(req.kind, req.verb, &rule);
                return Err(StoreError::PermissionDenied(message));
            }
        };

        // Quota applies to resource-consuming creates and grows.
        let has_delta = req.delta.vms > 0
            || req.delta.vcpus > 0
            || req.delta.memory_mib > 0
            || req.delta.volume_gib > 0;
        if has_delta && !req.project_id.is_empty() {
            if let Some(project) = self.regs.projects.get_by_id(req.project_id).await? {
                let used = quota::usage(&self.regs, req.project_id).await?;
                if let Err(e) = quota::check(&project.spec.quota, &used, &req.delta) {
                    self.audit.denied(req.kind, req.verb, e.reason());
                    return Err(e);
                }
            }
        }

        Ok(warnings)
    }

    /// Find the stored token matching a presented secret. Constant-time
    /// comparison per candidate.
    async fn find_token(&self, presented: &str) -> Result<Option<RegistrationTokenData>> {
        let tokens = self.regs.tokens.list(None, None).await?;
        Ok(tokens
            .into_iter()
            .find(|t| token::constant_time_eq(&t.spec.secret, presented)))
    }

    /// Token-gated node registration. Exactly one concurrent join can
    /// consume the last use of a token: the redeem is a CAS patch that
    /// re-validates inside the retry loop.
    pub async fn register_node(
        &self,
        presented_token: &str,
        req: RegisterNodeRequest,
    ) -> Result<NodeData> {
        let now = chrono::Utc::now();
        let Some(token) = self.find_token(presented_token).await? else {
            self.audit.denied("node", "register", "token_unknown");
            return Err(StoreError::PermissionDenied(
                "registration token not recognized".to_string(),
            ));
        };
        if !token.is_valid(&now) {
            self.audit.denied("node", "register", "token_exhausted");
            return Err(StoreError::PermissionDenied(
                "token_exhausted: registration token is expired, revoked, or used up".to_string(),
            ));
        }

        // One Node per physical identity: adopt on nonce match.
        let existing = self
            .regs
            .nodes
            .list(None, None)
            .await?
            .into_iter()
            .find(|n| n.spec.registration_nonce == req.registration_nonce);

        let (node, created) = match existing {
            Some(node) => {
                let updated = self
                    .regs
                    .nodes
                    .patch_spec("", &node.meta.id, |n| {
                        n.spec.address = req.address.clone();
                        n.spec.cluster_id = req.cluster_id.clone();
                        Ok(())
                    })
                    .await?;
                let updated = self
                    .regs
                    .nodes
                    .patch_status("", &updated.meta.id, |n| {
                        n.status.capacity = req.capacity.clone();
                        n.status.last_heartbeat = now_rfc3339();
                        Ok(())
                    })
                    .await?;
                info!(node = %updated.meta.id, "node re-registered");
                (updated, false)
            }
            None => {
                let mut node = NodeData::default();
                node.meta.name = req.name.clone();
                node.meta.labels = req.labels.clone();
                node.spec.address = req.address.clone();
                node.spec.cluster_id = req.cluster_id.clone();
                node.spec.registration_nonce = req.registration_nonce.clone();
                node.status.state = NodeState::Registering;
                node.status.capacity = req.capacity.clone();
                node.status.last_heartbeat = now_rfc3339();
                (self.regs.nodes.create(node).await?, true)
            }
        };

        // Redeem under CAS; the closure re-validates so a concurrent join
        // cannot push use_count past max_uses.
        let node_id = node.meta.id.clone();
        let redeemed = self
            .regs
            .tokens
            .patch_status("", &token.meta.id, |t| {
                if !t.is_valid(&now) {
                    return Err(StoreError::PermissionDenied(
                        "token_exhausted: registration token is expired, revoked, or used up"
                            .to_string(),
                    ));
                }
                if !t.status.used_by_nodes.contains(&node_id) {
                    t.status.use_count += 1;
                    t.status.used_by_nodes.push(node_id.clone());
                }
                Ok(())
            })
            .await;

        if let Err(e) = redeemed {
            // Compensate: a node we created for a failed join must not
            // linger half-registered.
            if created {
                let _ = self.regs.nodes.remove("", &node.meta.id).await;
            }
            self.audit.denied("node", "register", "token_exhausted");
            return Err(e);
        }

        // Seed liveness so the fencing gate has something to watch.
        self.kv
            .keep_lease_alive(&alive_lease_key(&node.meta.id), self.t_alive)
            .await?;

        self.audit
            .node_registered(&node.meta.id, &node.meta.name, &token.meta.id);
        Ok(node)
    }

    /// Node heartbeat: renew the liveness lease and refresh reported usage.
    /// REGISTERING and OFFLINE nodes come (back) to READY here; FAILED
    /// nodes stay fenced until the HA supervisor readmits them.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        capacity: Option<NodeCapacity>,
        usage: Option<NodeUsage>,
    ) -> Result<NodeData> {
        let node = self
            .regs
            .nodes
            .get_by_id(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;

        self.kv
            .keep_lease_alive(&alive_lease_key(node_id), self.t_alive)
            .await?;

        self.regs
            .nodes
            .patch_status("", &node.meta.id, |n| {
                n.status.last_heartbeat = now_rfc3339();
                if let Some(capacity) = &capacity {
                    n.status.capacity = capacity.clone();
                }
                if let Some(usage) = &usage {
                    n.status.usage = usage.clone();
                }
                if matches!(
                    n.status.state,
                    NodeState::Registering | NodeState::Offline
                ) {
                    n.status.state = NodeState::Ready;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn admission() -> (Admission, Registries) {
        let kv: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let regs = Registries::new(kv.clone());
        (
            Admission::new(
                regs.clone(),
                kv,
                Arc::new(AuditLogger::new_noop()),
                Duration::from_secs(10),
            ),
            regs,
        )
    }

    fn join(name: &str, nonce: &str) -> RegisterNodeRequest {
        RegisterNodeRequest {
            name: name.to_string(),
            address: format!("http://{name}:50051"),
            cluster_id: "c-1".to_string(),
            registration_nonce: nonce.to_string(),
            capacity: NodeCapacity {
                cpu_cores: 8,
                memory_mib: 16384,
                disk_gib: 500,
                ..Default::default()
            },
            labels: HashMap::new(),
        }
    }

    async fn mint(regs: &Registries, max_uses: u32) -> (RegistrationTokenData, String) {
        let secret = token::generate();
        let mut t = RegistrationTokenData::default();
        t.meta.name = format!("join-{max_uses}");
        t.spec.secret = secret.clone();
        t.spec.max_uses = max_uses;
        (regs.tokens.create(t).await.unwrap(), secret)
    }

    #[tokio::test]
    async fn test_register_consumes_token() {
        let (admission, regs) = admission();
        let (stored, secret) = mint(&regs, 1).await;

        let node = admission.register_node(&secret, join("n1", "nonce-1")).await.unwrap();
        assert_eq!(node.status.state, NodeState::Registering);

        let after = regs.tokens.get("", &stored.meta.id).await.unwrap();
        assert_eq!(after.status.use_count, 1);
        assert_eq!(after.status.used_by_nodes, vec![node.meta.id]);
    }

    #[tokio::test]
    async fn test_single_use_token_exhausts() {
        let (admission, regs) = admission();
        let (stored, secret) = mint(&regs, 1).await;

        admission.register_node(&secret, join("n1", "nonce-1")).await.unwrap();
        let err = admission
            .register_node(&secret, join("n2", "nonce-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
        assert!(err.to_string().contains("token_exhausted"));

        // The loser's node record was compensated away.
        assert_eq!(regs.nodes.list(None, None).await.unwrap().len(), 1);
        let after = regs.tokens.get("", &stored.meta.id).await.unwrap();
        assert_eq!(after.status.use_count, 1);
        assert_eq!(after.status.used_by_nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_consume_exactly_one_use() {
        let (admission, regs) = admission();
        let admission = Arc::new(admission);
        let (stored, secret) = mint(&regs, 1).await;

        let a = {
            let adm = admission.clone();
            let secret = secret.clone();
            tokio::spawn(async move { adm.register_node(&secret, join("n1", "nonce-1")).await })
        };
        let b = {
            let adm = admission.clone();
            let secret = secret.clone();
            tokio::spawn(async move { adm.register_node(&secret, join("n2", "nonce-2")).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1, "exactly one join may win");

        let after = regs.tokens.get("", &stored.meta.id).await.unwrap();
        assert_eq!(after.status.use_count, 1);
        assert_eq!(after.status.used_by_nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_with_same_nonce_updates_in_place() {
        let (admission, regs) = admission();
        let (_, secret) = mint(&regs, 0).await;

        let first = admission.register_node(&secret, join("n1", "nonce-1")).await.unwrap();
        let mut rejoin = join("n1", "nonce-1");
        rejoin.address = "http://n1-new:50051".to_string();
        let second = admission.register_node(&secret, rejoin).await.unwrap();

        assert_eq!(first.meta.id, second.meta.id);
        assert_eq!(second.spec.address, "http://n1-new:50051");
        assert_eq!(regs.nodes.list(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_token_denied() {
        let (admission, _) = admission();
        let err = admission
            .register_node("STRATO-0000-0000-0000-0000", join("n1", "nonce-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_promotes_registering_node() {
        let (admission, regs) = admission();
        let (_, secret) = mint(&regs, 0).await;
        let node = admission.register_node(&secret, join("n1", "nonce-1")).await.unwrap();

        let after = admission.heartbeat(&node.meta.id, None, None).await.unwrap();
        assert_eq!(after.status.state, NodeState::Ready);
    }
}
