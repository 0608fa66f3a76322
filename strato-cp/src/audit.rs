//! Audit trail.
//!
//! Every client-initiated mutation and every admission denial lands on the
//! `audit` tracing target, which deployments route to their log pipeline.
//! Kept behind a small logger type so call sites stay terse and a noop
//! variant exists for tests.

use tracing::info;

pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    pub fn created(&self, kind: &str, id: &str, name: &str, project: &str) {
        if self.enabled {
            info!(target: "audit", kind, id, name, project, "created");
        }
    }

    pub fn updated(&self, kind: &str, id: &str, project: &str) {
        if self.enabled {
            info!(target: "audit", kind, id, project, "spec updated");
        }
    }

    pub fn deleted(&self, kind: &str, id: &str, project: &str, cascade: bool) {
        if self.enabled {
            info!(target: "audit", kind, id, project, cascade, "delete requested");
        }
    }

    pub fn action(&self, kind: &str, id: &str, verb: &str) {
        if self.enabled {
            info!(target: "audit", kind, id, verb, "action");
        }
    }

    pub fn denied(&self, kind: &str, verb: &str, reason: &str) {
        if self.enabled {
            info!(target: "audit", kind, verb, reason, "denied");
        }
    }

    pub fn node_registered(&self, node_id: &str, name: &str, token_id: &str) {
        if self.enabled {
            info!(target: "audit", node_id, name, token_id, "node registered");
        }
    }

    pub fn token_revoked(&self, token_id: &str) {
        if self.enabled {
            info!(target: "audit", token_id, "token revoked");
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}
