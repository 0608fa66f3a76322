//! Clusters, projects, and the policy/quota records evaluated at admission.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use super::{Meta, impl_resource};

/// Logical grouping of nodes with HA/DRS policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ClusterData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl_resource!(ClusterData, "cluster");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ClusterSpec {
    #[serde(default)]
    pub ha_enabled: bool,
    /// Reject placements that would leave the cluster unable to absorb
    /// `ha_failover_capacity` simultaneous host failures.
    #[serde(default)]
    pub ha_admission_control: bool,
    #[serde(default)]
    pub ha_failover_capacity: u32,
    #[serde(default)]
    pub drs_mode: DrsMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pool_id: Option<String>,
    /// Global admission rules, priority-ordered, first match wins.
    #[serde(default)]
    pub policy_rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DrsMode {
    #[default]
    Manual,
    /// Auto-apply only migrations that keep post-migration failover capacity
    /// at or above `ha_failover_capacity`; everything else is recorded as a
    /// recommendation.
    PartiallyAutomated,
    FullyAutomated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ClusterStatus {
    #[serde(default)]
    pub node_count: u32,
    #[serde(default)]
    pub ready_node_count: u32,
    /// DRS migration recommendations not auto-applied under the current mode.
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// One admission rule: all conditions must match for the rule to fire.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PolicyRule {
    pub name: String,
    /// Lower fires first.
    #[serde(default)]
    pub priority: u32,
    /// Object kind this rule applies to; empty matches every kind.
    #[serde(default)]
    pub kind: String,
    /// API verb (`create`, `update`, `delete`); empty matches every verb.
    #[serde(default)]
    pub verb: String,
    /// Labels the object must carry for the rule to match.
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    pub action: PolicyAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    /// Permit the write but annotate the response.
    Warn,
}

// =============================================================================
// Projects
// =============================================================================

/// Tenancy unit; every namespaced object carries a project id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProjectData {
    #[serde(flatten)]
    pub meta: Meta,
    pub spec: ProjectSpec,
    #[serde(default)]
    pub status: ProjectStatus,
}

impl_resource!(ProjectData, "project");

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProjectSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub quota: QuotaSpec,
}

/// Hard per-project ceilings; 0 means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QuotaSpec {
    #[serde(default)]
    pub max_vcpus: u64,
    #[serde(default)]
    pub max_memory_mib: u64,
    #[serde(default)]
    pub max_volume_gib: u64,
    #[serde(default)]
    pub max_vms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProjectStatus {
    /// Reconciled against observed objects; advisory between reconciles.
    #[serde(default)]
    pub used: QuotaUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QuotaUsage {
    #[serde(default)]
    pub vcpus: u64,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub volume_gib: u64,
    #[serde(default)]
    pub vms: u64,
}
