//! Node registration, heartbeat, and lifecycle endpoints.
//!
//! Nodes are cluster-scoped (no project segment). Registration is the only
//! write gated by a token rather than by the role header: the caller is a
//! node daemon, not an operator.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::RegisterNodeRequest;
use crate::model::{NodeCapacity, NodeData, NodeState, NodeUsage};

use super::vms::DeleteResponse;
use super::{ApiError, AppState, require_writer, respond, respond_list};

#[derive(Deserialize, ToSchema)]
pub struct RegisterBody {
    /// Registration token minted by an operator.
    pub token: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub cluster_id: String,
    /// Physical identity of the host; stable across re-installs.
    pub registration_nonce: String,
    pub capacity: NodeCapacity,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Join the cluster. Token-gated; idempotent per registration nonce.
#[utoipa::path(
    post,
    path = "/v1/nodes/register",
    request_body = RegisterBody,
    responses(
        (status = 200, description = "Node registered", body = NodeData),
        (status = 403, description = "Token invalid or exhausted", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<Response, ApiError> {
    let node = state
        .admission
        .register_node(
            &body.token,
            RegisterNodeRequest {
                name: body.name,
                address: body.address,
                cluster_id: body.cluster_id,
                registration_nonce: body.registration_nonce,
                capacity: body.capacity,
                labels: body.labels,
            },
        )
        .await?;
    Ok(respond(&node))
}

#[derive(Deserialize, ToSchema)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub capacity: Option<NodeCapacity>,
    #[serde(default)]
    pub usage: Option<NodeUsage>,
}

/// Node heartbeat: renews the liveness lease and refreshes usage.
#[utoipa::path(
    post,
    path = "/v1/nodes/{id}/heartbeat",
    request_body = HeartbeatBody,
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Heartbeat accepted", body = NodeData),
        (status = 404, description = "Node not found", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Response, ApiError> {
    let node = state
        .admission
        .heartbeat(&id, body.capacity, body.usage)
        .await?;
    Ok(respond(&node))
}

#[derive(Deserialize, ToSchema)]
pub struct ListNodesQuery {
    /// Filter by state, e.g. `READY`.
    pub state: Option<String>,
}

/// List nodes.
#[utoipa::path(
    get,
    path = "/v1/nodes",
    params(("state" = Option<String>, Query, description = "Filter by node state")),
    responses((status = 200, description = "Node list", body = Vec<NodeData>)),
    tag = "nodes"
)]
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListNodesQuery>,
) -> Result<Response, ApiError> {
    let mut nodes = state.regs.nodes.list(None, None).await?;
    if let Some(filter) = &query.state {
        let filter = filter.to_uppercase();
        nodes.retain(|n| format!("{:?}", n.status.state).to_uppercase() == filter);
    }
    Ok(respond_list(&nodes))
}

/// Read one node by id or name.
#[utoipa::path(
    get,
    path = "/v1/nodes/{id}",
    params(("id" = String, Path, description = "Node ID or name")),
    responses(
        (status = 200, description = "Node found", body = NodeData),
        (status = 404, description = "Node not found", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let node = match state.regs.nodes.try_get("", &id).await? {
        Some(node) => Some(node),
        None => state.regs.nodes.get_by_name("", &id).await?,
    };
    match node {
        Some(node) => Ok(respond(&node)),
        None => Err(ApiError::new(404, "not_found", format!("node {id} not found"))),
    }
}

/// Drain a node: stop scheduling onto it, keep existing VMs running.
#[utoipa::path(
    post,
    path = "/v1/nodes/{id}/actions/drain",
    params(("id" = String, Path, description = "Node ID")),
    responses((status = 200, description = "Node draining", body = NodeData)),
    tag = "nodes"
)]
pub async fn drain_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let node = state
        .regs
        .nodes
        .patch_status("", &id, |n| {
            if n.status.state == NodeState::Ready {
                n.status.state = NodeState::Draining;
            }
            Ok(())
        })
        .await?;
    state.audit.action("node", &id, "drain");
    Ok(respond(&node))
}

/// Remove a node from the fleet. Refused while VMs are bound to it.
#[utoipa::path(
    delete,
    path = "/v1/nodes/{id}",
    params(("id" = String, Path, description = "Node ID")),
    responses(
        (status = 200, description = "Node removed", body = DeleteResponse),
        (status = 409, description = "VMs still bound to the node", body = ApiError)
    ),
    tag = "nodes"
)]
pub async fn deregister_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let node = state.regs.nodes.get("", &id).await?;

    let vms = state.regs.vms.list(None, None).await?;
    let bound = vms
        .iter()
        .filter(|vm| vm.status.node_id.as_deref() == Some(node.meta.id.as_str()))
        .count();
    if bound > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{bound} VM(s) still bound to this node; migrate or delete them first"),
        ));
    }

    state.regs.nodes.remove("", &node.meta.id).await?;
    state.audit.deleted("node", &node.meta.id, "", false);
    Ok(Json(DeleteResponse { deleting: true }))
}
