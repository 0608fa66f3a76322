//! Virtual network and security group endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{SecurityGroupData, SecurityGroupSpec, VirtualNetworkData, VirtualNetworkSpec};

use super::vms::{DeleteQuery, DeleteResponse, ListQuery};
use super::{
    ApiError, AppState, conflict_with_revision, parse_selector, require_if_match, require_writer,
    respond, respond_list, watch_stream,
};

#[derive(Deserialize, ToSchema)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: VirtualNetworkSpec,
}

/// Create a virtual network.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/networks",
    request_body = CreateNetworkRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Network created", body = VirtualNetworkData),
        (status = 409, description = "Name already exists", body = ApiError)
    ),
    tag = "networks"
)]
pub async fn create_network(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateNetworkRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "network",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    let mut net = VirtualNetworkData::default();
    net.meta.name = req.name;
    net.meta.project_id = project;
    net.meta.labels = req.labels;
    net.spec = req.spec;

    let created = state.regs.networks.create(net).await?;
    state
        .audit
        .created("network", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.network.add(&created.meta.id);
    Ok(respond(&created))
}

/// List networks, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/networks",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Network list", body = Vec<VirtualNetworkData>)),
    tag = "networks"
)]
pub async fn list_networks(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.networks.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let nets = state
        .regs
        .networks
        .list(Some(&project), selector.as_ref())
        .await?;
    Ok(respond_list(&nets))
}

/// Read one network by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/networks/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Network ID or name")
    ),
    responses(
        (status = 200, description = "Network found", body = VirtualNetworkData),
        (status = 404, description = "Network not found", body = ApiError)
    ),
    tag = "networks"
)]
pub async fn get_network(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let net = match state.regs.networks.try_get(&project, &id).await? {
        Some(net) => Some(net),
        None => state.regs.networks.get_by_name(&project, &id).await?,
    };
    match net {
        Some(net) => Ok(respond(&net)),
        None => Err(ApiError::new(404, "not_found", format!("network {id} not found"))),
    }
}

/// Replace the network spec. CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/networks/{id}",
    request_body = VirtualNetworkSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Network ID")
    ),
    responses(
        (status = 200, description = "Spec updated", body = VirtualNetworkData),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "networks"
)]
pub async fn update_network(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<VirtualNetworkSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut net = state.regs.networks.get(&project, &id).await?;
    net.meta.revision = revision;
    net.spec = spec;
    let updated = match state.regs.networks.update_spec(net).await {
        Ok(net) => net,
        Err(e) => return Err(conflict_with_revision(&state.regs.networks, &project, &id, e).await),
    };
    state.audit.updated("network", &updated.meta.id, &project);
    state.queues.network.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Delete a network. Refuses while ports exist unless `cascade=true`.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/networks/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Network ID"),
        ("cascade" = Option<bool>, Query, description = "Also delete ports on the network")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "Ports still reference the network", body = ApiError)
    ),
    tag = "networks"
)]
pub async fn delete_network(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let net = state.regs.networks.get(&project, &id).await?;

    let ports = state.regs.ports.list(None, None).await?;
    let children: Vec<_> = ports
        .into_iter()
        .filter(|p| p.spec.network_id == net.meta.id)
        .collect();
    if !children.is_empty() && !query.cascade {
        return Err(ApiError::new(
            409,
            "conflict",
            format!(
                "network has {} port(s); delete them or pass cascade=true",
                children.len()
            ),
        ));
    }
    for port in children {
        if !port.meta.deleting() {
            state
                .regs
                .ports
                .mark_deleted(&port.meta.project_id, &port.meta.id)
                .await?;
            state.queues.port.add(&port.meta.id);
        }
    }

    state.regs.networks.mark_deleted(&project, &net.meta.id).await?;
    state.audit.deleted("network", &net.meta.id, &project, query.cascade);
    state.queues.network.add(&net.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Security groups
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateSecurityGroupRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: SecurityGroupSpec,
}

/// Create a security group.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/security-groups",
    request_body = CreateSecurityGroupRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Security group created", body = SecurityGroupData)),
    tag = "security-groups"
)]
pub async fn create_security_group(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateSecurityGroupRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "security-group",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    let mut group = SecurityGroupData::default();
    group.meta.name = req.name;
    group.meta.project_id = project;
    group.meta.labels = req.labels;
    group.spec = req.spec;

    let created = state.regs.security_groups.create(group).await?;
    state.audit.created(
        "security-group",
        &created.meta.id,
        &created.meta.name,
        &created.meta.project_id,
    );
    Ok(respond(&created))
}

/// List security groups.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/security-groups",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Security group list", body = Vec<SecurityGroupData>)),
    tag = "security-groups"
)]
pub async fn list_security_groups(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let groups = state.regs.security_groups.list(Some(&project), None).await?;
    Ok(respond_list(&groups))
}

/// Read one security group.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/security-groups/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Security group ID or name")
    ),
    responses((status = 200, description = "Security group", body = SecurityGroupData)),
    tag = "security-groups"
)]
pub async fn get_security_group(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let group = match state.regs.security_groups.try_get(&project, &id).await? {
        Some(group) => Some(group),
        None => state.regs.security_groups.get_by_name(&project, &id).await?,
    };
    match group {
        Some(group) => Ok(respond(&group)),
        None => Err(ApiError::new(
            404,
            "not_found",
            format!("security group {id} not found"),
        )),
    }
}

/// Replace the rule set. CAS via `If-Match`; ports pick the change up on
/// their next realization pass.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/security-groups/{id}",
    request_body = SecurityGroupSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Security group ID")
    ),
    responses((status = 200, description = "Spec updated", body = SecurityGroupData)),
    tag = "security-groups"
)]
pub async fn update_security_group(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<SecurityGroupSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut group = state.regs.security_groups.get(&project, &id).await?;
    group.meta.revision = revision;
    group.spec = spec;
    let updated = match state.regs.security_groups.update_spec(group).await {
        Ok(group) => group,
        Err(e) => {
            return Err(conflict_with_revision(&state.regs.security_groups, &project, &id, e).await);
        }
    };
    state.audit.updated("security-group", &updated.meta.id, &project);

    // Touch every referencing port so its controller re-applies the ACL
    // batch; a bare requeue would hit the steady-state guard.
    let ports = state.regs.ports.list(None, None).await?;
    for port in ports {
        if port.spec.security_group_ids.contains(&updated.meta.id) {
            state
                .regs
                .ports
                .patch_spec(&port.meta.project_id, &port.meta.id, |_| Ok(()))
                .await?;
            state.queues.port.add(&port.meta.id);
        }
    }
    Ok(respond(&updated))
}

/// Delete a security group. Refused while ports reference it.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/security-groups/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Security group ID")
    ),
    responses(
        (status = 200, description = "Deleted", body = DeleteResponse),
        (status = 409, description = "Ports still reference the group", body = ApiError)
    ),
    tag = "security-groups"
)]
pub async fn delete_security_group(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let group = state.regs.security_groups.get(&project, &id).await?;

    let ports = state.regs.ports.list(None, None).await?;
    let referenced = ports
        .iter()
        .filter(|p| p.spec.security_group_ids.contains(&group.meta.id))
        .count();
    if referenced > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{referenced} port(s) still reference this security group"),
        ));
    }

    state.regs.security_groups.remove(&project, &group.meta.id).await?;
    state.audit.deleted("security-group", &group.meta.id, &project, false);
    Ok(Json(DeleteResponse { deleting: true }))
}
