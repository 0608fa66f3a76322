//! Port endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{PortData, PortSpec};

use super::vms::{DeleteQuery, DeleteResponse, ListQuery};
use super::{
    ApiError, AppState, conflict_with_revision, parse_selector, require_if_match, require_writer,
    respond, respond_list, watch_stream,
};

#[derive(Deserialize, ToSchema)]
pub struct CreatePortRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: PortSpec,
}

/// Create a port on a network.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/ports",
    request_body = CreatePortRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Port created", body = PortData),
        (status = 404, description = "Network not found", body = ApiError),
        (status = 412, description = "Network is being deleted", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn create_port(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreatePortRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "port",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    // Referential checks: the network must exist and not be going away.
    let Some(network) = state.regs.networks.get_by_id(&req.spec.network_id).await? else {
        return Err(ApiError::new(
            404,
            "not_found",
            format!("network {} not found", req.spec.network_id),
        ));
    };
    if network.meta.deleting() {
        return Err(ApiError::new(
            412,
            "failed_precondition",
            format!("network {} is being deleted", network.meta.name),
        ));
    }
    for group_id in &req.spec.security_group_ids {
        if state.regs.security_groups.get_by_id(group_id).await?.is_none() {
            return Err(ApiError::new(
                404,
                "not_found",
                format!("security group {group_id} not found"),
            ));
        }
    }

    let mut port = PortData::default();
    port.meta.name = req.name;
    port.meta.project_id = project;
    port.meta.labels = req.labels;
    port.spec = req.spec;

    let created = state.regs.ports.create(port).await?;
    state
        .audit
        .created("port", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.port.add(&created.meta.id);
    Ok(respond(&created))
}

/// List ports, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/ports",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Port list", body = Vec<PortData>)),
    tag = "ports"
)]
pub async fn list_ports(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.ports.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let ports = state.regs.ports.list(Some(&project), selector.as_ref()).await?;
    Ok(respond_list(&ports))
}

/// Read one port by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/ports/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Port ID or name")
    ),
    responses(
        (status = 200, description = "Port found", body = PortData),
        (status = 404, description = "Port not found", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn get_port(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let port = match state.regs.ports.try_get(&project, &id).await? {
        Some(port) => Some(port),
        None => state.regs.ports.get_by_name(&project, &id).await?,
    };
    match port {
        Some(port) => Ok(respond(&port)),
        None => Err(ApiError::new(404, "not_found", format!("port {id} not found"))),
    }
}

/// Replace the port spec. CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/ports/{id}",
    request_body = PortSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Port ID")
    ),
    responses(
        (status = 200, description = "Spec updated", body = PortData),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn update_port(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<PortSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut port = state.regs.ports.get(&project, &id).await?;
    port.meta.revision = revision;
    port.spec = spec;
    let updated = match state.regs.ports.update_spec(port).await {
        Ok(port) => port,
        Err(e) => return Err(conflict_with_revision(&state.regs.ports, &project, &id, e).await),
    };
    state.audit.updated("port", &updated.meta.id, &project);
    state.queues.port.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Delete a port. Refused while a VM's spec references it.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/ports/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Port ID"),
        ("cascade" = Option<bool>, Query, description = "Unused for ports; accepted for uniformity")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "A VM still references the port", body = ApiError)
    ),
    tag = "ports"
)]
pub async fn delete_port(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let port = state.regs.ports.get(&project, &id).await?;

    if let Some(vm_id) = &port.spec.vm_id {
        if state.regs.vms.get_by_id(vm_id).await?.is_some() {
            return Err(ApiError::new(
                409,
                "conflict",
                format!("port is attached to VM {vm_id}; detach it first"),
            ));
        }
    }

    state.regs.ports.mark_deleted(&project, &port.meta.id).await?;
    state.audit.deleted("port", &port.meta.id, &project, query.cascade);
    state.queues.port.add(&port.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}
