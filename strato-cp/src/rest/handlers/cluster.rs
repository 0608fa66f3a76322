//! Cluster and project endpoints, plus control-plane introspection.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::model::{
    ClusterData, ClusterSpec, NodeState, ProjectData, ProjectSpec, validate_name,
};

use super::vms::DeleteResponse;
use super::{
    ApiError, AppState, conflict_with_revision, require_if_match, require_writer, respond,
    respond_list,
};

/// Control-plane status.
#[derive(Serialize, ToSchema)]
pub struct ControlPlaneInfo {
    pub is_leader: bool,
    /// Fencing token of the current leadership epoch, when leading.
    pub lease_revision: Option<u64>,
    pub node_count: usize,
    pub ready_node_count: usize,
    pub vm_count: usize,
}

/// Control-plane and fleet summary.
#[utoipa::path(
    get,
    path = "/v1/cluster",
    responses((status = 200, description = "Control plane info", body = ControlPlaneInfo)),
    tag = "cluster"
)]
pub async fn get_cluster_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ControlPlaneInfo>, ApiError> {
    let leader = state.leader.borrow().clone();
    let nodes = state.regs.nodes.list(None, None).await?;
    let vms = state.regs.vms.list(None, None).await?;
    Ok(Json(ControlPlaneInfo {
        is_leader: leader.is_leading(),
        lease_revision: leader.fence().map(|f| f.lease_revision),
        node_count: nodes.len(),
        ready_node_count: nodes
            .iter()
            .filter(|n| n.status.state == NodeState::Ready)
            .count(),
        vm_count: vms.len(),
    }))
}

// =============================================================================
// Clusters
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateClusterRequest {
    pub name: String,
    #[serde(default)]
    pub spec: ClusterSpec,
}

/// Create a cluster.
#[utoipa::path(
    post,
    path = "/v1/clusters",
    request_body = CreateClusterRequest,
    responses((status = 200, description = "Cluster created", body = ClusterData)),
    tag = "cluster"
)]
pub async fn create_cluster(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateClusterRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let mut cluster = ClusterData::default();
    cluster.meta.name = req.name;
    cluster.spec = req.spec;
    let created = state.regs.clusters.create(cluster).await?;
    state
        .audit
        .created("cluster", &created.meta.id, &created.meta.name, "");
    Ok(respond(&created))
}

/// List clusters.
#[utoipa::path(
    get,
    path = "/v1/clusters",
    responses((status = 200, description = "Cluster list", body = Vec<ClusterData>)),
    tag = "cluster"
)]
pub async fn list_clusters(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let clusters = state.regs.clusters.list(None, None).await?;
    Ok(respond_list(&clusters))
}

/// Read one cluster by id or name.
#[utoipa::path(
    get,
    path = "/v1/clusters/{id}",
    params(("id" = String, Path, description = "Cluster ID or name")),
    responses(
        (status = 200, description = "Cluster", body = ClusterData),
        (status = 404, description = "Cluster not found", body = ApiError)
    ),
    tag = "cluster"
)]
pub async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let cluster = match state.regs.clusters.try_get("", &id).await? {
        Some(cluster) => Some(cluster),
        None => state.regs.clusters.get_by_name("", &id).await?,
    };
    match cluster {
        Some(cluster) => Ok(respond(&cluster)),
        None => Err(ApiError::new(404, "not_found", format!("cluster {id} not found"))),
    }
}

/// Replace the cluster spec (HA/DRS knobs, policy rules). CAS via
/// `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/clusters/{id}",
    request_body = ClusterSpec,
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 200, description = "Spec updated", body = ClusterData),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "cluster"
)]
pub async fn update_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(spec): Json<ClusterSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut cluster = state.regs.clusters.get("", &id).await?;
    cluster.meta.revision = revision;
    cluster.spec = spec;
    let updated = match state.regs.clusters.update_spec(cluster).await {
        Ok(cluster) => cluster,
        Err(e) => return Err(conflict_with_revision(&state.regs.clusters, "", &id, e).await),
    };
    state.audit.updated("cluster", &updated.meta.id, "");
    Ok(respond(&updated))
}

/// Delete a cluster. Refused while nodes belong to it.
#[utoipa::path(
    delete,
    path = "/v1/clusters/{id}",
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 200, description = "Cluster removed", body = DeleteResponse),
        (status = 409, description = "Nodes still belong to the cluster", body = ApiError)
    ),
    tag = "cluster"
)]
pub async fn delete_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let cluster = state.regs.clusters.get("", &id).await?;

    let nodes = state.regs.nodes.list(None, None).await?;
    let members = nodes
        .iter()
        .filter(|n| n.spec.cluster_id == cluster.meta.id)
        .count();
    if members > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{members} node(s) still belong to this cluster"),
        ));
    }

    state.regs.clusters.remove("", &cluster.meta.id).await?;
    state.audit.deleted("cluster", &cluster.meta.id, "", false);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Projects
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    /// User-chosen project id; becomes the path segment for its resources.
    pub id: String,
    #[serde(default)]
    pub spec: ProjectSpec,
}

/// Create a project.
#[utoipa::path(
    post,
    path = "/v1/projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 200, description = "Project created", body = ProjectData),
        (status = 409, description = "Project already exists", body = ApiError)
    ),
    tag = "projects"
)]
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    validate_name(&req.id).map_err(|e| ApiError::new(400, "invalid_argument", e))?;

    if state.regs.projects.get_by_id(&req.id).await?.is_some() {
        return Err(ApiError::new(
            409,
            "already_exists",
            format!("project {} already exists", req.id),
        ));
    }

    // Project ids are user-chosen: they become the path segment for every
    // resource the project holds.
    let mut project = ProjectData::default();
    project.meta.id = req.id.clone();
    project.meta.name = req.id;
    project.spec = req.spec;
    let created = state.regs.projects.create_with_id(project).await?;
    state.audit.created("project", &created.meta.id, &created.meta.name, "");
    Ok(respond(&created))
}

/// List projects.
#[utoipa::path(
    get,
    path = "/v1/projects",
    responses((status = 200, description = "Project list", body = Vec<ProjectData>)),
    tag = "projects"
)]
pub async fn list_projects(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let projects = state.regs.projects.list(None, None).await?;
    Ok(respond_list(&projects))
}

/// Read one project.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}",
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Project", body = ProjectData),
        (status = 404, description = "Project not found", body = ApiError)
    ),
    tag = "projects"
)]
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let found = state.regs.projects.get("", &project).await?;
    Ok(respond(&found))
}

/// Delete a project. Refused while it still holds resources.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}",
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Project removed", body = DeleteResponse),
        (status = 409, description = "Project still holds resources", body = ApiError)
    ),
    tag = "projects"
)]
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let found = state.regs.projects.get("", &project).await?;

    let vms = state.regs.vms.list(Some(&project), None).await?.len();
    let volumes = state.regs.volumes.list(Some(&project), None).await?.len();
    let networks = state.regs.networks.list(Some(&project), None).await?.len();
    let total = vms + volumes + networks;
    if total > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("project still holds {total} resource(s)"),
        ));
    }

    state.regs.projects.remove("", &found.meta.id).await?;
    state.audit.deleted("project", &found.meta.id, "", false);
    Ok(Json(DeleteResponse { deleting: true }))
}
