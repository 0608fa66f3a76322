//! Storage pool, volume, and snapshot endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{
    StoragePoolData, StoragePoolSpec, VolumeData, VolumeSnapshotData, VolumeSnapshotSpec,
    VolumeSource, VolumeSpec,
};

use super::vms::{DeleteQuery, DeleteResponse, ListQuery};
use super::{
    ApiError, AppState, conflict_with_revision, parse_selector, require_if_match, require_writer,
    respond, respond_list, watch_stream,
};

// =============================================================================
// Storage pools
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreatePoolRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: StoragePoolSpec,
}

/// Create a storage pool. The backend is required up front.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/pools",
    request_body = CreatePoolRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Pool created", body = StoragePoolData),
        (status = 400, description = "Invalid backend config", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreatePoolRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "pool",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    for node_id in &req.spec.assigned_nodes {
        if state.regs.nodes.get_by_id(node_id).await?.is_none() {
            return Err(ApiError::new(
                404,
                "not_found",
                format!("assigned node {node_id} not found"),
            ));
        }
    }

    let mut pool = StoragePoolData::default();
    pool.meta.name = req.name;
    pool.meta.project_id = project;
    pool.meta.labels = req.labels;
    pool.spec = req.spec;

    let created = state.regs.pools.create(pool).await?;
    state
        .audit
        .created("pool", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.pool.add(&created.meta.id);
    Ok(respond(&created))
}

/// List pools, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/pools",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Pool list", body = Vec<StoragePoolData>)),
    tag = "storage"
)]
pub async fn list_pools(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.pools.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let pools = state.regs.pools.list(Some(&project), selector.as_ref()).await?;
    Ok(respond_list(&pools))
}

/// Read one pool by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/pools/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Pool ID or name")
    ),
    responses(
        (status = 200, description = "Pool found", body = StoragePoolData),
        (status = 404, description = "Pool not found", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let pool = match state.regs.pools.try_get(&project, &id).await? {
        Some(pool) => Some(pool),
        None => state.regs.pools.get_by_name(&project, &id).await?,
    };
    match pool {
        Some(pool) => Ok(respond(&pool)),
        None => Err(ApiError::new(404, "not_found", format!("pool {id} not found"))),
    }
}

/// Replace the pool spec (assigned nodes and the like). CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/pools/{id}",
    request_body = StoragePoolSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Pool ID")
    ),
    responses(
        (status = 200, description = "Spec updated", body = StoragePoolData),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn update_pool(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<StoragePoolSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut pool = state.regs.pools.get(&project, &id).await?;
    pool.meta.revision = revision;
    pool.spec = spec;
    let updated = match state.regs.pools.update_spec(pool).await {
        Ok(pool) => pool,
        Err(e) => return Err(conflict_with_revision(&state.regs.pools, &project, &id, e).await),
    };
    state.audit.updated("pool", &updated.meta.id, &project);
    state.queues.pool.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Delete a pool. Refuses while volumes exist unless `cascade=true`, in
/// which case the volumes are marked for deletion first and the pool waits
/// for them.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/pools/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Pool ID"),
        ("cascade" = Option<bool>, Query, description = "Also delete volumes on the pool")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "Volumes still exist on the pool", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let pool = state.regs.pools.get(&project, &id).await?;

    let volumes = state.regs.volumes.list(None, None).await?;
    let children: Vec<_> = volumes
        .into_iter()
        .filter(|v| v.spec.pool_id == pool.meta.id)
        .collect();
    if !children.is_empty() && !query.cascade {
        return Err(ApiError::new(
            409,
            "conflict",
            format!(
                "pool has {} volume(s); delete them or pass cascade=true",
                children.len()
            ),
        ));
    }
    for volume in children {
        if !volume.meta.deleting() {
            state
                .regs
                .volumes
                .mark_deleted(&volume.meta.project_id, &volume.meta.id)
                .await?;
            state.queues.volume.add(&volume.meta.id);
        }
    }

    state.regs.pools.mark_deleted(&project, &pool.meta.id).await?;
    state.audit.deleted("pool", &pool.meta.id, &project, query.cascade);
    state.queues.pool.add(&pool.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: VolumeSpec,
}

/// Create a volume on a pool.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/volumes",
    request_body = CreateVolumeRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Volume created", body = VolumeData),
        (status = 404, description = "Pool not found", body = ApiError),
        (status = 412, description = "Pool is being deleted", body = ApiError),
        (status = 429, description = "Quota exceeded", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn create_volume(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateVolumeRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "volume",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta {
                volume_gib: req.spec.size_gib,
                ..Default::default()
            },
        })
        .await?;

    let Some(pool) = state.regs.pools.get_by_id(&req.spec.pool_id).await? else {
        return Err(ApiError::new(
            404,
            "not_found",
            format!("pool {} not found", req.spec.pool_id),
        ));
    };
    if pool.meta.deleting() {
        return Err(ApiError::new(
            412,
            "failed_precondition",
            format!("pool {} is being deleted", pool.meta.name),
        ));
    }
    if let Some(VolumeSource::Snapshot { snapshot_id }) = &req.spec.source {
        if state.regs.snapshots.get_by_id(snapshot_id).await?.is_none() {
            return Err(ApiError::new(
                404,
                "not_found",
                format!("snapshot {snapshot_id} not found"),
            ));
        }
    }

    let mut volume = VolumeData::default();
    volume.meta.name = req.name;
    volume.meta.project_id = project;
    volume.meta.labels = req.labels;
    volume.spec = req.spec;

    let created = state.regs.volumes.create(volume).await?;
    state
        .audit
        .created("volume", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.volume.add(&created.meta.id);
    Ok(respond(&created))
}

/// List volumes, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/volumes",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Volume list", body = Vec<VolumeData>)),
    tag = "storage"
)]
pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.volumes.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let volumes = state
        .regs
        .volumes
        .list(Some(&project), selector.as_ref())
        .await?;
    Ok(respond_list(&volumes))
}

/// Read one volume by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/volumes/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Volume ID or name")
    ),
    responses(
        (status = 200, description = "Volume found", body = VolumeData),
        (status = 404, description = "Volume not found", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn get_volume(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let volume = match state.regs.volumes.try_get(&project, &id).await? {
        Some(volume) => Some(volume),
        None => state.regs.volumes.get_by_name(&project, &id).await?,
    };
    match volume {
        Some(volume) => Ok(respond(&volume)),
        None => Err(ApiError::new(404, "not_found", format!("volume {id} not found"))),
    }
}

/// Replace the volume spec; growing `size_gib` triggers a resize. CAS via
/// `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/volumes/{id}",
    request_body = VolumeSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Volume ID")
    ),
    responses(
        (status = 200, description = "Spec updated", body = VolumeData),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn update_volume(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<VolumeSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut volume = state.regs.volumes.get(&project, &id).await?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "volume",
            verb: "update",
            project_id: &project,
            labels: &volume.meta.labels,
            delta: QuotaDelta {
                volume_gib: spec.size_gib.saturating_sub(volume.spec.size_gib),
                ..Default::default()
            },
        })
        .await?;

    volume.meta.revision = revision;
    volume.spec = spec;
    let updated = match state.regs.volumes.update_spec(volume).await {
        Ok(volume) => volume,
        Err(e) => return Err(conflict_with_revision(&state.regs.volumes, &project, &id, e).await),
    };
    state.audit.updated("volume", &updated.meta.id, &project);
    state.queues.volume.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Delete a volume. Refused while attached; snapshots are cascaded only
/// with `cascade=true`.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/volumes/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Volume ID"),
        ("cascade" = Option<bool>, Query, description = "Also delete snapshots of the volume")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "Volume is attached or has snapshots", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let volume = state.regs.volumes.get(&project, &id).await?;

    if !volume.status.attached_vm_id.is_empty() {
        return Err(ApiError::new(
            409,
            "conflict",
            format!(
                "volume is attached to VM {}; detach it first",
                volume.status.attached_vm_id
            ),
        ));
    }

    let snapshots = state.regs.snapshots.list(None, None).await?;
    let children: Vec<_> = snapshots
        .into_iter()
        .filter(|s| s.spec.volume_id == volume.meta.id)
        .collect();
    if !children.is_empty() && !query.cascade {
        return Err(ApiError::new(
            409,
            "conflict",
            format!(
                "volume has {} snapshot(s); delete them or pass cascade=true",
                children.len()
            ),
        ));
    }
    for snapshot in children {
        if !snapshot.meta.deleting() {
            state
                .regs
                .snapshots
                .mark_deleted(&snapshot.meta.project_id, &snapshot.meta.id)
                .await?;
            state.queues.snapshot.add(&snapshot.meta.id);
        }
    }

    state.regs.volumes.mark_deleted(&project, &volume.meta.id).await?;
    state.audit.deleted("volume", &volume.meta.id, &project, query.cascade);
    state.queues.volume.add(&volume.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: VolumeSnapshotSpec,
}

/// Snapshot a volume.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/snapshots",
    request_body = CreateSnapshotRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Snapshot created", body = VolumeSnapshotData),
        (status = 404, description = "Volume not found", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateSnapshotRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "snapshot",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    if state.regs.volumes.get_by_id(&req.spec.volume_id).await?.is_none() {
        return Err(ApiError::new(
            404,
            "not_found",
            format!("volume {} not found", req.spec.volume_id),
        ));
    }

    let mut snapshot = VolumeSnapshotData::default();
    snapshot.meta.name = req.name;
    snapshot.meta.project_id = project;
    snapshot.meta.labels = req.labels;
    snapshot.spec = req.spec;

    let created = state.regs.snapshots.create(snapshot).await?;
    state
        .audit
        .created("snapshot", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.snapshot.add(&created.meta.id);
    Ok(respond(&created))
}

/// List snapshots.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/snapshots",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Snapshot list", body = Vec<VolumeSnapshotData>)),
    tag = "storage"
)]
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.snapshots.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let snapshots = state
        .regs
        .snapshots
        .list(Some(&project), selector.as_ref())
        .await?;
    Ok(respond_list(&snapshots))
}

/// Read one snapshot by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/snapshots/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Snapshot ID or name")
    ),
    responses(
        (status = 200, description = "Snapshot found", body = VolumeSnapshotData),
        (status = 404, description = "Snapshot not found", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let snapshot = match state.regs.snapshots.try_get(&project, &id).await? {
        Some(snapshot) => Some(snapshot),
        None => state.regs.snapshots.get_by_name(&project, &id).await?,
    };
    match snapshot {
        Some(snapshot) => Ok(respond(&snapshot)),
        None => Err(ApiError::new(404, "not_found", format!("snapshot {id} not found"))),
    }
}

/// Delete a snapshot. Refused while cloned volumes reference it.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/snapshots/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Snapshot ID")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "Cloned volumes reference the snapshot", body = ApiError)
    ),
    tag = "storage"
)]
pub async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let snapshot = state.regs.snapshots.get(&project, &id).await?;

    let volumes = state.regs.volumes.list(None, None).await?;
    let clones = volumes
        .iter()
        .filter(|v| {
            matches!(&v.spec.source, Some(VolumeSource::Snapshot { snapshot_id }) if snapshot_id == &snapshot.meta.id)
        })
        .count();
    if clones > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{clones} volume(s) are cloned from this snapshot"),
        ));
    }

    state
        .regs
        .snapshots
        .mark_deleted(&project, &snapshot.meta.id)
        .await?;
    state.audit.deleted("snapshot", &snapshot.meta.id, &project, false);
    state.queues.snapshot.add(&snapshot.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}
