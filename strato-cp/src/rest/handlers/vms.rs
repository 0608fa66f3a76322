//! Virtual machine endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{DesiredRunState, MigrationRequest, VmData, VmSpec, VmState, VolumeSnapshotData};

use super::{
    ApiError, AppState, conflict_with_revision, parse_selector, require_if_match, require_writer,
    respond, respond_list, watch_stream,
};

/// Request to create a VM.
#[derive(Deserialize, ToSchema)]
pub struct CreateVmRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: VmSpec,
}

#[derive(Deserialize, ToSchema)]
pub struct ListQuery {
    /// Label selector, `k=v` pairs comma-separated.
    pub label: Option<String>,
    /// Stream changes as server-sent events instead of listing.
    pub watch: Option<u8>,
}

fn vm_delta(spec: &VmSpec) -> QuotaDelta {
    QuotaDelta {
        vms: 1,
        vcpus: spec.cpu_cores as u64,
        memory_mib: spec.memory_mib,
        volume_gib: spec
            .disks
            .iter()
            .filter(|d| d.volume_id.is_none())
            .map(|d| d.size_gib)
            .sum(),
    }
}

/// Create a VM.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms",
    request_body = CreateVmRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "VM created", body = VmData),
        (status = 400, description = "Invalid spec", body = ApiError),
        (status = 403, description = "Denied by policy", body = ApiError),
        (status = 409, description = "Name already exists", body = ApiError),
        (status = 429, description = "Quota exceeded", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn create_vm(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateVmRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "vm",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: vm_delta(&req.spec),
        })
        .await?;

    let mut vm = VmData::default();
    vm.meta.name = req.name;
    vm.meta.project_id = project;
    vm.meta.labels = req.labels;
    vm.spec = req.spec;
    vm.status.state = VmState::Pending;

    let created = state.regs.vms.create(vm).await?;
    state
        .audit
        .created("vm", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.vm.add(&created.meta.id);
    Ok(respond(&created))
}

/// List VMs, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/vms",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "VM list", body = Vec<VmData>)),
    tag = "vms"
)]
pub async fn list_vms(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.vms.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let vms = state.regs.vms.list(Some(&project), selector.as_ref()).await?;
    Ok(respond_list(&vms))
}

/// Read one VM by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/vms/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID or name")
    ),
    responses(
        (status = 200, description = "VM found", body = VmData),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn get_vm(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let vm = match state.regs.vms.try_get(&project, &id).await? {
        Some(vm) => Some(vm),
        None => state.regs.vms.get_by_name(&project, &id).await?,
    };
    match vm {
        Some(vm) => Ok(respond(&vm)),
        None => Err(ApiError::new(404, "not_found", format!("vm {id} not found"))),
    }
}

/// Replace the VM spec. CAS via `If-Match` revision.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/vms/{id}",
    request_body = VmSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses(
        (status = 200, description = "Spec updated", body = VmData),
        (status = 404, description = "VM not found", body = ApiError),
        (status = 409, description = "Revision conflict", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn update_vm_spec(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<VmSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;

    let mut vm = state.regs.vms.get(&project, &id).await?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "vm",
            verb: "update",
            project_id: &project,
            labels: &vm.meta.labels,
            delta: QuotaDelta {
                vcpus: (spec.cpu_cores as u64).saturating_sub(vm.spec.cpu_cores as u64),
                memory_mib: spec.memory_mib.saturating_sub(vm.spec.memory_mib),
                ..Default::default()
            },
        })
        .await?;

    vm.meta.revision = revision;
    vm.spec = spec;
    let updated = match state.regs.vms.update_spec(vm).await {
        Ok(vm) => vm,
        Err(e) => return Err(conflict_with_revision(&state.regs.vms, &project, &id, e).await),
    };
    state.audit.updated("vm", &updated.meta.id, &project);
    state.queues.vm.add(&updated.meta.id);
    Ok(respond(&updated))
}

#[derive(Deserialize, ToSchema)]
pub struct DeleteQuery {
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Serialize, ToSchema)]
pub struct DeleteResponse {
    pub deleting: bool,
}

/// Delete a VM. Owned ports are always cascaded; volumes are detached.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/vms/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID"),
        ("cascade" = Option<bool>, Query, description = "Unused for VMs; accepted for uniformity")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 404, description = "VM not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn delete_vm(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    state.regs.vms.mark_deleted(&project, &id).await?;
    state.audit.deleted("vm", &id, &project, query.cascade);
    state.queues.vm.add(&id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Actions
// =============================================================================

async fn patch_run_state(
    state: &AppState,
    project: &str,
    id: &str,
    run_state: DesiredRunState,
) -> Result<VmData, ApiError> {
    let vm = state
        .regs
        .vms
        .patch_spec(project, id, |vm| {
            vm.spec.run_state = run_state;
            Ok(())
        })
        .await?;
    state.queues.vm.add(&vm.meta.id);
    Ok(vm)
}

/// Start the VM.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms/{id}/actions/start",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses((status = 200, description = "Start requested", body = VmData)),
    tag = "vms"
)]
pub async fn vm_action_start(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let vm = patch_run_state(&state, &project, &id, DesiredRunState::Running).await?;
    state.audit.action("vm", &id, "start");
    Ok(respond(&vm))
}

/// Stop the VM gracefully; the controller escalates to a forced stop after
/// the grace window.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms/{id}/actions/stop",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses((status = 200, description = "Stop requested", body = VmData)),
    tag = "vms"
)]
pub async fn vm_action_stop(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let vm = patch_run_state(&state, &project, &id, DesiredRunState::Stopped).await?;
    state.audit.action("vm", &id, "stop");
    Ok(respond(&vm))
}

/// Reboot the VM.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms/{id}/actions/reboot",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses(
        (status = 200, description = "Reboot requested", body = VmData),
        (status = 412, description = "VM is not running", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn vm_action_reboot(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let current = state.regs.vms.get(&project, &id).await?;
    if current.status.state != VmState::Running {
        return Err(ApiError::new(
            412,
            "failed_precondition",
            format!("cannot reboot a VM in state {:?}", current.status.state),
        ));
    }
    let vm = state
        .regs
        .vms
        .patch_spec(&project, &id, |vm| {
            vm.spec.reboot_nonce = Some(Uuid::new_v4().to_string());
            Ok(())
        })
        .await?;
    state.queues.vm.add(&vm.meta.id);
    state.audit.action("vm", &id, "reboot");
    Ok(respond(&vm))
}

#[derive(Deserialize, ToSchema)]
pub struct MigrateRequest {
    /// Target node id, or "auto" / absent for scheduler choice.
    pub target: Option<String>,
}

/// Live-migrate the VM.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms/{id}/actions/migrate",
    request_body = MigrateRequest,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses(
        (status = 200, description = "Migration requested", body = VmData),
        (status = 412, description = "VM is not running", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn vm_action_migrate(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<MigrateRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let current = state.regs.vms.get(&project, &id).await?;
    if current.status.state != VmState::Running {
        return Err(ApiError::new(
            412,
            "failed_precondition",
            format!("cannot migrate a VM in state {:?}", current.status.state),
        ));
    }
    let target = match req.target.as_deref() {
        None | Some("auto") | Some("") => None,
        Some(node) => Some(node.to_string()),
    };
    let vm = state
        .regs
        .vms
        .patch_spec(&project, &id, |vm| {
            vm.spec.migration = Some(MigrationRequest {
                nonce: Uuid::new_v4().to_string(),
                target_node_id: target.clone(),
            });
            Ok(())
        })
        .await?;
    state.queues.vm.add(&vm.meta.id);
    state.audit.action("vm", &id, "migrate");
    Ok(respond(&vm))
}

#[derive(Deserialize, ToSchema)]
pub struct VmSnapshotRequest {
    pub name: String,
    /// Index into the VM's disks; the boot disk by default.
    #[serde(default)]
    pub disk_index: usize,
    #[serde(default)]
    pub crash_consistent_forbidden: bool,
}

/// Snapshot one of the VM's disks.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vms/{id}/actions/snapshot",
    request_body = VmSnapshotRequest,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VM ID")
    ),
    responses(
        (status = 200, description = "Snapshot created", body = VolumeSnapshotData),
        (status = 404, description = "VM or disk not found", body = ApiError)
    ),
    tag = "vms"
)]
pub async fn vm_action_snapshot(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<VmSnapshotRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let vm = state.regs.vms.get(&project, &id).await?;
    let Some(volume_id) = vm.status.disk_volume_ids.get(req.disk_index).cloned() else {
        return Err(ApiError::new(
            404,
            "not_found",
            format!("vm {id} has no realized disk at index {}", req.disk_index),
        ));
    };

    let mut snapshot = VolumeSnapshotData::default();
    snapshot.meta.name = req.name;
    snapshot.meta.project_id = project;
    snapshot.spec.volume_id = volume_id;
    snapshot.spec.crash_consistent_forbidden = req.crash_consistent_forbidden;

    let created = state.regs.snapshots.create(snapshot).await?;
    state
        .audit
        .created("snapshot", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.snapshot.add(&created.meta.id);
    state.audit.action("vm", &id, "snapshot");
    Ok(respond(&created))
}
