//! Customization spec endpoints (guest provisioning templates).

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::model::{CustomizationSpecData, CustomizationSpecSpec};

use super::vms::DeleteResponse;
use super::{
    ApiError, AppState, conflict_with_revision, require_if_match, require_writer, respond,
    respond_list,
};

#[derive(Deserialize, ToSchema)]
pub struct CreateCustomizationRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: CustomizationSpecSpec,
}

/// Create a customization spec. The OS-matching sub-spec is required.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/customizations",
    request_body = CreateCustomizationRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Customization created", body = CustomizationSpecData),
        (status = 400, description = "Missing OS sub-spec", body = ApiError)
    ),
    tag = "customizations"
)]
pub async fn create_customization(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateCustomizationRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let mut spec = CustomizationSpecData::default();
    spec.meta.name = req.name;
    spec.meta.project_id = project;
    spec.meta.labels = req.labels;
    spec.spec = req.spec;

    let created = state.regs.customizations.create(spec).await?;
    state
        .audit
        .created("customization", &created.meta.id, &created.meta.name, &created.meta.project_id);
    Ok(respond(&created))
}

/// List customization specs.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/customizations",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Customization list", body = Vec<CustomizationSpecData>)),
    tag = "customizations"
)]
pub async fn list_customizations(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let specs = state.regs.customizations.list(Some(&project), None).await?;
    Ok(respond_list(&specs))
}

/// Read one customization spec.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/customizations/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Customization ID or name")
    ),
    responses((status = 200, description = "Customization", body = CustomizationSpecData)),
    tag = "customizations"
)]
pub async fn get_customization(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let spec = match state.regs.customizations.try_get(&project, &id).await? {
        Some(spec) => Some(spec),
        None => state.regs.customizations.get_by_name(&project, &id).await?,
    };
    match spec {
        Some(spec) => Ok(respond(&spec)),
        None => Err(ApiError::new(404, "not_found", format!("customization {id} not found"))),
    }
}

/// Replace a customization spec. CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/customizations/{id}",
    request_body = CustomizationSpecSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Customization ID")
    ),
    responses((status = 200, description = "Spec updated", body = CustomizationSpecData)),
    tag = "customizations"
)]
pub async fn update_customization(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<CustomizationSpecSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut data = state.regs.customizations.get(&project, &id).await?;
    data.meta.revision = revision;
    data.spec = spec;
    let updated = match state.regs.customizations.update_spec(data).await {
        Ok(data) => data,
        Err(e) => {
            return Err(conflict_with_revision(&state.regs.customizations, &project, &id, e).await);
        }
    };
    state.audit.updated("customization", &updated.meta.id, &project);
    Ok(respond(&updated))
}

/// Delete a customization spec. Refused while VMs reference it.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/customizations/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Customization ID")
    ),
    responses(
        (status = 200, description = "Deleted", body = DeleteResponse),
        (status = 409, description = "VMs still reference the customization", body = ApiError)
    ),
    tag = "customizations"
)]
pub async fn delete_customization(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let spec = state.regs.customizations.get(&project, &id).await?;

    let vms = state.regs.vms.list(None, None).await?;
    let referenced = vms
        .iter()
        .filter(|vm| vm.spec.customization_id.as_deref() == Some(spec.meta.id.as_str()))
        .count();
    if referenced > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{referenced} VM(s) still reference this customization"),
        ));
    }

    state.regs.customizations.remove(&project, &spec.meta.id).await?;
    state.audit.deleted("customization", &spec.meta.id, &project, false);
    Ok(Json(DeleteResponse { deleting: true }))
}
