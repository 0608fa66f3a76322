//! Image and OVA ingest endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{ImageData, ImageFormat, ImageSpec, OvaUploadJobData, OvaUploadState};

use super::vms::{DeleteQuery, DeleteResponse, ListQuery};
use super::{
    ApiError, AppState, parse_selector, require_writer, respond, respond_list, watch_stream,
};

#[derive(Deserialize, ToSchema)]
pub struct CreateImageRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: ImageSpec,
}

/// Register an image. OVA images get an ingest job tracked alongside.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/images",
    request_body = CreateImageRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Image created", body = ImageData)),
    tag = "images"
)]
pub async fn create_image(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateImageRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "image",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;

    let mut image = ImageData::default();
    image.meta.name = req.name;
    image.meta.project_id = project.clone();
    image.meta.labels = req.labels;
    image.spec = req.spec;

    let created = state.regs.images.create(image).await?;

    // The ingest pipeline reports OVA progress through the side table.
    if created.spec.format == ImageFormat::Ova {
        let mut job = OvaUploadJobData::default();
        job.meta.name = format!("{}-ingest", created.meta.name);
        job.meta.project_id = project;
        job.spec.image_id = created.meta.id.clone();
        state.regs.ova_jobs.create(job).await?;
    }

    state
        .audit
        .created("image", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.image.add(&created.meta.id);
    Ok(respond(&created))
}

/// List images, or stream changes with `?watch=1`.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/images",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("label" = Option<String>, Query, description = "Label selector"),
        ("watch" = Option<u8>, Query, description = "Stream changes as SSE")
    ),
    responses((status = 200, description = "Image list", body = Vec<ImageData>)),
    tag = "images"
)]
pub async fn list_images(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    if query.watch.unwrap_or(0) == 1 {
        return Ok(watch_stream(state.regs.images.clone(), project).into_response());
    }
    let selector = query.label.as_deref().map(parse_selector);
    let images = state.regs.images.list(Some(&project), selector.as_ref()).await?;
    Ok(respond_list(&images))
}

/// Read one image by id or name.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/images/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Image ID or name")
    ),
    responses(
        (status = 200, description = "Image found", body = ImageData),
        (status = 404, description = "Image not found", body = ApiError)
    ),
    tag = "images"
)]
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let image = match state.regs.images.try_get(&project, &id).await? {
        Some(image) => Some(image),
        None => state.regs.images.get_by_name(&project, &id).await?,
    };
    match image {
        Some(image) => Ok(respond(&image)),
        None => Err(ApiError::new(404, "not_found", format!("image {id} not found"))),
    }
}

/// Delete an image. Refused while volumes are cloned from it.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/images/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Image ID"),
        ("cascade" = Option<bool>, Query, description = "Unused for images; accepted for uniformity")
    ),
    responses(
        (status = 200, description = "Deletion begun", body = DeleteResponse),
        (status = 409, description = "Volumes still reference the image", body = ApiError)
    ),
    tag = "images"
)]
pub async fn delete_image(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    let image = state.regs.images.get(&project, &id).await?;

    let volumes = state.regs.volumes.list(None, None).await?;
    let clones = volumes
        .iter()
        .filter(|v| {
            matches!(&v.spec.source, Some(crate::model::VolumeSource::Image { image_id }) if image_id == &image.meta.id)
        })
        .count();
    if clones > 0 {
        return Err(ApiError::new(
            409,
            "conflict",
            format!("{clones} volume(s) are cloned from this image"),
        ));
    }

    state.regs.images.mark_deleted(&project, &image.meta.id).await?;
    state.audit.deleted("image", &image.meta.id, &project, query.cascade);
    state.queues.image.add(&image.meta.id);
    Ok(Json(DeleteResponse { deleting: true }))
}

#[derive(Deserialize, ToSchema)]
pub struct OvaProgressBody {
    pub state: OvaUploadState,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Ingest-pipeline callback: report OVA upload/convert progress.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/ova-jobs/{id}/progress",
    request_body = OvaProgressBody,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Upload job ID")
    ),
    responses((status = 200, description = "Progress recorded", body = OvaUploadJobData)),
    tag = "images"
)]
pub async fn report_ova_progress(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Json(body): Json<OvaProgressBody>,
) -> Result<Response, ApiError> {
    let job = state
        .regs
        .ova_jobs
        .patch_status(&project, &id, |j| {
            j.status.state = body.state;
            j.status.bytes_written = body.bytes_written;
            j.status.error_message = body.error_message.clone();
            Ok(())
        })
        .await?;
    if body.total_bytes > 0 {
        state
            .regs
            .ova_jobs
            .patch_spec(&project, &id, |j| {
                j.spec.total_bytes = body.total_bytes;
                Ok(())
            })
            .await?;
    }
    state.queues.image.add(&job.spec.image_id);
    Ok(respond(&job))
}

/// List OVA ingest jobs.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/ova-jobs",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Job list", body = Vec<OvaUploadJobData>)),
    tag = "images"
)]
pub async fn list_ova_jobs(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let jobs = state.regs.ova_jobs.list(Some(&project), None).await?;
    Ok(respond_list(&jobs))
}
