//! REST handlers.
//!
//! A uniform resource API per kind: CRUD under `/projects/{p}/{kind}` with
//! CAS via `If-Match`, cascade-aware deletes, label-selector lists, and a
//! `?watch=1` SSE variant of every list. Status is read-only to clients;
//! spec writes pass through admission first.

pub mod cluster;
pub mod customizations;
pub mod edge;
pub mod images;
pub mod networks;
pub mod nodes;
pub mod ports;
pub mod storage;
pub mod tokens;
pub mod vms;

use axum::Json;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::watch;
use utoipa::ToSchema;

use crate::admission::Admission;
use crate::audit::AuditLogger;
use crate::controller::ControllerConfig;
use crate::elector::LeaderState;
use crate::eventbus::Queues;
use crate::model::Resource;
use crate::registries::Registries;
use crate::store::registry::{Registry, RegistryEvent};
use crate::store::StoreError;

/// Shared application state.
pub struct AppState {
    pub regs: Registries,
    pub admission: Arc<Admission>,
    pub audit: Arc<AuditLogger>,
    pub queues: Arc<Queues>,
    pub leader: watch::Receiver<LeaderState>,
    pub cfg: ControllerConfig,
}

/// Revision header on every object response.
pub const REVISION_HEADER: &str = "X-Resource-Revision";

/// API error body.
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    pub code: u16,
    pub reason: String,
    pub message: String,
    /// Currently-observed revision, on CAS conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl ApiError {
    pub fn new(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.to_string(),
            message: message.into(),
            revision: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let code = match &e {
            StoreError::NotFound(_) => 404,
            StoreError::AlreadyExists(_) | StoreError::Conflict(_) => 409,
            StoreError::InvalidArgument(_) => 400,
            StoreError::PermissionDenied(_) => 403,
            StoreError::ResourceExhausted(_) => 429,
            StoreError::FailedPrecondition(_) => 412,
            StoreError::Unavailable(_) => 503,
            StoreError::OperationFailed { .. } => 502,
            StoreError::Internal(_) => 500,
        };
        ApiError::new(code, e.reason(), e.to_string())
    }
}

/// Serialize an object with its revision header.
pub fn respond<R: Resource>(obj: &R) -> Response {
    let revision = obj.meta().revision;
    let mut response = Json(obj).into_response();
    if let Ok(value) = revision.to_string().parse() {
        response.headers_mut().insert(REVISION_HEADER, value);
    }
    response
}

pub fn respond_list<R: Resource>(objs: &[R]) -> Response {
    Json(objs).into_response()
}

/// `If-Match` is mandatory on spec updates; its value is the envelope
/// revision the client read.
pub fn require_if_match(headers: &HeaderMap) -> Result<u64, ApiError> {
    let value = headers
        .get(header::IF_MATCH)
        .ok_or_else(|| ApiError::new(400, "invalid_argument", "If-Match header is required"))?;
    value
        .to_str()
        .ok()
        .map(|s| s.trim().trim_matches('"'))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::new(400, "invalid_argument", "If-Match must be a revision number"))
}

/// Minimal role hook: deployments front the API with their auth proxy and
/// assert the caller's role in this header. Viewers cannot write.
pub fn require_writer(headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(role) = headers.get("x-auth-role").and_then(|v| v.to_str().ok()) {
        if role.eq_ignore_ascii_case("viewer") {
            return Err(ApiError::new(
                403,
                "permission_denied",
                "role 'viewer' cannot mutate resources",
            ));
        }
    }
    Ok(())
}

/// Parse `role=db,zone=a` style label selectors.
pub fn parse_selector(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Map a CAS conflict into a 409 carrying the currently-observed revision,
/// per the API contract.
pub async fn conflict_with_revision<R: Resource>(
    reg: &Registry<R>,
    project: &str,
    id: &str,
    e: StoreError,
) -> ApiError {
    let mut api: ApiError = e.into();
    if api.code == 409 {
        if let Ok(Some(current)) = reg.try_get(project, id).await {
            api.revision = Some(current.meta().revision);
        }
    }
    api
}

/// Server-sent event stream of object changes for one kind, scoped to a
/// project. `resync` events tell the consumer to re-list.
pub fn watch_stream<R: Resource>(
    reg: Registry<R>,
    project: String,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = async_stream::stream! {
        let mut events = match reg.watch().await {
            Ok(rx) => rx,
            Err(_) => {
                yield Ok::<SseEvent, Infallible>(SseEvent::default().event("resync").data("{}"));
                return;
            }
        };
        while let Some(event) = events.recv().await {
            match event {
                RegistryEvent::Applied(obj) => {
                    if obj.meta().project_id != project && !project.is_empty() {
                        continue;
                    }
                    if let Ok(body) = serde_json::to_string(&obj) {
                        yield Ok(SseEvent::default().event("applied").data(body));
                    }
                }
                RegistryEvent::Deleted { key } => {
                    let id = key.rsplit('/').next().unwrap_or_default().to_string();
                    yield Ok(SseEvent::default()
                        .event("deleted")
                        .data(format!("{{\"id\":\"{id}\"}}")));
                }
                RegistryEvent::Resync => {
                    yield Ok(SseEvent::default().event("resync").data("{}"));
                }
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Version information.
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version.
#[utoipa::path(
    get,
    path = "/v1/version",
    responses((status = 200, description = "Service version", body = VersionInfo)),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
