//! Edge objects: floating IPs, load balancers, VPN services.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::admission::{AdmissionRequest, QuotaDelta};
use crate::model::{
    FloatingIpData, FloatingIpSpec, LoadBalancerData, LoadBalancerSpec, VpnServiceData,
    VpnServiceSpec,
};

use super::vms::{DeleteQuery, DeleteResponse};
use super::{ApiError, AppState, require_if_match, require_writer, respond, respond_list};

async fn check_network(state: &AppState, network_id: &str) -> Result<(), ApiError> {
    match state.regs.networks.get_by_id(network_id).await? {
        Some(net) if !net.meta.deleting() => Ok(()),
        Some(net) => Err(ApiError::new(
            412,
            "failed_precondition",
            format!("network {} is being deleted", net.meta.name),
        )),
        None => Err(ApiError::new(
            404,
            "not_found",
            format!("network {network_id} not found"),
        )),
    }
}

// =============================================================================
// Floating IPs
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateFloatingIpRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: FloatingIpSpec,
}

/// Allocate a floating IP.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/floating-ips",
    request_body = CreateFloatingIpRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Floating IP created", body = FloatingIpData)),
    tag = "edge"
)]
pub async fn create_floating_ip(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateFloatingIpRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "floating-ip",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;
    check_network(&state, &req.spec.network_id).await?;

    let mut fip = FloatingIpData::default();
    fip.meta.name = req.name;
    fip.meta.project_id = project;
    fip.meta.labels = req.labels;
    fip.spec = req.spec;

    let created = state.regs.floating_ips.create(fip).await?;
    state
        .audit
        .created("floating-ip", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.floating_ip.add(&created.meta.id);
    Ok(respond(&created))
}

/// List floating IPs.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/floating-ips",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Floating IP list", body = Vec<FloatingIpData>)),
    tag = "edge"
)]
pub async fn list_floating_ips(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let fips = state.regs.floating_ips.list(Some(&project), None).await?;
    Ok(respond_list(&fips))
}

/// Read one floating IP.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/floating-ips/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Floating IP ID or name")
    ),
    responses((status = 200, description = "Floating IP", body = FloatingIpData)),
    tag = "edge"
)]
pub async fn get_floating_ip(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let fip = match state.regs.floating_ips.try_get(&project, &id).await? {
        Some(fip) => Some(fip),
        None => state.regs.floating_ips.get_by_name(&project, &id).await?,
    };
    match fip {
        Some(fip) => Ok(respond(&fip)),
        None => Err(ApiError::new(404, "not_found", format!("floating ip {id} not found"))),
    }
}

/// Re-point or update a floating IP. CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/floating-ips/{id}",
    request_body = FloatingIpSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Floating IP ID")
    ),
    responses((status = 200, description = "Spec updated", body = FloatingIpData)),
    tag = "edge"
)]
pub async fn update_floating_ip(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<FloatingIpSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut fip = state.regs.floating_ips.get(&project, &id).await?;
    fip.meta.revision = revision;
    fip.spec = spec;
    let updated = state.regs.floating_ips.update_spec(fip).await?;
    state.audit.updated("floating-ip", &updated.meta.id, &project);
    state.queues.floating_ip.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Release a floating IP.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/floating-ips/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Floating IP ID")
    ),
    responses((status = 200, description = "Deletion begun", body = DeleteResponse)),
    tag = "edge"
)]
pub async fn delete_floating_ip(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    state.regs.floating_ips.mark_deleted(&project, &id).await?;
    state.audit.deleted("floating-ip", &id, &project, query.cascade);
    state.queues.floating_ip.add(&id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// Load balancers
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: LoadBalancerSpec,
}

/// Create a load balancer.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/load-balancers",
    request_body = CreateLoadBalancerRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Load balancer created", body = LoadBalancerData)),
    tag = "edge"
)]
pub async fn create_load_balancer(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateLoadBalancerRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    state
        .admission
        .check(&AdmissionRequest {
            kind: "load-balancer",
            verb: "create",
            project_id: &project,
            labels: &req.labels,
            delta: QuotaDelta::default(),
        })
        .await?;
    check_network(&state, &req.spec.network_id).await?;

    let mut lb = LoadBalancerData::default();
    lb.meta.name = req.name;
    lb.meta.project_id = project;
    lb.meta.labels = req.labels;
    lb.spec = req.spec;

    let created = state.regs.load_balancers.create(lb).await?;
    state
        .audit
        .created("load-balancer", &created.meta.id, &created.meta.name, &created.meta.project_id);
    state.queues.load_balancer.add(&created.meta.id);
    Ok(respond(&created))
}

/// List load balancers.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/load-balancers",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "Load balancer list", body = Vec<LoadBalancerData>)),
    tag = "edge"
)]
pub async fn list_load_balancers(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let lbs = state.regs.load_balancers.list(Some(&project), None).await?;
    Ok(respond_list(&lbs))
}

/// Read one load balancer.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/load-balancers/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Load balancer ID or name")
    ),
    responses((status = 200, description = "Load balancer", body = LoadBalancerData)),
    tag = "edge"
)]
pub async fn get_load_balancer(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let lb = match state.regs.load_balancers.try_get(&project, &id).await? {
        Some(lb) => Some(lb),
        None => state.regs.load_balancers.get_by_name(&project, &id).await?,
    };
    match lb {
        Some(lb) => Ok(respond(&lb)),
        None => Err(ApiError::new(404, "not_found", format!("load balancer {id} not found"))),
    }
}

/// Update listeners/members. CAS via `If-Match`.
#[utoipa::path(
    patch,
    path = "/v1/projects/{project}/load-balancers/{id}",
    request_body = LoadBalancerSpec,
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Load balancer ID")
    ),
    responses((status = 200, description = "Spec updated", body = LoadBalancerData)),
    tag = "edge"
)]
pub async fn update_load_balancer(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(spec): Json<LoadBalancerSpec>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    let revision = require_if_match(&headers)?;
    let mut lb = state.regs.load_balancers.get(&project, &id).await?;
    lb.meta.revision = revision;
    lb.spec = spec;
    let updated = state.regs.load_balancers.update_spec(lb).await?;
    state.audit.updated("load-balancer", &updated.meta.id, &project);
    state.queues.load_balancer.add(&updated.meta.id);
    Ok(respond(&updated))
}

/// Delete a load balancer.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/load-balancers/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "Load balancer ID")
    ),
    responses((status = 200, description = "Deletion begun", body = DeleteResponse)),
    tag = "edge"
)]
pub async fn delete_load_balancer(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    state.regs.load_balancers.mark_deleted(&project, &id).await?;
    state.audit.deleted("load-balancer", &id, &project, query.cascade);
    state.queues.load_balancer.add(&id);
    Ok(Json(DeleteResponse { deleting: true }))
}

// =============================================================================
// VPN services (stored kind, CRUD only)
// =============================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateVpnServiceRequest {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub spec: VpnServiceSpec,
}

/// Create a VPN service.
#[utoipa::path(
    post,
    path = "/v1/projects/{project}/vpn-services",
    request_body = CreateVpnServiceRequest,
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "VPN service created", body = VpnServiceData)),
    tag = "edge"
)]
pub async fn create_vpn_service(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateVpnServiceRequest>,
) -> Result<Response, ApiError> {
    require_writer(&headers)?;
    check_network(&state, &req.spec.network_id).await?;

    let mut vpn = VpnServiceData::default();
    vpn.meta.name = req.name;
    vpn.meta.project_id = project;
    vpn.meta.labels = req.labels;
    vpn.spec = req.spec;

    let created = state.regs.vpn_services.create(vpn).await?;
    state
        .audit
        .created("vpn-service", &created.meta.id, &created.meta.name, &created.meta.project_id);
    Ok(respond(&created))
}

/// List VPN services.
#[utoipa::path(
    get,
    path = "/v1/projects/{project}/vpn-services",
    params(("project" = String, Path, description = "Project ID")),
    responses((status = 200, description = "VPN service list", body = Vec<VpnServiceData>)),
    tag = "edge"
)]
pub async fn list_vpn_services(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Result<Response, ApiError> {
    let vpns = state.regs.vpn_services.list(Some(&project), None).await?;
    Ok(respond_list(&vpns))
}

/// Delete a VPN service.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project}/vpn-services/{id}",
    params(
        ("project" = String, Path, description = "Project ID"),
        ("id" = String, Path, description = "VPN service ID")
    ),
    responses((status = 200, description = "Deleted", body = DeleteResponse)),
    tag = "edge"
)]
pub async fn delete_vpn_service(
    State(state): State<Arc<AppState>>,
    Path((project, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_writer(&headers)?;
    state.regs.vpn_services.remove(&project, &id).await?;
    state.audit.deleted("vpn-service", &id, &project, false);
    Ok(Json(DeleteResponse { deleting: true }))
}
