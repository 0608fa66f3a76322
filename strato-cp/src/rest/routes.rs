use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, AppState, cluster, customizations, edge, images, networks, nodes, ports, storage, tokens, vms};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "strato control plane",
        version = "0.1.0",
        description = "Declarative virtualization cluster manager. VMs, networks, ports, volumes, pools, and snapshots are spec/status objects reconciled by leader-elected controllers.",
        license(name = "MIT")
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "cluster", description = "Clusters and control-plane status"),
        (name = "projects", description = "Tenancy"),
        (name = "nodes", description = "Hypervisor node registration and lifecycle"),
        (name = "tokens", description = "Registration tokens"),
        (name = "vms", description = "Virtual machines"),
        (name = "networks", description = "Virtual networks"),
        (name = "security-groups", description = "Firewall rule sets"),
        (name = "ports", description = "Network ports"),
        (name = "storage", description = "Pools, volumes, snapshots"),
        (name = "images", description = "Images and OVA ingest"),
        (name = "edge", description = "Floating IPs, load balancers, VPN services"),
        (name = "customizations", description = "Guest provisioning templates")
    ),
    paths(
        handlers::get_version,
        cluster::get_cluster_info,
        cluster::create_cluster,
        cluster::list_clusters,
        cluster::get_cluster,
        cluster::update_cluster,
        cluster::delete_cluster,
        cluster::create_project,
        cluster::list_projects,
        cluster::get_project,
        cluster::delete_project,
        nodes::register_node,
        nodes::node_heartbeat,
        nodes::list_nodes,
        nodes::get_node,
        nodes::drain_node,
        nodes::deregister_node,
        tokens::create_token,
        tokens::list_tokens,
        tokens::get_token,
        tokens::revoke_token,
        vms::create_vm,
        vms::list_vms,
        vms::get_vm,
        vms::update_vm_spec,
        vms::delete_vm,
        vms::vm_action_start,
        vms::vm_action_stop,
        vms::vm_action_reboot,
        vms::vm_action_migrate,
        vms::vm_action_snapshot,
        networks::create_network,
        networks::list_networks,
        networks::get_network,
        networks::update_network,
        networks::delete_network,
        networks::create_security_group,
        networks::list_security_groups,
        networks::get_security_group,
        networks::update_security_group,
        networks::delete_security_group,
        ports::create_port,
        ports::list_ports,
        ports::get_port,
        ports::update_port,
        ports::delete_port,
        storage::create_pool,
        storage::list_pools,
        storage::get_pool,
        storage::update_pool,
        storage::delete_pool,
        storage::create_volume,
        storage::list_volumes,
        storage::get_volume,
        storage::update_volume,
        storage::delete_volume,
        storage::create_snapshot,
        storage::list_snapshots,
        storage::get_snapshot,
        storage::delete_snapshot,
        images::create_image,
        images::list_images,
        images::get_image,
        images::delete_image,
        images::report_ova_progress,
        images::list_ova_jobs,
        edge::create_floating_ip,
        edge::list_floating_ips,
        edge::get_floating_ip,
        edge::update_floating_ip,
        edge::delete_floating_ip,
        edge::create_load_balancer,
        edge::list_load_balancers,
        edge::get_load_balancer,
        edge::update_load_balancer,
        edge::delete_load_balancer,
        edge::create_vpn_service,
        edge::list_vpn_services,
        edge::delete_vpn_service,
        customizations::create_customization,
        customizations::list_customizations,
        customizations::get_customization,
        customizations::update_customization,
        customizations::delete_customization,
    )
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // System
        .route("/version", get(handlers::get_version))
        // Control plane / clusters
        .route("/cluster", get(cluster::get_cluster_info))
        .route("/clusters", post(cluster::create_cluster))
        .route("/clusters", get(cluster::list_clusters))
        .route("/clusters/{id}", get(cluster::get_cluster))
        .route("/clusters/{id}", patch(cluster::update_cluster))
        .route("/clusters/{id}", delete(cluster::delete_cluster))
        // Projects
        .route("/projects", post(cluster::create_project))
        .route("/projects", get(cluster::list_projects))
        .route("/projects/{project}", get(cluster::get_project))
        .route("/projects/{project}", delete(cluster::delete_project))
        // Nodes
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes/{id}/heartbeat", post(nodes::node_heartbeat))
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/{id}", get(nodes::get_node))
        .route("/nodes/{id}/actions/drain", post(nodes::drain_node))
        .route("/nodes/{id}", delete(nodes::deregister_node))
        // Tokens
        .route("/tokens", post(tokens::create_token))
        .route("/tokens", get(tokens::list_tokens))
        .route("/tokens/{id}", get(tokens::get_token))
        .route("/tokens/{id}/revoke", post(tokens::revoke_token))
        // VMs
        .route("/projects/{project}/vms", post(vms::create_vm))
        .route("/projects/{project}/vms", get(vms::list_vms))
        .route("/projects/{project}/vms/{id}", get(vms::get_vm))
        .route("/projects/{project}/vms/{id}", patch(vms::update_vm_spec))
        .route("/projects/{project}/vms/{id}", delete(vms::delete_vm))
        .route(
            "/projects/{project}/vms/{id}/actions/start",
            post(vms::vm_action_start),
        )
        .route(
            "/projects/{project}/vms/{id}/actions/stop",
            post(vms::vm_action_stop),
        )
        .route(
            "/projects/{project}/vms/{id}/actions/reboot",
            post(vms::vm_action_reboot),
        )
        .route(
            "/projects/{project}/vms/{id}/actions/migrate",
            post(vms::vm_action_migrate),
        )
        .route(
            "/projects/{project}/vms/{id}/actions/snapshot",
            post(vms::vm_action_snapshot),
        )
        // Networks
        .route("/projects/{project}/networks", post(networks::create_network))
        .route("/projects/{project}/networks", get(networks::list_networks))
        .route("/projects/{project}/networks/{id}", get(networks::get_network))
        .route("/projects/{project}/networks/{id}", patch(networks::update_network))
        .route("/projects/{project}/networks/{id}", delete(networks::delete_network))
        // Security groups
        .route(
            "/projects/{project}/security-groups",
            post(networks::create_security_group),
        )
        .route(
            "/projects/{project}/security-groups",
            get(networks::list_security_groups),
        )
        .route(
            "/projects/{project}/security-groups/{id}",
            get(networks::get_security_group),
        )
        .route(
            "/projects/{project}/security-groups/{id}",
            patch(networks::update_security_group),
        )
        .route(
            "/projects/{project}/security-groups/{id}",
            delete(networks::delete_security_group),
        )
        // Ports
        .route("/projects/{project}/ports", post(ports::create_port))
        .route("/projects/{project}/ports", get(ports::list_ports))
        .route("/projects/{project}/ports/{id}", get(ports::get_port))
        .route("/projects/{project}/ports/{id}", patch(ports::update_port))
        .route("/projects/{project}/ports/{id}", delete(ports::delete_port))
        // Storage
        .route("/projects/{project}/pools", post(storage::create_pool))
        .route("/projects/{project}/pools", get(storage::list_pools))
        .route("/projects/{project}/pools/{id}", get(storage::get_pool))
        .route("/projects/{project}/pools/{id}", patch(storage::update_pool))
        .route("/projects/{project}/pools/{id}", delete(storage::delete_pool))
        .route("/projects/{project}/volumes", post(storage::create_volume))
        .route("/projects/{project}/volumes", get(storage::list_volumes))
        .route("/projects/{project}/volumes/{id}", get(storage::get_volume))
        .route("/projects/{project}/volumes/{id}", patch(storage::update_volume))
        .route("/projects/{project}/volumes/{id}", delete(storage::delete_volume))
        .route("/projects/{project}/snapshots", post(storage::create_snapshot))
        .route("/projects/{project}/snapshots", get(storage::list_snapshots))
        .route("/projects/{project}/snapshots/{id}", get(storage::get_snapshot))
        .route("/projects/{project}/snapshots/{id}", delete(storage::delete_snapshot))
        // Images
        .route("/projects/{project}/images", post(images::create_image))
        .route("/projects/{project}/images", get(images::list_images))
        .route("/projects/{project}/images/{id}", get(images::get_image))
        .route("/projects/{project}/images/{id}", delete(images::delete_image))
        .route(
            "/projects/{project}/ova-jobs/{id}/progress",
            post(images::report_ova_progress),
        )
        .route("/projects/{project}/ova-jobs", get(images::list_ova_jobs))
        // Edge
        .route("/projects/{project}/floating-ips", post(edge::create_floating_ip))
        .route("/projects/{project}/floating-ips", get(edge::list_floating_ips))
        .route("/projects/{project}/floating-ips/{id}", get(edge::get_floating_ip))
        .route("/projects/{project}/floating-ips/{id}", patch(edge::update_floating_ip))
        .route("/projects/{project}/floating-ips/{id}", delete(edge::delete_floating_ip))
        .route("/projects/{project}/load-balancers", post(edge::create_load_balancer))
        .route("/projects/{project}/load-balancers", get(edge::list_load_balancers))
        .route("/projects/{project}/load-balancers/{id}", get(edge::get_load_balancer))
        .route("/projects/{project}/load-balancers/{id}", patch(edge::update_load_balancer))
        .route("/projects/{project}/load-balancers/{id}", delete(edge::delete_load_balancer))
        .route("/projects/{project}/vpn-services", post(edge::create_vpn_service))
        .route("/projects/{project}/vpn-services", get(edge::list_vpn_services))
        .route("/projects/{project}/vpn-services/{id}", delete(edge::delete_vpn_service))
        // Customizations
        .route(
            "/projects/{project}/customizations",
            post(customizations::create_customization),
        )
        .route(
            "/projects/{project}/customizations",
            get(customizations::list_customizations),
        )
        .route(
            "/projects/{project}/customizations/{id}",
            get(customizations::get_customization),
        )
        .route(
            "/projects/{project}/customizations/{id}",
            patch(customizations::update_customization),
        )
        .route(
            "/projects/{project}/customizations/{id}",
            delete(customizations::delete_customization),
        );

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
