//! REST API integration tests against a single-process control plane.

mod common;

use common::{TestServer, bodies};
use serde_json::{Value, json};

// =============================================================================
// System
// =============================================================================

#[tokio::test]
async fn test_get_version() {
    let server = TestServer::spawn().await;

    let response = server.get("/version").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(!body["version"].as_str().unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_cluster_info_reports_leadership_and_fleet() {
    let server = TestServer::spawn().await;

    let body: Value = server.get("/cluster").await.json().await.unwrap();
    assert_eq!(body["is_leader"], true);
    assert!(body["lease_revision"].is_number());
    assert_eq!(body["node_count"], 2);

    server.shutdown().await;
}

// =============================================================================
// Projects
// =============================================================================

#[tokio::test]
async fn test_project_crud() {
    let server = TestServer::spawn().await;

    let response = server.post_json("/projects", &bodies::project("acme")).await;
    assert_eq!(response.status(), 200);

    // Duplicate id is rejected.
    let response = server.post_json("/projects", &bodies::project("acme")).await;
    assert_eq!(response.status(), 409);

    // Invalid id is rejected up front.
    let response = server.post_json("/projects", &bodies::project("Not Valid")).await;
    assert_eq!(response.status(), 400);

    let body: Value = server.get("/projects").await.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);

    let response = server.delete("/projects/acme").await;
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

// =============================================================================
// Tokens
// =============================================================================

#[tokio::test]
async fn test_token_secret_shown_once_and_redacted() {
    let server = TestServer::spawn().await;

    let response = server
        .post_json("/tokens", &json!({ "name": "ops-join", "max_uses": 3 }))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let secret = body["token"].as_str().unwrap();
    assert!(secret.starts_with("STRATO-"));
    let id = body["id"].as_str().unwrap().to_string();

    // Reads never include the secret.
    let body: Value = server.get(&format!("/tokens/{id}")).await.json().await.unwrap();
    assert!(body.get("token").is_none());
    assert!(body.get("secret").is_none());
    assert_eq!(body["max_uses"], 3);

    // Revocation leaves an auditable tombstone.
    let response = server.post_json(&format!("/tokens/{id}/revoke"), &json!({})).await;
    assert_eq!(response.status(), 200);
    let body: Value = server.get(&format!("/tokens/{id}")).await.json().await.unwrap();
    assert!(body["status"]["revoked_at"].is_string());

    server.shutdown().await;
}

#[tokio::test]
async fn test_registration_rejects_revoked_token() {
    let server = TestServer::spawn().await;

    let created: Value = server
        .post_json("/tokens", &json!({ "name": "one-shot", "max_uses": 1 }))
        .await
        .json()
        .await
        .unwrap();
    let secret = created["token"].as_str().unwrap().to_string();
    let id = created["id"].as_str().unwrap().to_string();
    server.post_json(&format!("/tokens/{id}/revoke"), &json!({})).await;

    let response = server
        .post_json(
            "/nodes/register",
            &json!({
                "token": secret,
                "name": "rogue",
                "address": "http://rogue:50051",
                "cluster_id": server.fleet.cluster.meta.id,
                "registration_nonce": "rogue-nonce",
                "capacity": { "cpu_cores": 4, "memory_mib": 8192, "disk_gib": 100 },
            }),
        )
        .await;
    assert_eq!(response.status(), 403);

    server.shutdown().await;
}

// =============================================================================
// Uniform resource API mechanics
// =============================================================================

#[tokio::test]
async fn test_network_crud_with_cas() {
    let server = TestServer::spawn().await;
    server.post_json("/projects", &bodies::project("p1")).await;

    let response = server
        .post_json("/projects/p1/networks", &bodies::network("net-1", "10.0.1.0/24"))
        .await;
    assert_eq!(response.status(), 200);
    let revision: u64 = response
        .headers()
        .get("X-Resource-Revision")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();

    // PATCH without If-Match is a 400.
    let response = server
        .client
        .patch(format!("{}/projects/p1/networks/{id}", server.base_url()))
        .json(&json!({ "ipv4_cidr": "10.0.2.0/24" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Stale revision is a 409 that reports the observed revision.
    let response = server
        .patch_json(
            &format!("/projects/p1/networks/{id}"),
            revision + 1000,
            &json!({ "kind": { "type": "overlay", "vni": 0 }, "ipv4_cidr": "10.0.2.0/24" }),
        )
        .await;
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert!(body["revision"].is_number());

    // Matching revision wins.
    let current: Value = server
        .get(&format!("/projects/p1/networks/{id}"))
        .await
        .json()
        .await
        .unwrap();
    let revision = current["revision"].as_u64().unwrap();
    let response = server
        .patch_json(
            &format!("/projects/p1/networks/{id}"),
            revision,
            &json!({ "kind": { "type": "overlay", "vni": 0 }, "ipv4_cidr": "10.0.2.0/24" }),
        )
        .await;
    assert_eq!(response.status(), 200);

    // Lookup by name matches lookup by id.
    let by_name: Value = server
        .get("/projects/p1/networks/net-1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_name["id"].as_str().unwrap(), id);

    server.shutdown().await;
}

#[tokio::test]
async fn test_label_selector_filters_lists() {
    let server = TestServer::spawn().await;
    server.post_json("/projects", &bodies::project("p1")).await;

    let mut labeled = bodies::network("net-db", "10.1.0.0/24");
    labeled["labels"] = json!({ "tier": "db" });
    server.post_json("/projects/p1/networks", &labeled).await;
    server
        .post_json("/projects/p1/networks", &bodies::network("net-web", "10.2.0.0/24"))
        .await;

    let body: Value = server
        .get("/projects/p1/networks?label=tier%3Ddb")
        .await
        .json()
        .await
        .unwrap();
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["name"], "net-db");

    server.shutdown().await;
}

#[tokio::test]
async fn test_viewer_role_cannot_mutate() {
    let server = TestServer::spawn().await;
    server.post_json("/projects", &bodies::project("p1")).await;

    let response = server
        .client
        .post(format!("{}/projects/p1/networks", server.base_url()))
        .header("X-Auth-Role", "viewer")
        .json(&bodies::network("net-1", "10.0.1.0/24"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Reads remain open to viewers.
    let response = server
        .client
        .get(format!("{}/projects/p1/networks", server.base_url()))
        .header("X-Auth-Role", "viewer")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_policy_rule_denies_and_warns() {
    let server = TestServer::spawn().await;
    server.post_json("/projects", &bodies::project("p1")).await;

    // Install a deny rule on the cluster.
    let cluster_id = server.fleet.cluster.meta.id.clone();
    let cluster: Value = server
        .get(&format!("/clusters/{cluster_id}"))
        .await
        .json()
        .await
        .unwrap();
    let revision = cluster["revision"].as_u64().unwrap();
    let mut spec = cluster["spec"].clone();
    spec["policy_rules"] = json!([
        {
            "name": "no-forbidden",
            "priority": 1,
            "kind": "network",
            "verb": "create",
            "match_labels": { "forbidden": "true" },
            "action": "deny",
            "message": "forbidden networks are not allowed"
        }
    ]);
    let response = server
        .patch_json(&format!("/clusters/{cluster_id}"), revision, &spec)
        .await;
    assert_eq!(response.status(), 200);

    let mut body = bodies::network("net-bad", "10.9.0.0/24");
    body["labels"] = json!({ "forbidden": "true" });
    let response = server.post_json("/projects/p1/networks", &body).await;
    assert_eq!(response.status(), 403);

    // Unlabeled creates still pass.
    let response = server
        .post_json("/projects/p1/networks", &bodies::network("net-ok", "10.8.0.0/24"))
        .await;
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_quota_enforced_at_admission() {
    let server = TestServer::spawn().await;
    server
        .post_json(
            "/projects",
            &json!({ "id": "small", "spec": { "quota": { "max_vms": 1 } } }),
        )
        .await;

    let node = server.fleet.nodes[0].meta.id.clone();
    let pool: Value = server
        .post_json("/projects/small/pools", &bodies::nfs_pool("pool-a", &[&node]))
        .await
        .json()
        .await
        .unwrap();
    let net: Value = server
        .post_json("/projects/small/networks", &bodies::network("net-1", "10.0.1.0/24"))
        .await
        .json()
        .await
        .unwrap();
    let pool_id = pool["id"].as_str().unwrap();
    let net_id = net["id"].as_str().unwrap();

    let response = server
        .post_json(
            "/projects/small/vms",
            &bodies::vm("vm-1", 2, 2048, pool_id, net_id),
        )
        .await;
    assert_eq!(response.status(), 200);

    // The second VM exceeds max_vms=1.
    let response = server
        .post_json(
            "/projects/small/vms",
            &bodies::vm("vm-2", 2, 2048, pool_id, net_id),
        )
        .await;
    assert_eq!(response.status(), 429);

    server.shutdown().await;
}

#[tokio::test]
async fn test_node_listing_and_drain() {
    let server = TestServer::spawn().await;

    let body: Value = server.get("/nodes").await.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);

    let body: Value = server.get("/nodes?state=READY").await.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);

    let node_id = server.fleet.nodes[0].meta.id.clone();
    let response = server
        .post_json(&format!("/nodes/{node_id}/actions/drain"), &json!({}))
        .await;
    assert_eq!(response.status(), 200);
    let body: Value = server.get(&format!("/nodes/{node_id}")).await.json().await.unwrap();
    assert_eq!(body["status"]["state"], "DRAINING");

    server.shutdown().await;
}
