//! End-to-end lifecycle tests: reconcile loops driving loopback hosts.

mod common;

use common::{TestServer, bodies};
use serde_json::{Value, json};
use std::time::Duration;
use strato_cp::nodeclient::NodeInfo;

const SETTLE: Duration = Duration::from_secs(15);

/// Project + shared pool + network, returning (pool_id, network_id).
async fn base_fixture(server: &TestServer, project: &str) -> (String, String) {
    server.post_json("/projects", &bodies::project(project)).await;

    let node_ids: Vec<String> = server
        .fleet
        .nodes
        .iter()
        .map(|n| n.meta.id.clone())
        .collect();
    let node_refs: Vec<&str> = node_ids.iter().map(|s| s.as_str()).collect();

    let pool: Value = server
        .post_json(
            &format!("/projects/{project}/pools"),
            &bodies::nfs_pool("pool-nfs-a", &node_refs),
        )
        .await
        .json()
        .await
        .unwrap();
    let pool_id = pool["id"].as_str().unwrap().to_string();

    // Pool must come READY before volumes can land on it.
    server
        .wait_for(
            &format!("/projects/{project}/pools/{pool_id}"),
            SETTLE,
            |p| p["status"]["phase"] == "READY",
        )
        .await;

    let net: Value = server
        .post_json(
            &format!("/projects/{project}/networks"),
            &bodies::network("net-1", "10.0.1.0/24"),
        )
        .await
        .json()
        .await
        .unwrap();
    let net_id = net["id"].as_str().unwrap().to_string();
    (pool_id, net_id)
}

// =============================================================================
// S1: VM create on a shared pool
// =============================================================================

#[tokio::test]
async fn test_vm_create_reaches_running_with_children() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let response = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 4, 8192, &pool_id, &net_id))
        .await;
    assert_eq!(response.status(), 200);
    let vm: Value = response.json().await.unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    assert_eq!(vm["status"]["state"], "PENDING");

    // The controller materializes children, schedules, defines, starts.
    let vm = server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;
    let node_id = vm["status"]["node_id"].as_str().unwrap().to_string();
    assert!(vm["status"]["ip_address"].is_string());

    // Child volume is attached, child port is active.
    let volume_id = vm["status"]["disk_volume_ids"][0].as_str().unwrap().to_string();
    let volume = server
        .wait_for(&format!("/projects/p1/volumes/{volume_id}"), SETTLE, |v| {
            v["status"]["phase"] == "IN_USE"
        })
        .await;
    assert_eq!(volume["status"]["attached_vm_id"], vm_id.as_str());

    let port_id = vm["status"]["nic_port_ids"][0].as_str().unwrap().to_string();
    let port = server
        .wait_for(&format!("/projects/p1/ports/{port_id}"), SETTLE, |p| {
            p["status"]["phase"] == "ACTIVE"
        })
        .await;
    assert!(port["status"]["mac_address"].as_str().unwrap().starts_with("52:54:00:"));
    assert!(port["status"]["ipv4_address"].is_string());

    // No double placement: the domain exists on exactly one host.
    let placed: usize = server
        .fleet
        .fabric
        .node_names()
        .iter()
        .filter(|name| {
            server
                .fleet
                .fabric
                .daemon(name)
                .map(|d| d.has_domain(&vm_id))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(placed, 1);

    // The bound node hosts it.
    let node: Value = server.get(&format!("/nodes/{node_id}")).await.json().await.unwrap();
    let daemon = server.fleet.fabric.daemon(node["name"].as_str().unwrap()).unwrap();
    assert!(daemon.has_domain(&vm_id));

    server.shutdown().await;
}

#[tokio::test]
async fn test_stop_start_and_reboot_round_trip() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    let path = format!("/projects/p1/vms/{vm_id}");

    server
        .wait_for(&path, SETTLE, |v| v["status"]["state"] == "RUNNING")
        .await;

    // Graceful stop.
    let response = server.post_json(&format!("{path}/actions/stop"), &json!({})).await;
    assert_eq!(response.status(), 200);
    server
        .wait_for(&path, SETTLE, |v| v["status"]["state"] == "STOPPED")
        .await;

    // Reboot of a stopped VM is a precondition failure.
    let response = server.post_json(&format!("{path}/actions/reboot"), &json!({})).await;
    assert_eq!(response.status(), 412);

    // Start again, then reboot.
    server.post_json(&format!("{path}/actions/start"), &json!({})).await;
    server
        .wait_for(&path, SETTLE, |v| v["status"]["state"] == "RUNNING")
        .await;
    let response = server.post_json(&format!("{path}/actions/reboot"), &json!({})).await;
    assert_eq!(response.status(), 200);
    server
        .wait_for(&path, SETTLE, |v| {
            v["status"]["last_reboot_nonce"].is_string() && v["status"]["state"] == "RUNNING"
        })
        .await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_idempotent_apply_produces_no_transitions() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    let path = format!("/projects/p1/vms/{vm_id}");

    let settled = server
        .wait_for(&path, SETTLE, |v| v["status"]["state"] == "RUNNING")
        .await;
    let generation = settled["generation"].as_u64().unwrap();

    // Re-apply the identical spec.
    let revision = settled["revision"].as_u64().unwrap();
    let response = server.patch_json(&path, revision, &settled["spec"]).await;
    assert_eq!(response.status(), 200);

    // Give the controller time to (not) act, then confirm the state is
    // untouched and the generation advanced exactly once.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let after: Value = server.get(&path).await.json().await.unwrap();
    assert_eq!(after["status"]["state"], "RUNNING");
    assert_eq!(after["generation"].as_u64().unwrap(), generation + 1);
    assert_eq!(
        after["status"]["node_id"].as_str(),
        settled["status"]["node_id"].as_str()
    );

    server.shutdown().await;
}

// =============================================================================
// S2: anti-affinity denial, then recovery on capacity change
// =============================================================================

#[tokio::test]
async fn test_anti_affinity_no_fit_then_recovery() {
    let server = TestServer::spawn_with_nodes(1).await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    // The only node hosts a VM labeled role=db.
    let mut db = bodies::vm("db-0", 2, 2048, &pool_id, &net_id);
    db["labels"] = json!({ "role": "db" });
    let db: Value = server.post_json("/projects/p1/vms", &db).await.json().await.unwrap();
    let db_id = db["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/vms/{db_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;

    // A VM that refuses to share a host with role=db cannot be placed.
    let mut lonely = bodies::vm("db-1", 2, 2048, &pool_id, &net_id);
    lonely["spec"]["placement"] = json!({ "anti_affinity_labels": { "role": "db" } });
    let lonely: Value = server.post_json("/projects/p1/vms", &lonely).await.json().await.unwrap();
    let lonely_id = lonely["id"].as_str().unwrap().to_string();

    let stuck = server
        .wait_for(&format!("/projects/p1/vms/{lonely_id}"), SETTLE, |v| {
            v["status"]["state"] == "ERROR"
        })
        .await;
    assert_eq!(stuck["status"]["reason"], "no_fit");
    assert!(
        stuck["status"]["error_message"]
            .as_str()
            .unwrap()
            .contains("anti_affinity")
    );

    // Deleting the blocker frees the host; the parked VM recovers without
    // user intervention.
    server.delete(&format!("/projects/p1/vms/{db_id}")).await;
    server
        .wait_for(&format!("/projects/p1/vms/{lonely_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;

    server.shutdown().await;
}

// =============================================================================
// S3: node failure, fencing, priority restart
// =============================================================================

#[tokio::test]
async fn test_ha_fences_dead_node_and_restarts_by_priority() {
    let server = TestServer::spawn_with_nodes(1).await;
    server.post_json("/projects", &bodies::project("p1")).await;

    // dev-0 is large; the survivor added later is small.
    let big = server.fleet.nodes[0].meta.id.clone();
    let small = server
        .add_node(
            "dev-small",
            NodeInfo {
                hostname: "dev-small".to_string(),
                cpu_cores: 24,
                memory_mib: 65536,
                disk_gib: 512,
                numa_nodes: 1,
                sriov_vfs: 0,
            },
        )
        .await;

    let pool: Value = server
        .post_json(
            "/projects/p1/pools",
            &bodies::nfs_pool("pool-nfs-a", &[big.as_str(), small.as_str()]),
        )
        .await
        .json()
        .await
        .unwrap();
    let pool_id = pool["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/pools/{pool_id}"), SETTLE, |p| {
            p["status"]["phase"] == "READY"
        })
        .await;
    let net: Value = server
        .post_json("/projects/p1/networks", &bodies::network("net-1", "10.0.1.0/24"))
        .await
        .json()
        .await
        .unwrap();
    let net_id = net["id"].as_str().unwrap().to_string();

    // Two VMs pinned onto the big node (32 cores); the 24-core survivor can
    // host the 18-core VM or the 12-core VM, not both.
    let mut v1 = bodies::vm("v1", 18, 8192, &pool_id, &net_id);
    v1["spec"]["placement"] = json!({ "node_id": big });
    v1["spec"]["ha_restart_priority"] = json!(5);
    let mut v2 = bodies::vm("v2", 12, 8192, &pool_id, &net_id);
    v2["spec"]["placement"] = json!({ "node_id": big });
    v2["spec"]["ha_restart_priority"] = json!(1);

    let v1: Value = server.post_json("/projects/p1/vms", &v1).await.json().await.unwrap();
    let v2: Value = server.post_json("/projects/p1/vms", &v2).await.json().await.unwrap();
    let v1_id = v1["id"].as_str().unwrap().to_string();
    let v2_id = v2["id"].as_str().unwrap().to_string();
    for id in [&v1_id, &v2_id] {
        server
            .wait_for(&format!("/projects/p1/vms/{id}"), SETTLE, |v| {
                v["status"]["state"] == "RUNNING"
            })
            .await;
    }

    // Pins would block restart elsewhere; clear them the way an operator
    // would before pulling the plug.
    for id in [&v1_id, &v2_id] {
        let current: Value = server.get(&format!("/projects/p1/vms/{id}")).await.json().await.unwrap();
        let mut spec = current["spec"].clone();
        spec["placement"] = json!({});
        let response = server
            .patch_json(
                &format!("/projects/p1/vms/{id}"),
                current["revision"].as_u64().unwrap(),
                &spec,
            )
            .await;
        assert_eq!(response.status(), 200);
    }

    // Kill the big host: heartbeats stop, the lease expires, fencing fires.
    server.kill_node("dev-0");
    server
        .wait_for(&format!("/nodes/{big}"), SETTLE, |n| {
            n["status"]["state"] == "FAILED"
        })
        .await;

    // High priority lands on the survivor.
    let v1_after = server
        .wait_for(&format!("/projects/p1/vms/{v1_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING" && v["status"]["node_id"] == small.as_str()
        })
        .await;
    assert_eq!(v1_after["status"]["node_id"], small.as_str());

    // Low priority parks on no_capacity.
    let v2_after = server
        .wait_for(&format!("/projects/p1/vms/{v2_id}"), SETTLE, |v| {
            v["status"]["state"] == "ERROR"
        })
        .await;
    assert_eq!(v2_after["status"]["reason"], "no_capacity");

    // A new survivor joining un-parks it without user intervention.
    let spare = server.add_node("dev-spare", strato_cp::server::dev_node_info("dev-spare")).await;
    let current: Value = server.get(&format!("/projects/p1/pools/{pool_id}")).await.json().await.unwrap();
    let mut spec = current["spec"].clone();
    spec["assigned_nodes"] = json!([big, small, spare]);
    server
        .patch_json(
            &format!("/projects/p1/pools/{pool_id}"),
            current["revision"].as_u64().unwrap(),
            &spec,
        )
        .await;

    server
        .wait_for(&format!("/projects/p1/vms/{v2_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;

    server.shutdown().await;
}

// =============================================================================
// S5: cascading delete refusal
// =============================================================================

#[tokio::test]
async fn test_pool_delete_refuses_then_cascades() {
    let server = TestServer::spawn().await;
    let (pool_id, _) = base_fixture(&server, "p1").await;

    let volume: Value = server
        .post_json(
            "/projects/p1/volumes",
            &json!({ "name": "data-1", "spec": { "pool_id": pool_id, "size_gib": 10 } }),
        )
        .await
        .json()
        .await
        .unwrap();
    let volume_id = volume["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/volumes/{volume_id}"), SETTLE, |v| {
            v["status"]["phase"] == "READY"
        })
        .await;

    // Without cascade: Conflict.
    let response = server.delete(&format!("/projects/p1/pools/{pool_id}")).await;
    assert_eq!(response.status(), 409);

    // With cascade: volume goes first, then the pool.
    let response = server
        .delete(&format!("/projects/p1/pools/{pool_id}?cascade=true"))
        .await;
    assert_eq!(response.status(), 200);

    // Creating a volume on the dying pool is refused.
    let response = server
        .post_json(
            "/projects/p1/volumes",
            &json!({ "name": "late", "spec": { "pool_id": pool_id, "size_gib": 5 } }),
        )
        .await;
    assert_eq!(response.status(), 412);

    server
        .wait_gone(&format!("/projects/p1/volumes/{volume_id}"), SETTLE)
        .await;
    server.wait_gone(&format!("/projects/p1/pools/{pool_id}"), SETTLE).await;

    server.shutdown().await;
}

// =============================================================================
// IP pool exhaustion and reclaim
// =============================================================================

#[tokio::test]
async fn test_ip_pool_exhaustion_and_reclaim() {
    let server = TestServer::spawn().await;
    server.post_json("/projects", &bodies::project("p1")).await;

    // /29 leaves 5 allocatable hosts.
    let net: Value = server
        .post_json("/projects/p1/networks", &bodies::network("tiny", "10.0.9.0/29"))
        .await
        .json()
        .await
        .unwrap();
    let net_id = net["id"].as_str().unwrap().to_string();

    let mut port_ids = Vec::new();
    for i in 0..5 {
        let port: Value = server
            .post_json(
                "/projects/p1/ports",
                &json!({ "name": format!("port-{i}"), "spec": { "network_id": net_id } }),
            )
            .await
            .json()
            .await
            .unwrap();
        let id = port["id"].as_str().unwrap().to_string();
        server
            .wait_for(&format!("/projects/p1/ports/{id}"), SETTLE, |p| {
                p["status"]["ipv4_address"].is_string()
            })
            .await;
        port_ids.push(id);
    }

    // The sixth port exhausts the subnet.
    let port: Value = server
        .post_json(
            "/projects/p1/ports",
            &json!({ "name": "port-overflow", "spec": { "network_id": net_id } }),
        )
        .await
        .json()
        .await
        .unwrap();
    let overflow = port["id"].as_str().unwrap().to_string();
    let stuck = server
        .wait_for(&format!("/projects/p1/ports/{overflow}"), SETTLE, |p| {
            p["status"]["phase"] == "ERROR"
        })
        .await;
    assert!(
        stuck["status"]["error_message"]
            .as_str()
            .unwrap()
            .contains("resource exhausted")
    );

    // Reclaim one address; a fresh port allocates fine.
    server
        .delete(&format!("/projects/p1/ports/{}", port_ids[0]))
        .await;
    server
        .wait_gone(&format!("/projects/p1/ports/{}", port_ids[0]), SETTLE)
        .await;

    let port: Value = server
        .post_json(
            "/projects/p1/ports",
            &json!({ "name": "port-retry", "spec": { "network_id": net_id } }),
        )
        .await
        .json()
        .await
        .unwrap();
    let retry = port["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/ports/{retry}"), SETTLE, |p| {
            p["status"]["ipv4_address"].is_string()
        })
        .await;

    server.shutdown().await;
}

// =============================================================================
// Snapshots: quiesce choreography and clone pinning
// =============================================================================

#[tokio::test]
async fn test_snapshot_of_running_vm_is_consistent() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;

    let snap: Value = server
        .post_json(
            &format!("/projects/p1/vms/{vm_id}/actions/snapshot"),
            &json!({ "name": "pre-upgrade" }),
        )
        .await
        .json()
        .await
        .unwrap();
    let snap_id = snap["id"].as_str().unwrap().to_string();

    let ready = server
        .wait_for(&format!("/projects/p1/snapshots/{snap_id}"), SETTLE, |s| {
            s["status"]["phase"] == "READY"
        })
        .await;
    assert_eq!(ready["status"]["consistent"], true);

    // A clone pins the snapshot.
    let vm_detail: Value = server.get(&format!("/projects/p1/vms/{vm_id}")).await.json().await.unwrap();
    let _parent_volume = vm_detail["status"]["disk_volume_ids"][0].as_str().unwrap();
    let clone: Value = server
        .post_json(
            "/projects/p1/volumes",
            &json!({
                "name": "clone-1",
                "spec": {
                    "pool_id": pool_id,
                    "size_gib": 20,
                    "source": { "type": "snapshot", "snapshot_id": snap_id },
                }
            }),
        )
        .await
        .json()
        .await
        .unwrap();
    let clone_id = clone["id"].as_str().unwrap().to_string();
    server
        .wait_for(&format!("/projects/p1/volumes/{clone_id}"), SETTLE, |v| {
            v["status"]["phase"] == "READY"
        })
        .await;

    let response = server
        .delete(&format!("/projects/p1/snapshots/{snap_id}"))
        .await;
    assert_eq!(response.status(), 409);

    // Deleting the clone unblocks the snapshot.
    server.delete(&format!("/projects/p1/volumes/{clone_id}")).await;
    server.wait_gone(&format!("/projects/p1/volumes/{clone_id}"), SETTLE).await;
    let response = server
        .delete(&format!("/projects/p1/snapshots/{snap_id}"))
        .await;
    assert_eq!(response.status(), 200);
    server.wait_gone(&format!("/projects/p1/snapshots/{snap_id}"), SETTLE).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_without_guest_agent_is_crash_consistent() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    let vm = server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;

    // Break the guest agent on the hosting node.
    let node_id = vm["status"]["node_id"].as_str().unwrap();
    let node: Value = server.get(&format!("/nodes/{node_id}")).await.json().await.unwrap();
    server
        .fleet
        .fabric
        .daemon(node["name"].as_str().unwrap())
        .unwrap()
        .set_guest_agent_available(false);

    let snap: Value = server
        .post_json(
            &format!("/projects/p1/vms/{vm_id}/actions/snapshot"),
            &json!({ "name": "no-agent" }),
        )
        .await
        .json()
        .await
        .unwrap();
    let snap_id = snap["id"].as_str().unwrap().to_string();

    // Quiesce fails, the snapshot still lands, marked crash-consistent.
    let ready = server
        .wait_for(&format!("/projects/p1/snapshots/{snap_id}"), SETTLE, |s| {
            s["status"]["phase"] == "READY"
        })
        .await;
    assert_eq!(ready["status"]["consistent"], false);

    server.shutdown().await;
}

// =============================================================================
// Live migration
// =============================================================================

#[tokio::test]
async fn test_live_migration_moves_domain_once() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    let vm = server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;
    let source = vm["status"]["node_id"].as_str().unwrap().to_string();

    let response = server
        .post_json(
            &format!("/projects/p1/vms/{vm_id}/actions/migrate"),
            &json!({ "target": "auto" }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let migrated = server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["migration"]["phase"] == "completed"
                && v["status"]["state"] == "RUNNING"
        })
        .await;
    let target = migrated["status"]["node_id"].as_str().unwrap().to_string();
    assert_ne!(source, target);

    // Exactly one host has the domain after the move.
    let placed: usize = server
        .fleet
        .fabric
        .node_names()
        .iter()
        .filter(|name| {
            server
                .fleet
                .fabric
                .daemon(name)
                .map(|d| d.has_domain(&vm_id))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(placed, 1);

    server.shutdown().await;
}

// =============================================================================
// VM deletion tears children down
// =============================================================================

#[tokio::test]
async fn test_vm_delete_cleans_up_ports_and_detaches_volumes() {
    let server = TestServer::spawn().await;
    let (pool_id, net_id) = base_fixture(&server, "p1").await;

    let vm: Value = server
        .post_json("/projects/p1/vms", &bodies::vm("web-1", 2, 2048, &pool_id, &net_id))
        .await
        .json()
        .await
        .unwrap();
    let vm_id = vm["id"].as_str().unwrap().to_string();
    let vm = server
        .wait_for(&format!("/projects/p1/vms/{vm_id}"), SETTLE, |v| {
            v["status"]["state"] == "RUNNING"
        })
        .await;
    let volume_id = vm["status"]["disk_volume_ids"][0].as_str().unwrap().to_string();
    let port_id = vm["status"]["nic_port_ids"][0].as_str().unwrap().to_string();

    server.delete(&format!("/projects/p1/vms/{vm_id}")).await;
    server.wait_gone(&format!("/projects/p1/vms/{vm_id}"), SETTLE).await;
    server.wait_gone(&format!("/projects/p1/ports/{port_id}"), SETTLE).await;

    // The volume survives, detached and reusable.
    let volume = server
        .wait_for(&format!("/projects/p1/volumes/{volume_id}"), SETTLE, |v| {
            v["status"]["phase"] == "READY"
        })
        .await;
    assert_eq!(volume["status"]["attached_vm_id"], "");

    // No host still carries the domain.
    for name in server.fleet.fabric.node_names() {
        assert!(!server.fleet.fabric.daemon(&name).unwrap().has_domain(&vm_id));
    }

    server.shutdown().await;
}
