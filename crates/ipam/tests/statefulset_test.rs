//! StatefulSet address retention

mod common;

use common::{add_args, config, del_args, harness, Harness};
use crds::{IPAllocationDetail, PodIPAllocation};
use ipam::manager::IPPoolManager;
use ipam::mock::{endpoint, ippool, pod};
use ipam::workload::{ControllerKind, PodTopController};
use ipam::{IpAndUid, IpamError};

fn web() -> PodTopController {
    PodTopController {
        kind: ControllerKind::StatefulSet,
        namespace: "default".to_string(),
        name: "web".to_string(),
        uid: "uid-sts".to_string(),
        replicas: Some(2),
        selector: None,
    }
}

fn allocation(container_id: &str, uid: &str, address: &str) -> PodIPAllocation {
    PodIPAllocation {
        container_id: container_id.to_string(),
        uid: uid.to_string(),
        node: "node-1".to_string(),
        ips: vec![IPAllocationDetail {
            nic: "eth0".to_string(),
            ipv4: Some(address.to_string()),
            ipv4_pool: Some("pool-a".to_string()),
            ipv4_gateway: Some("10.6.0.1".to_string()),
            ..Default::default()
        }],
        creation_time: None,
    }
}

/// Replica web-0 that held 10.6.0.10 under its previous UID
async fn previous_replica(h: &Harness) {
    h.cluster.pools.add_pool(
        ippool("pool-a", 4, "10.6.0.0/16", Some("10.6.0.1")),
        &["10.6.0.10/16", "10.6.0.11/16"],
    );
    let owned = [IpAndUid {
        ip: "10.6.0.10".to_string(),
        uid: "uid-old".to_string(),
    }];
    h.cluster.pools.update_allocated_ips(&h.token, "pool-a", &owned).await.unwrap();
    h.cluster.endpoints.insert(endpoint(
        "default",
        "web-0",
        "StatefulSet",
        "web",
        Some(allocation("c-old", "uid-old", "10.6.0.10/16")),
    ));
}

#[tokio::test]
async fn test_restarted_replica_keeps_its_address() {
    let h = harness(config());
    previous_replica(&h).await;
    h.cluster.lookup.add_pod_with_controller(pod("default", "web-0", "uid-new"), web());

    let response = h.ipam.allocate(&h.token, &add_args("web-0", "uid-new", "c-new", "eth0")).await.unwrap();

    assert_eq!(response.ips.len(), 1);
    assert_eq!(response.ips[0].address, "10.6.0.10/16");
    assert_eq!(response.routes[0].gw, "10.6.0.1");
    assert_eq!(h.cluster.pools.allocate_calls(), 0);
    assert_eq!(
        h.cluster.pools.allocated("pool-a").get("10.6.0.10").map(String::as_str),
        Some("uid-new")
    );

    let current = h.cluster.endpoints.endpoint("default", "web-0").unwrap().current().cloned().unwrap();
    assert_eq!(current.uid, "uid-new");
    assert_eq!(current.container_id, "c-new");
    assert_eq!(h.cluster.endpoints.reallocate_calls(), 1);
}

#[tokio::test]
async fn test_replica_without_current_allocation_is_data_broken() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16"]);
    h.cluster
        .endpoints
        .insert(endpoint("default", "web-0", "StatefulSet", "web", None));
    h.cluster.lookup.add_pod_with_controller(pod("default", "web-0", "uid-new"), web());

    let err = h.ipam.allocate(&h.token, &add_args("web-0", "uid-new", "c-new", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::DataBroken(_)));
    assert_eq!(h.cluster.pools.mutation_calls(), 0);
}

#[tokio::test]
async fn test_statefulset_reuse_disabled_allocates_fresh() {
    let mut config = config();
    config.enable_stateful_set = false;
    config.cluster_default_ipv4_ippool = vec!["pool-a".to_string()];
    let h = harness(config);
    previous_replica(&h).await;
    h.cluster.lookup.add_pod_with_controller(pod("default", "web-0", "uid-new"), web());

    let response = h.ipam.allocate(&h.token, &add_args("web-0", "uid-new", "c-new", "eth0")).await.unwrap();

    assert_eq!(h.cluster.pools.allocate_calls(), 1);
    assert_eq!(response.ips[0].address, "10.6.0.11/16");
}

#[tokio::test]
async fn test_valid_replica_keeps_addresses_on_release() {
    let h = harness(config());
    previous_replica(&h).await;
    h.cluster.lookup.set_statefulset_pod_valid("default", "web-0", true);

    h.ipam.release(&h.token, &del_args("web-0", "uid-old", "c-old")).await.unwrap();

    assert_eq!(h.cluster.pools.release_calls(), 0);
    assert!(h.cluster.endpoints.endpoint("default", "web-0").is_some());
}

#[tokio::test]
async fn test_scaled_down_replica_releases_everything() {
    let h = harness(config());
    previous_replica(&h).await;

    h.ipam.release(&h.token, &del_args("web-0", "uid-old", "c-old")).await.unwrap();

    assert!(h.cluster.pools.allocated("pool-a").is_empty());
    assert!(h.cluster.endpoints.endpoint("default", "web-0").is_none());
    assert_eq!(h.cluster.endpoints.delete_calls(), 1);
}
