//! Allocation engine tests against the in-memory collaborators

mod common;

use common::{add_args, config, harness};
use ipam::annotations::{ANNO_POD_IPPOOL, ANNO_POD_IPPOOLS, ANNO_POD_ROUTES};
use ipam::mock::{ippool, pod, with_annotation, with_phase};
use ipam::{IpVersion, IpamError};
use std::time::Duration;

#[tokio::test]
async fn test_allocate_from_annotated_pool() {
    let h = harness(config());
    h.cluster.pools.add_pool(
        ippool("pool-a", 4, "10.6.0.0/16", Some("10.6.0.1")),
        &["10.6.0.10/16", "10.6.0.11/16"],
    );
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a"]}"#,
    ));

    let response = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap();

    assert_eq!(response.ips.len(), 1);
    assert_eq!(response.ips[0].address, "10.6.0.10/16");
    assert_eq!(response.ips[0].ip_pool, "pool-a");
    assert_eq!(response.ips[0].version, IpVersion::V4);
    assert_eq!(response.routes.len(), 1);
    assert_eq!(response.routes[0].dst, "0.0.0.0/0");
    assert_eq!(response.routes[0].gw, "10.6.0.1");

    let allocated = h.cluster.pools.allocated("pool-a");
    assert_eq!(allocated.get("10.6.0.10").map(String::as_str), Some("uid-1"));

    let endpoint = h.cluster.endpoints.endpoint("default", "web").unwrap();
    let current = endpoint.current().unwrap();
    assert_eq!(current.container_id, "c1");
    assert_eq!(current.uid, "uid-1");
    assert_eq!(current.ips[0].ipv4.as_deref(), Some("10.6.0.10/16"));
    assert!(h.cluster.endpoints.has_finalizer("default", "web"));
    assert!(h.ipam.failure_cache().is_empty());
}

#[tokio::test]
async fn test_multi_nic_call_reuses_current_allocation() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16"]);
    h.cluster
        .pools
        .add_pool(ippool("pool-b", 4, "10.7.0.0/16", None), &["10.7.0.10/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOLS,
        r#"{"eth0":{"ipv4":["pool-a"]},"net1":{"ipv4":["pool-b"]}}"#,
    ));

    let first = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap();
    assert_eq!(first.ips.len(), 2);
    assert_eq!(h.cluster.pools.allocate_calls(), 2);

    let second = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "net1")).await.unwrap();
    assert_eq!(h.cluster.pools.allocate_calls(), 2);
    assert_eq!(h.cluster.endpoints.patch_calls(), 1);
    let addresses: Vec<&str> = second.ips.iter().map(|ip| ip.address.as_str()).collect();
    assert_eq!(addresses, vec!["10.6.0.10/16", "10.7.0.10/16"]);
}

#[tokio::test]
async fn test_partial_failure_is_cached_and_reused() {
    let mut config = config();
    config.enable_ipv6 = true;
    let h = harness(config);
    h.cluster.pools.add_pool(ippool("v4-pool", 4, "10.6.0.0/16", None), &[]);
    h.cluster
        .pools
        .add_pool(ippool("v6-pool", 6, "fd00::/64", None), &["fd00::10/64"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["v4-pool"],"ipv6":["v6-pool"]}"#,
    ));
    let args = add_args("web", "uid-1", "c1", "eth0");

    let err = h.ipam.allocate(&h.token, &args).await.unwrap_err();
    assert!(err.any(&|e| matches!(e, IpamError::PoolsExhausted { version: IpVersion::V4, .. })));
    assert_eq!(h.cluster.pools.allocate_calls(), 2);
    assert_eq!(h.ipam.failure_cache().get("uid-1").map(|r| r.len()), Some(1));
    assert!(h.cluster.endpoints.endpoint("default", "web").is_none());

    h.cluster.pools.add_free("v4-pool", &["10.6.0.10/16"]);
    let response = h.ipam.allocate(&h.token, &args).await.unwrap();

    // Only the IPv4 address is drawn again
    assert_eq!(h.cluster.pools.allocate_calls(), 3);
    assert_eq!(h.metrics.failure_cache_reused_total.get(), 1);
    let addresses: Vec<&str> = response.ips.iter().map(|ip| ip.address.as_str()).collect();
    assert_eq!(addresses, vec!["10.6.0.10/16", "fd00::10/64"]);
    assert_eq!(h.cluster.pools.allocated("v6-pool").len(), 1);
    assert!(h.ipam.failure_cache().get("uid-1").is_none());
}

#[tokio::test]
async fn test_failed_patch_keeps_results_for_retry() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16", "10.6.0.11/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a"]}"#,
    ));
    let args = add_args("web", "uid-1", "c1", "eth0");

    h.cluster.endpoints.fail_patches(true);
    assert!(h.ipam.allocate(&h.token, &args).await.is_err());
    assert_eq!(h.cluster.pools.allocate_calls(), 1);

    h.cluster.endpoints.fail_patches(false);
    let response = h.ipam.allocate(&h.token, &args).await.unwrap();
    assert_eq!(response.ips[0].address, "10.6.0.10/16");
    assert_eq!(h.cluster.pools.allocate_calls(), 1);
    assert_eq!(h.cluster.pools.free_count("pool-a"), 1);
}

#[tokio::test]
async fn test_pools_tried_in_order_until_one_succeeds() {
    let h = harness(config());
    h.cluster.pools.add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &[]);
    h.cluster
        .pools
        .add_pool(ippool("pool-b", 4, "10.6.0.0/16", None), &["10.6.1.10/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a","pool-b"]}"#,
    ));

    let response = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap();
    assert_eq!(response.ips[0].ip_pool, "pool-b");
    assert_eq!(h.cluster.pools.allocate_calls(), 2);
}

#[tokio::test]
async fn test_filtered_out_pools_mutate_nothing() {
    let h = harness(config());
    let mut pool = ippool("pool-a", 4, "10.6.0.0/16", None);
    pool.spec.node_name = vec!["node-2".to_string()];
    h.cluster.pools.add_pool(pool, &["10.6.0.10/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a"]}"#,
    ));

    let err = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::NoAvailablePool(_)));
    assert!(err.to_string().contains("node node-1 is not allowed"));
    assert_eq!(h.cluster.pools.mutation_calls(), 0);
    assert_eq!(h.cluster.endpoints.patch_calls(), 0);
}

#[tokio::test]
async fn test_vlan_mismatch_rejected_before_drawing() {
    let h = harness(config());
    let mut a = ippool("pool-a", 4, "10.6.0.0/16", None);
    a.spec.vlan = Some(100);
    let mut b = ippool("pool-b", 4, "10.6.0.0/16", None);
    b.spec.vlan = Some(200);
    h.cluster.pools.add_pool(a, &["10.6.0.10/16"]);
    h.cluster.pools.add_pool(b, &["10.6.1.10/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a","pool-b"]}"#,
    ));

    let err = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::WrongInput(_)));
    assert_eq!(h.cluster.pools.mutation_calls(), 0);
}

#[tokio::test]
async fn test_finished_pod_is_refused() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16"]);
    h.cluster.lookup.add_pod(with_phase(
        with_annotation(pod("default", "job", "uid-1"), ANNO_POD_IPPOOL, r#"{"ipv4":["pool-a"]}"#),
        "Succeeded",
    ));

    let err = h.ipam.allocate(&h.token, &add_args("job", "uid-1", "c1", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::NotAllocatablePod { .. }));
    assert_eq!(h.cluster.pools.mutation_calls(), 0);
    assert_eq!(h.metrics.allocation_failure_total.get(), 1);
}

#[tokio::test]
async fn test_no_configured_source_is_no_available_pool() {
    let h = harness(config());
    h.cluster.lookup.add_pod(pod("default", "web", "uid-1"));

    let err = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::NoAvailablePool(_)));
}

#[tokio::test]
async fn test_cluster_default_pools_used_last() {
    let mut config = config();
    config.cluster_default_ipv4_ippool = vec!["default-v4".to_string()];
    let h = harness(config);
    h.cluster
        .pools
        .add_pool(ippool("default-v4", 4, "10.8.0.0/16", None), &["10.8.0.10/16"]);
    h.cluster
        .pools
        .add_pool(ippool("cni-v4", 4, "10.9.0.0/16", None), &["10.9.0.10/16"]);
    h.cluster.lookup.add_pod(pod("default", "web", "uid-1"));
    h.cluster.lookup.add_pod(pod("default", "db", "uid-2"));

    let response = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap();
    assert_eq!(response.ips[0].ip_pool, "default-v4");

    let mut args = add_args("db", "uid-2", "c2", "eth0");
    args.default_ipv4_ippool = vec!["cni-v4".to_string()];
    let response = h.ipam.allocate(&h.token, &args).await.unwrap();
    assert_eq!(response.ips[0].ip_pool, "cni-v4");
}

#[tokio::test]
async fn test_custom_routes_follow_their_gateway() {
    let h = harness(config());
    h.cluster.pools.add_pool(
        ippool("pool-a", 4, "10.6.0.0/16", Some("10.6.0.1")),
        &["10.6.0.10/16"],
    );
    let pod = with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a"],"cleangateway":true}"#,
    );
    h.cluster.lookup.add_pod(with_annotation(
        pod,
        ANNO_POD_ROUTES,
        r#"[{"dst":"172.16.0.0/16","gw":"10.6.0.254"}]"#,
    ));

    let response = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap();
    assert_eq!(response.routes.len(), 1);
    assert_eq!(response.routes[0].if_name, "eth0");
    assert_eq!(response.routes[0].dst, "172.16.0.0/16");
    assert_eq!(response.routes[0].gw, "10.6.0.254");
}

#[tokio::test]
async fn test_custom_route_outside_every_subnet_is_rejected() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16"]);
    let pod = with_annotation(pod("default", "web", "uid-1"), ANNO_POD_IPPOOL, r#"{"ipv4":["pool-a"]}"#);
    h.cluster.lookup.add_pod(with_annotation(
        pod,
        ANNO_POD_ROUTES,
        r#"[{"dst":"172.16.0.0/16","gw":"192.168.0.1"}]"#,
    ));

    let err = h.ipam.allocate(&h.token, &add_args("web", "uid-1", "c1", "eth0")).await.unwrap_err();
    assert!(matches!(err, IpamError::WrongInput(_)));
    assert!(h.ipam.failure_cache().get("uid-1").is_some());
}

#[tokio::test]
async fn test_cancel_aborts_hung_pool_draw() {
    let h = harness(config());
    h.cluster
        .pools
        .add_pool(ippool("pool-a", 4, "10.6.0.0/16", None), &["10.6.0.10/16"]);
    h.cluster.lookup.add_pod(with_annotation(
        pod("default", "web", "uid-1"),
        ANNO_POD_IPPOOL,
        r#"{"ipv4":["pool-a"]}"#,
    ));
    h.cluster.pools.hang_allocations(true);

    let token = h.token.child_token();
    let canceler = token.clone();
    let pools = h.cluster.pools.clone();
    tokio::spawn(async move {
        while pools.allocate_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        canceler.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        h.ipam.allocate(&token, &add_args("web", "uid-1", "c1", "eth0")),
    )
    .await
    .expect("allocation returns once canceled")
    .unwrap_err();

    assert!(err.any(&|e| matches!(e, IpamError::Canceled(_))));
    assert_eq!(h.cluster.pools.allocate_calls(), 1);
    assert_eq!(h.cluster.endpoints.patch_calls(), 0);
    assert_eq!(h.cluster.pools.free_count("pool-a"), 1);
}

#[tokio::test]
async fn test_engine_debug_output_shows_config() {
    let h = harness(config());
    let shown = format!("{:?}", h.ipam);
    assert!(shown.starts_with("Ipam"));
    assert!(shown.contains("Limiter"));
    assert!(format!("{:?}", h.cluster.managers()).starts_with("Managers"));
}
