//! Shared setup for the engine tests

#![allow(dead_code, reason = "each test binary uses a subset")]

use ipam::mock::MockCluster;
use ipam::{AddArgs, DelArgs, Ipam, IpamConfig, IpamMetrics};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub cluster: MockCluster,
    pub ipam: Ipam,
    pub metrics: Arc<IpamMetrics>,
    pub token: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub fn config() -> IpamConfig {
    let mut config = IpamConfig::default();
    config.operation_retries = 5;
    config.operation_gap_millis = 10;
    config.limiter.max_wait_seconds = 5;
    config
}

pub fn harness(config: IpamConfig) -> Harness {
    let cluster = MockCluster::new();
    let metrics = Arc::new(IpamMetrics::unregistered().unwrap());
    let ipam = Ipam::new(config, cluster.managers(), Arc::clone(&metrics)).unwrap();
    let token = CancellationToken::new();
    ipam.start(token.clone()).unwrap();
    Harness {
        cluster,
        ipam,
        metrics,
        token,
    }
}

pub fn add_args(name: &str, uid: &str, container_id: &str, if_name: &str) -> AddArgs {
    AddArgs {
        container_id: container_id.to_string(),
        if_name: if_name.to_string(),
        pod_namespace: "default".to_string(),
        pod_name: name.to_string(),
        pod_uid: uid.to_string(),
        ..Default::default()
    }
}

pub fn del_args(name: &str, uid: &str, container_id: &str) -> DelArgs {
    DelArgs {
        container_id: container_id.to_string(),
        if_name: "eth0".to_string(),
        pod_namespace: "default".to_string(),
        pod_name: name.to_string(),
        pod_uid: uid.to_string(),
        release_history: false,
    }
}
