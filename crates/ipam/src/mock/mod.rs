//! In-memory collaborators for unit testing
//!
//! These mocks keep their state in memory and count the calls made to them,
//! so tests can run the whole engine without a cluster and assert which
//! collaborator calls happened.

mod cluster;
mod endpoint;
mod pool;
mod subnet;

pub use cluster::MockClusterLookup;
pub use endpoint::{endpoint, MockEndpointManager};
pub use pool::MockIPPoolManager;
pub use subnet::MockSubnetManager;

use crate::ipam::Managers;
use crds::{SpiderIPPool, SpiderIPPoolSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Every mock collaborator, wired together
#[derive(Debug, Clone)]
pub struct MockCluster {
    /// Pool ledgers
    pub pools: MockIPPoolManager,
    /// Endpoint records
    pub endpoints: MockEndpointManager,
    /// Subnet controller, creating pools in `pools`
    pub subnets: MockSubnetManager,
    /// Pods, namespaces, nodes and StatefulSets
    pub lookup: MockClusterLookup,
}

impl MockCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        let pools = MockIPPoolManager::new();
        Self {
            subnets: MockSubnetManager::new(pools.clone()),
            pools,
            endpoints: MockEndpointManager::new(),
            lookup: MockClusterLookup::new(),
        }
    }

    /// Collaborators for [`crate::Ipam::new`]
    pub fn managers(&self) -> Managers {
        Managers {
            ippool: Arc::new(self.pools.clone()),
            endpoint: Arc::new(self.endpoints.clone()),
            subnet: Arc::new(self.subnets.clone()),
            pod: Arc::new(self.lookup.clone()),
            namespace: Arc::new(self.lookup.clone()),
            node: Arc::new(self.lookup.clone()),
            statefulset: Arc::new(self.lookup.clone()),
        }
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending pod scheduled on `node-1`
pub fn pod(namespace: &str, name: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
    }
}

/// Set the phase of `pod`
pub fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    pod.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
    pod
}

/// Add an annotation to `pod`
pub fn with_annotation(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    pod
}

/// Add a label to `pod`
pub fn with_label(mut pod: Pod, key: &str, value: &str) -> Pod {
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    pod
}

/// Pool of `version` (4 or 6) in `subnet` with an optional gateway
pub fn ippool(name: &str, version: i64, subnet: &str, gateway: Option<&str>) -> SpiderIPPool {
    SpiderIPPool::new(
        name,
        SpiderIPPoolSpec {
            ip_version: Some(version),
            subnet: subnet.to_string(),
            gateway: gateway.map(str::to_string),
            ..Default::default()
        },
    )
}
