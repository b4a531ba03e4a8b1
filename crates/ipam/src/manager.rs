//! Collaborator traits
//!
//! The engine never touches pool ledgers, endpoint records or cluster objects
//! directly; it goes through these traits. Concrete implementations live with
//! the controllers owning those objects, the kube-backed lookups live in
//! `kube_lookup`, and in-memory mocks live in `mock` for unit testing.
//! All async methods must be `Send` to work with Tokio's work-stealing runtime.
//! Every method takes the caller's cancellation token and should give up with
//! [`ManagerError::Canceled`] once it fires; [`cancelable`] does the racing.

use crate::error::ManagerError;
use crate::types::{AllocationResult, IPConfig, IpAndUid, IpVersion};
use crate::workload::PodTopController;
use crds::{LabelSelector, SpiderEndpoint, SpiderIPPool};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use std::collections::BTreeMap;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs `call` until it completes or `token` is canceled.
///
/// `what` names the call in the cancellation error.
pub async fn cancelable<T, E, F>(token: &CancellationToken, what: &str, call: F) -> Result<T, ManagerError>
where
    F: Future<Output = Result<T, E>>,
    ManagerError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ManagerError::Canceled(what.to_string())),
        result = call => result.map_err(ManagerError::from),
    }
}

/// Pool ledger operations
///
/// Every mutating call is a compare-and-swap on the pool object that retries
/// on write conflict by itself.
#[async_trait::async_trait]
pub trait IPPoolManager: Send + Sync {
    /// Get a pool by name
    async fn get_ippool_by_name(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<SpiderIPPool, ManagerError>;

    /// List pools carrying all of `labels`
    async fn list_ippools(
        &self,
        token: &CancellationToken,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<SpiderIPPool>, ManagerError>;

    /// Draw one free address from `pool` for `pod`'s `nic`
    async fn allocate_ip(
        &self,
        token: &CancellationToken,
        pool: &str,
        nic: &str,
        pod: &Pod,
    ) -> Result<IPConfig, ManagerError>;

    /// Give addresses back to `pool`; addresses owned by another UID are left alone
    async fn release_ip(
        &self,
        token: &CancellationToken,
        pool: &str,
        ips: &[IpAndUid],
    ) -> Result<(), ManagerError>;

    /// Record `ips` as owned by their UID in `pool`, taking over previous owners
    async fn update_allocated_ips(
        &self,
        token: &CancellationToken,
        pool: &str,
        ips: &[IpAndUid],
    ) -> Result<(), ManagerError>;
}

/// Endpoint record operations
#[async_trait::async_trait]
pub trait EndpointManager: Send + Sync {
    /// Get the endpoint of a pod, `None` when there is none
    async fn get_endpoint_by_name(
        &self,
        token: &CancellationToken,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<SpiderEndpoint>, ManagerError>;

    /// Record `results` as the current allocation of `pod`, creating the endpoint if needed
    async fn patch_ip_allocation_results(
        &self,
        token: &CancellationToken,
        container_id: &str,
        results: &[AllocationResult],
        endpoint: Option<&SpiderEndpoint>,
        pod: &Pod,
        controller: &PodTopController,
    ) -> Result<(), ManagerError>;

    /// Point the current allocation of `endpoint` at a new pod incarnation
    async fn reallocate_current_ip_allocation(
        &self,
        token: &CancellationToken,
        container_id: &str,
        uid: &str,
        node_name: &str,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError>;

    /// Drop the finalizer so the endpoint can be garbage-collected
    async fn remove_finalizer(
        &self,
        token: &CancellationToken,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError>;

    /// Delete the endpoint
    async fn delete_endpoint(
        &self,
        token: &CancellationToken,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError>;
}

/// Subnet auto-pool operations
#[async_trait::async_trait]
pub trait SubnetManager: Send + Sync {
    /// Ask the subnet controller for a new, empty auto-pool
    #[allow(clippy::too_many_arguments, reason = "mirrors the auto-pool identity")]
    async fn allocate_empty_ippool(
        &self,
        token: &CancellationToken,
        subnet: &str,
        controller: &PodTopController,
        pod_selector: &LabelSelector,
        desired_ip_number: Option<usize>,
        version: IpVersion,
        reclaim: bool,
        nic: &str,
    ) -> Result<(), ManagerError>;

    /// Ask the subnet controller to resize `pool` to `desired_ip_number`
    async fn check_scale_ippool(
        &self,
        token: &CancellationToken,
        pool: &SpiderIPPool,
        subnet: &str,
        desired_ip_number: usize,
    ) -> Result<(), ManagerError>;
}

/// Pod lookups
#[async_trait::async_trait]
pub trait PodManager: Send + Sync {
    /// Get a pod by namespace and name
    async fn get_pod_by_name(
        &self,
        token: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<Pod, ManagerError>;

    /// Walk the owner chain of `pod` to its top controller
    async fn get_pod_top_controller(
        &self,
        token: &CancellationToken,
        pod: &Pod,
    ) -> Result<PodTopController, ManagerError>;
}

/// Namespace lookups
#[async_trait::async_trait]
pub trait NamespaceManager: Send + Sync {
    /// Get a namespace by name
    async fn get_namespace_by_name(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Namespace, ManagerError>;
}

/// Node lookups
#[async_trait::async_trait]
pub trait NodeManager: Send + Sync {
    /// Get a node by name
    async fn get_node_by_name(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Node, ManagerError>;
}

/// StatefulSet lookups
#[async_trait::async_trait]
pub trait StatefulSetManager: Send + Sync {
    /// Whether `pod_name` is still a replica the StatefulSet wants
    async fn is_valid_statefulset_pod(
        &self,
        token: &CancellationToken,
        namespace: &str,
        pod_name: &str,
        statefulset: &str,
    ) -> Result<bool, ManagerError>;
}
