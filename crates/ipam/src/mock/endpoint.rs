//! Mock endpoint records

use crate::convert::results_to_details;
use crate::error::ManagerError;
use crate::manager::EndpointManager;
use crate::types::AllocationResult;
use crate::workload::PodTopController;
use crds::{PodIPAllocation, SpiderEndpoint, SpiderEndpointSpec, SpiderEndpointStatus, ENDPOINT_FINALIZER};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Mock EndpointManager
///
/// Endpoints are keyed by (namespace, pod name), like the real objects.
#[derive(Debug, Clone, Default)]
pub struct MockEndpointManager {
    endpoints: Arc<Mutex<HashMap<(String, String), SpiderEndpoint>>>,
    fail_patches: Arc<AtomicBool>,
    patch_calls: Arc<AtomicUsize>,
    reallocate_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
}

fn key(endpoint: &SpiderEndpoint) -> (String, String) {
    (
        endpoint.metadata.namespace.clone().unwrap_or_default(),
        endpoint.metadata.name.clone().unwrap_or_default(),
    )
}

fn not_found(endpoint: &SpiderEndpoint) -> ManagerError {
    let (namespace, name) = key(endpoint);
    ManagerError::NotFound(format!("SpiderEndpoint {}/{}", namespace, name))
}

impl MockEndpointManager {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an endpoint (for test setup)
    pub fn insert(&self, endpoint: SpiderEndpoint) {
        self.endpoints.lock().unwrap().insert(key(&endpoint), endpoint);
    }

    /// Endpoint of pod `namespace/name`
    pub fn endpoint(&self, namespace: &str, name: &str) -> Option<SpiderEndpoint> {
        self.endpoints
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Whether the endpoint of pod `namespace/name` still carries its finalizer
    pub fn has_finalizer(&self, namespace: &str, name: &str) -> bool {
        self.endpoint(namespace, name)
            .and_then(|e| e.metadata.finalizers)
            .is_some_and(|f| f.iter().any(|f| f == ENDPOINT_FINALIZER))
    }

    /// Make every patch fail with an API error
    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    /// Number of `patch_ip_allocation_results` calls
    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    /// Number of `reallocate_current_ip_allocation` calls
    pub fn reallocate_calls(&self) -> usize {
        self.reallocate_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_endpoint` calls
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

/// Endpoint of pod `namespace/name` owned by `owner_kind/owner_name`
pub fn endpoint(
    namespace: &str,
    name: &str,
    owner_kind: &str,
    owner_name: &str,
    current: Option<PodIPAllocation>,
) -> SpiderEndpoint {
    let mut endpoint = SpiderEndpoint::new(name, SpiderEndpointSpec {});
    endpoint.metadata.namespace = Some(namespace.to_string());
    endpoint.metadata.finalizers = Some(vec![ENDPOINT_FINALIZER.to_string()]);
    endpoint.status = Some(SpiderEndpointStatus {
        current,
        history: Vec::new(),
        owner_controller_type: owner_kind.to_string(),
        owner_controller_name: owner_name.to_string(),
    });
    endpoint
}

#[async_trait::async_trait]
impl EndpointManager for MockEndpointManager {
    async fn get_endpoint_by_name(
        &self,
        _token: &CancellationToken,
        namespace: &str,
        pod_name: &str,
    ) -> Result<Option<SpiderEndpoint>, ManagerError> {
        Ok(self.endpoint(namespace, pod_name))
    }

    async fn patch_ip_allocation_results(
        &self,
        _token: &CancellationToken,
        container_id: &str,
        results: &[AllocationResult],
        _endpoint: Option<&SpiderEndpoint>,
        pod: &Pod,
        controller: &PodTopController,
    ) -> Result<(), ManagerError> {
        self.patch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(ManagerError::Conflict("SpiderEndpoint patch rejected".to_string()));
        }

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let details = results_to_details(results);

        let mut endpoints = self.endpoints.lock().unwrap();
        let stored = endpoints
            .entry((namespace.clone(), name.clone()))
            .or_insert_with(|| endpoint(&namespace, &name, "", "", None));
        let status = stored.status.get_or_insert_with(Default::default);
        status.owner_controller_type = controller.kind.to_string();
        status.owner_controller_name = controller.name.clone();

        match status.current.as_mut() {
            // Another interface of the same container
            Some(current) if current.container_id == container_id => {
                for detail in details {
                    current.ips.retain(|d| d.nic != detail.nic);
                    current.ips.push(detail);
                }
            }
            _ => {
                let allocation = PodIPAllocation {
                    container_id: container_id.to_string(),
                    uid: pod.metadata.uid.clone().unwrap_or_default(),
                    node: pod
                        .spec
                        .as_ref()
                        .and_then(|s| s.node_name.clone())
                        .unwrap_or_default(),
                    ips: details,
                    creation_time: Some(chrono::Utc::now()),
                };
                if let Some(previous) = status.current.replace(allocation) {
                    status.history.insert(0, previous);
                }
            }
        }

        let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == ENDPOINT_FINALIZER) {
            finalizers.push(ENDPOINT_FINALIZER.to_string());
        }
        Ok(())
    }

    async fn reallocate_current_ip_allocation(
        &self,
        _token: &CancellationToken,
        container_id: &str,
        uid: &str,
        node_name: &str,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError> {
        self.reallocate_calls.fetch_add(1, Ordering::SeqCst);
        let mut endpoints = self.endpoints.lock().unwrap();
        let stored = endpoints.get_mut(&key(endpoint)).ok_or_else(|| not_found(endpoint))?;
        let current = stored
            .status
            .as_mut()
            .and_then(|s| s.current.as_mut())
            .ok_or_else(|| ManagerError::Api("SpiderEndpoint has no current allocation".to_string()))?;
        current.container_id = container_id.to_string();
        current.uid = uid.to_string();
        current.node = node_name.to_string();
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        _token: &CancellationToken,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError> {
        let mut endpoints = self.endpoints.lock().unwrap();
        let stored = endpoints.get_mut(&key(endpoint)).ok_or_else(|| not_found(endpoint))?;
        if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != ENDPOINT_FINALIZER);
        }
        Ok(())
    }

    async fn delete_endpoint(
        &self,
        _token: &CancellationToken,
        endpoint: &SpiderEndpoint,
    ) -> Result<(), ManagerError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.endpoints
            .lock()
            .unwrap()
            .remove(&key(endpoint))
            .map(|_| ())
            .ok_or_else(|| not_found(endpoint))
    }
}
