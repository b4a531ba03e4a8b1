//! Mock cluster lookups

use crate::error::ManagerError;
use crate::manager::{NamespaceManager, NodeManager, PodManager, StatefulSetManager};
use crate::workload::PodTopController;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Mock pod, namespace, node and StatefulSet lookups
///
/// Pods without a registered controller are orphans. Namespaces and nodes
/// that were never added exist with no labels or annotations.
#[derive(Debug, Clone, Default)]
pub struct MockClusterLookup {
    pods: Arc<Mutex<HashMap<(String, String), Pod>>>,
    controllers: Arc<Mutex<HashMap<(String, String), PodTopController>>>,
    namespace_labels: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
    namespace_annotations: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
    node_labels: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
    // (namespace, pod name) -> still a wanted replica
    statefulset_pods: Arc<Mutex<HashMap<(String, String), bool>>>,
}

fn pod_key(pod: &Pod) -> (String, String) {
    (
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

impl MockClusterLookup {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a pod (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod_key(&pod), pod);
    }

    /// Add or replace a pod owned by `controller` (for test setup)
    pub fn add_pod_with_controller(&self, pod: Pod, controller: PodTopController) {
        self.controllers.lock().unwrap().insert(pod_key(&pod), controller);
        self.add_pod(pod);
    }

    /// Delete a pod
    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Set the labels of a namespace (for test setup)
    pub fn add_namespace(&self, name: &str, labels: &[(&str, &str)]) {
        self.namespace_labels.lock().unwrap().insert(name.to_string(), to_map(labels));
    }

    /// Add an annotation to a namespace (for test setup)
    pub fn annotate_namespace(&self, name: &str, key: &str, value: &str) {
        self.namespace_annotations
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Set the labels of a node (for test setup)
    pub fn add_node(&self, name: &str, labels: &[(&str, &str)]) {
        self.node_labels.lock().unwrap().insert(name.to_string(), to_map(labels));
    }

    /// Mark whether `namespace/pod_name` is still a wanted StatefulSet replica
    pub fn set_statefulset_pod_valid(&self, namespace: &str, pod_name: &str, valid: bool) {
        self.statefulset_pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), pod_name.to_string()), valid);
    }
}

fn to_map(labels: &[(&str, &str)]) -> BTreeMap<String, String> {
    labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn meta(name: &str, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels,
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl PodManager for MockClusterLookup {
    async fn get_pod_by_name(
        &self,
        _token: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<Pod, ManagerError> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("Pod {}/{}", namespace, name)))
    }

    async fn get_pod_top_controller(
        &self,
        _token: &CancellationToken,
        pod: &Pod,
    ) -> Result<PodTopController, ManagerError> {
        Ok(self
            .controllers
            .lock()
            .unwrap()
            .get(&pod_key(pod))
            .cloned()
            .unwrap_or_else(|| PodTopController::orphan(pod)))
    }
}

#[async_trait::async_trait]
impl NamespaceManager for MockClusterLookup {
    async fn get_namespace_by_name(
        &self,
        _token: &CancellationToken,
        name: &str,
    ) -> Result<Namespace, ManagerError> {
        let labels = self.namespace_labels.lock().unwrap().get(name).cloned();
        let mut metadata = meta(name, labels);
        metadata.annotations = self.namespace_annotations.lock().unwrap().get(name).cloned();
        Ok(Namespace {
            metadata,
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl NodeManager for MockClusterLookup {
    async fn get_node_by_name(
        &self,
        _token: &CancellationToken,
        name: &str,
    ) -> Result<Node, ManagerError> {
        let labels = self.node_labels.lock().unwrap().get(name).cloned();
        Ok(Node {
            metadata: meta(name, labels),
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl StatefulSetManager for MockClusterLookup {
    async fn is_valid_statefulset_pod(
        &self,
        _token: &CancellationToken,
        namespace: &str,
        pod_name: &str,
        _statefulset: &str,
    ) -> Result<bool, ManagerError> {
        Ok(self
            .statefulset_pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), pod_name.to_string()))
            .copied()
            .unwrap_or(false))
    }
}
