//! Kubernetes-backed cluster lookups.
//!
//! Implements the read-only collaborators (pods, namespaces, nodes,
//! StatefulSets) on top of `kube::Api`. Pool and endpoint ledgers are owned
//! by their controllers and are not implemented here. Every API request is
//! abandoned as soon as the caller's token is canceled.

use crate::error::ManagerError;
use crate::manager::{cancelable, NamespaceManager, NodeManager, PodManager, StatefulSetManager};
use crate::workload::{statefulset_ordinal, ControllerKind, PodTopController};
use crds::LabelSelector;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cluster lookups through the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterLookup {
    client: Client,
}

impl std::fmt::Debug for KubeClusterLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterLookup").finish_non_exhaustive()
    }
}

impl KubeClusterLookup {
    /// Creates a lookup using `client`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Creates a lookup from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> Result<Self, ManagerError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn get_namespaced<K>(&self, token: &CancellationToken, namespace: &str, name: &str) -> Result<K, ManagerError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("{} {}/{}", K::kind(&K::DynamicType::default()), namespace, name);
        match cancelable(token, &format!("get {}", what), api.get_opt(name)).await? {
            Some(object) => Ok(object),
            None => Err(ManagerError::NotFound(what)),
        }
    }

    fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
        meta.owner_references
            .as_ref()?
            .iter()
            .find(|owner| owner.controller == Some(true))
    }

    async fn top_controller_of(
        &self,
        token: &CancellationToken,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Result<PodTopController, ManagerError> {
        let base = |kind: ControllerKind, meta: &ObjectMeta| PodTopController {
            kind,
            namespace: namespace.to_string(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            replicas: None,
            selector: None,
        };

        match ControllerKind::from_kind(&owner.kind) {
            ControllerKind::ReplicaSet => {
                let replica_set: ReplicaSet = self.get_namespaced(token, namespace, &owner.name).await?;
                if let Some(parent) = Self::controller_of(&replica_set.metadata)
                    && parent.kind == "Deployment"
                {
                    let deployment: Deployment = self.get_namespaced(token, namespace, &parent.name).await?;
                    let spec = deployment.spec.clone().unwrap_or_default();
                    return Ok(PodTopController {
                        replicas: Some(spec.replicas.unwrap_or(1)),
                        selector: Some(LabelSelector::from(spec.selector)),
                        ..base(ControllerKind::Deployment, &deployment.metadata)
                    });
                }
                let spec = replica_set.spec.clone().unwrap_or_default();
                Ok(PodTopController {
                    replicas: Some(spec.replicas.unwrap_or(1)),
                    selector: Some(LabelSelector::from(spec.selector)),
                    ..base(ControllerKind::ReplicaSet, &replica_set.metadata)
                })
            }
            ControllerKind::StatefulSet => {
                let statefulset: StatefulSet = self.get_namespaced(token, namespace, &owner.name).await?;
                let spec = statefulset.spec.clone().unwrap_or_default();
                Ok(PodTopController {
                    replicas: Some(spec.replicas.unwrap_or(1)),
                    selector: Some(LabelSelector::from(spec.selector)),
                    ..base(ControllerKind::StatefulSet, &statefulset.metadata)
                })
            }
            ControllerKind::DaemonSet => {
                let daemonset: DaemonSet = self.get_namespaced(token, namespace, &owner.name).await?;
                let selector = daemonset.spec.as_ref().map(|s| LabelSelector::from(s.selector.clone()));
                let desired = daemonset
                    .status
                    .as_ref()
                    .map(|s| s.desired_number_scheduled)
                    .unwrap_or_default();
                Ok(PodTopController {
                    replicas: Some(desired),
                    selector,
                    ..base(ControllerKind::DaemonSet, &daemonset.metadata)
                })
            }
            ControllerKind::Job => {
                let job: Job = self.get_namespaced(token, namespace, &owner.name).await?;
                if let Some(parent) = Self::controller_of(&job.metadata)
                    && parent.kind == "CronJob"
                {
                    let cronjob: CronJob = self.get_namespaced(token, namespace, &parent.name).await?;
                    let template = cronjob
                        .spec
                        .as_ref()
                        .and_then(|s| s.job_template.spec.clone())
                        .unwrap_or_default();
                    return Ok(PodTopController {
                        replicas: Some(template.parallelism.unwrap_or(1)),
                        selector: template.selector.map(LabelSelector::from),
                        ..base(ControllerKind::CronJob, &cronjob.metadata)
                    });
                }
                let spec = job.spec.clone().unwrap_or_default();
                Ok(PodTopController {
                    replicas: Some(spec.parallelism.unwrap_or(1)),
                    selector: spec.selector.map(LabelSelector::from),
                    ..base(ControllerKind::Job, &job.metadata)
                })
            }
            kind => {
                debug!("Pod owner {} {}/{} is not a known controller", owner.kind, namespace, owner.name);
                Ok(PodTopController {
                    kind,
                    namespace: namespace.to_string(),
                    name: owner.name.clone(),
                    uid: owner.uid.clone(),
                    replicas: None,
                    selector: None,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl PodManager for KubeClusterLookup {
    async fn get_pod_by_name(
        &self,
        token: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<Pod, ManagerError> {
        self.get_namespaced(token, namespace, name).await
    }

    async fn get_pod_top_controller(
        &self,
        token: &CancellationToken,
        pod: &Pod,
    ) -> Result<PodTopController, ManagerError> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        match Self::controller_of(&pod.metadata) {
            Some(owner) => self.top_controller_of(token, namespace, owner).await,
            None => Ok(PodTopController::orphan(pod)),
        }
    }
}

#[async_trait::async_trait]
impl NamespaceManager for KubeClusterLookup {
    async fn get_namespace_by_name(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Namespace, ManagerError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        cancelable(token, &format!("get Namespace {}", name), api.get_opt(name))
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("Namespace {}", name)))
    }
}

#[async_trait::async_trait]
impl NodeManager for KubeClusterLookup {
    async fn get_node_by_name(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Node, ManagerError> {
        let api: Api<Node> = Api::all(self.client.clone());
        cancelable(token, &format!("get Node {}", name), api.get_opt(name))
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("Node {}", name)))
    }
}

#[async_trait::async_trait]
impl StatefulSetManager for KubeClusterLookup {
    async fn is_valid_statefulset_pod(
        &self,
        token: &CancellationToken,
        namespace: &str,
        pod_name: &str,
        statefulset: &str,
    ) -> Result<bool, ManagerError> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let what = format!("get StatefulSet {}/{}", namespace, statefulset);
        let Some(object) = cancelable(token, &what, api.get_opt(statefulset)).await? else {
            debug!("StatefulSet {}/{} is gone", namespace, statefulset);
            return Ok(false);
        };
        if object.metadata.deletion_timestamp.is_some() {
            return Ok(false);
        }
        let Some(ordinal) = statefulset_ordinal(pod_name, statefulset) else {
            return Ok(false);
        };
        let spec = object.spec.unwrap_or_default();
        Ok(is_valid_ordinal(
            ordinal,
            spec.ordinals.and_then(|o| o.start).unwrap_or(0),
            spec.replicas.unwrap_or(1),
        ))
    }
}

fn is_valid_ordinal(ordinal: i32, start: i32, replicas: i32) -> bool {
    ordinal >= start && ordinal < start.saturating_add(replicas)
}
