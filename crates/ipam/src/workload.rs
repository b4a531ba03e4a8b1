//! Workload identity helpers: top controllers and pod lifecycle.

use crds::LabelSelector;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;

/// Kind of a pod's top controller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 ReplicaSet without Deployment
    ReplicaSet,
    /// apps/v1 StatefulSet
    StatefulSet,
    /// apps/v1 DaemonSet
    DaemonSet,
    /// batch/v1 Job without CronJob
    Job,
    /// batch/v1 CronJob
    CronJob,
    /// Orphan pod
    Pod,
    /// Third-party controller
    Unknown(String),
}

impl ControllerKind {
    /// Maps an owner reference kind to a controller kind.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Deployment" => ControllerKind::Deployment,
            "ReplicaSet" => ControllerKind::ReplicaSet,
            "StatefulSet" => ControllerKind::StatefulSet,
            "DaemonSet" => ControllerKind::DaemonSet,
            "Job" => ControllerKind::Job,
            "CronJob" => ControllerKind::CronJob,
            "Pod" => ControllerKind::Pod,
            other => ControllerKind::Unknown(other.to_string()),
        }
    }

    /// Kind as written in owner references
    pub fn as_str(&self) -> &str {
        match self {
            ControllerKind::Deployment => "Deployment",
            ControllerKind::ReplicaSet => "ReplicaSet",
            ControllerKind::StatefulSet => "StatefulSet",
            ControllerKind::DaemonSet => "DaemonSet",
            ControllerKind::Job => "Job",
            ControllerKind::CronJob => "CronJob",
            ControllerKind::Pod => "Pod",
            ControllerKind::Unknown(kind) => kind,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The controller at the top of a pod's owner chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTopController {
    /// Controller kind
    pub kind: ControllerKind,
    /// Controller namespace
    pub namespace: String,
    /// Controller name
    pub name: String,
    /// Controller UID
    pub uid: String,
    /// Desired replicas, when the kind has such a notion
    pub replicas: Option<i32>,
    /// Pod selector of the controller
    pub selector: Option<LabelSelector>,
}

impl PodTopController {
    /// An orphan pod is its own controller.
    pub fn orphan(pod: &Pod) -> Self {
        Self {
            kind: ControllerKind::Pod,
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            replicas: Some(1),
            selector: pod.metadata.labels.clone().map(LabelSelector::from_labels),
        }
    }
}

/// Lifecycle state of a pod as far as IPAM is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodLifecycle {
    /// Pending or running, may receive addresses
    Allocatable,
    /// Deletion timestamp set
    Terminating,
    /// Phase Succeeded
    Succeeded,
    /// Phase Failed
    Failed,
    /// Evicted by the kubelet
    Evicted,
}

impl PodLifecycle {
    /// Whether the pod may receive addresses
    pub fn is_allocatable(self) -> bool {
        self == PodLifecycle::Allocatable
    }
}

impl fmt::Display for PodLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PodLifecycle::Allocatable => "allocatable",
            PodLifecycle::Terminating => "terminating",
            PodLifecycle::Succeeded => "succeeded",
            PodLifecycle::Failed => "failed",
            PodLifecycle::Evicted => "evicted",
        })
    }
}

fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

/// Classifies the pod's lifecycle state.
pub fn pod_lifecycle(pod: &Pod) -> PodLifecycle {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodLifecycle::Terminating;
    }
    let reason = pod.status.as_ref().and_then(|s| s.reason.as_deref());
    match phase(pod) {
        "Succeeded" => PodLifecycle::Succeeded,
        "Failed" if reason == Some("Evicted") => PodLifecycle::Evicted,
        "Failed" => PodLifecycle::Failed,
        _ => PodLifecycle::Allocatable,
    }
}

/// Whether the pod is running and not being deleted.
pub fn is_pod_running(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none() && phase(pod) == "Running"
}

/// "namespace/name" of a pod, for logs and errors
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Ordinal of a StatefulSet pod named "<statefulset>-<ordinal>".
pub fn statefulset_ordinal(pod_name: &str, statefulset: &str) -> Option<i32> {
    pod_name
        .strip_prefix(statefulset)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with(phase: &str, reason: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                reason: reason.map(str::to_string),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_lifecycle() {
        assert_eq!(pod_lifecycle(&pod_with("Pending", None)), PodLifecycle::Allocatable);
        assert_eq!(pod_lifecycle(&pod_with("Running", None)), PodLifecycle::Allocatable);
        assert_eq!(pod_lifecycle(&pod_with("Succeeded", None)), PodLifecycle::Succeeded);
        assert_eq!(pod_lifecycle(&pod_with("Failed", None)), PodLifecycle::Failed);
        assert_eq!(pod_lifecycle(&pod_with("Failed", Some("Evicted"))), PodLifecycle::Evicted);

        let deleting: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "deletionTimestamp": "2025-01-01T00:00:00Z"
            },
            "status": { "phase": "Running" }
        }))
        .unwrap();
        assert_eq!(pod_lifecycle(&deleting), PodLifecycle::Terminating);
        assert!(!is_pod_running(&deleting));
    }

    #[test]
    fn test_statefulset_ordinal() {
        assert_eq!(statefulset_ordinal("web-0", "web"), Some(0));
        assert_eq!(statefulset_ordinal("web-12", "web"), Some(12));
        assert_eq!(statefulset_ordinal("web-a", "web"), None);
        assert_eq!(statefulset_ordinal("webby-1", "web"), None);
    }

    #[test]
    fn test_controller_kind_round_trips_owner_kinds() {
        assert_eq!(ControllerKind::from_kind("StatefulSet"), ControllerKind::StatefulSet);
        assert_eq!(
            ControllerKind::from_kind("VirtualMachineInstance").as_str(),
            "VirtualMachineInstance"
        );
    }
}
