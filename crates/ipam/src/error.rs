//! IPAM error types.
//!
//! `ManagerError` is what collaborators (pool, endpoint, subnet managers and
//! cluster lookups) report. `IpamError` is what the engine reports to its
//! caller, classified the way the CNI shim needs to act on it.

use crate::types::IpVersion;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors reported by the collaborators of the engine.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict that outlived the manager's retries
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Pool has no free address left
    #[error("IP pool exhausted: {0}")]
    Exhausted(String),

    /// Any other API failure
    #[error("API error: {0}")]
    Api(String),

    /// Caller canceled the call before it completed
    #[error("Canceled: {0}")]
    Canceled(String),
}

impl ManagerError {
    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ManagerError::NotFound(_) => true,
            ManagerError::Kube(KubeError::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}

/// Errors that can occur while allocating or releasing addresses.
#[derive(Debug, Error)]
pub enum IpamError {
    /// No pool candidate survived resolution and filtering
    #[error("no available IP pool: {0}")]
    NoAvailablePool(String),

    /// Malformed or contradictory input (annotations, pool config)
    #[error("wrong input: {0}")]
    WrongInput(String),

    /// Pod is in a lifecycle state that must not receive addresses
    #[error("pod {pod} is not allocatable: pod is {status}")]
    NotAllocatablePod {
        /// namespace/name of the pod
        pod: String,
        /// Observed lifecycle state
        status: String,
    },

    /// Every pool of one candidate failed to hand out an address
    #[error("failed to allocate {version} IP to {nic} from IP pools {pools:?}: {}", join_failures(.failures))]
    PoolsExhausted {
        /// Interface being served
        nic: String,
        /// IP family being served
        version: IpVersion,
        /// Pools tried, in order
        pools: Vec<String>,
        /// Failure of each pool, in order
        failures: Vec<(String, ManagerError)>,
    },

    /// Durable record is structurally invalid
    #[error("data broken: {0}")]
    DataBroken(String),

    /// Subnet auto-pool did not become ready in time
    #[error("auto-created IP pool not ready: {0}")]
    AutoPoolNotReady(String),

    /// Caller canceled the operation
    #[error("operation canceled: {0}")]
    Canceled(String),

    /// Admission limiter refused or timed out the request
    #[error("admission limiter: {0}")]
    Admission(String),

    /// Collaborator failure
    #[error(transparent)]
    Manager(ManagerError),

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    TaskFailed(String),

    /// Aggregate of every failure of a fan-out
    #[error("{}", join_errors(.0))]
    Multiple(Vec<IpamError>),
}

impl IpamError {
    /// Builds a single error out of a fan-out's failures.
    ///
    /// Returns `None` when there is nothing to report and unwraps a
    /// single-element list.
    pub fn aggregate(mut errors: Vec<IpamError>) -> Option<IpamError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(IpamError::Multiple(errors)),
        }
    }

    /// Whether this error, or any error aggregated into it, satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&IpamError) -> bool) -> bool {
        match self {
            IpamError::Multiple(errors) => errors.iter().any(|e| e.any(pred)),
            other => pred(other),
        }
    }
}

impl From<ManagerError> for IpamError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::Canceled(what) => IpamError::Canceled(what),
            other => IpamError::Manager(other),
        }
    }
}

fn join_errors(errors: &[IpamError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_failures(failures: &[(String, ManagerError)]) -> String {
    failures
        .iter()
        .map(|(pool, e)| format!("{pool}: {e}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_unwraps_single_error() {
        let err = IpamError::aggregate(vec![IpamError::WrongInput("bad".to_string())]);
        assert!(matches!(err, Some(IpamError::WrongInput(_))));
        assert!(IpamError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_any_walks_nested_aggregates() {
        let err = IpamError::Multiple(vec![
            IpamError::Canceled("ctx".to_string()),
            IpamError::Multiple(vec![IpamError::DataBroken("no current".to_string())]),
        ]);
        assert!(err.any(&|e| matches!(e, IpamError::DataBroken(_))));
        assert!(!err.any(&|e| matches!(e, IpamError::WrongInput(_))));
    }

    #[test]
    fn test_canceled_collaborator_call_maps_to_canceled() {
        let err = IpamError::from(ManagerError::Canceled("get Pod default/web".to_string()));
        assert!(matches!(err, IpamError::Canceled(_)));
        let err = IpamError::from(ManagerError::NotFound("Pod default/web".to_string()));
        assert!(matches!(err, IpamError::Manager(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_pools_exhausted_message_lists_every_pool() {
        let err = IpamError::PoolsExhausted {
            nic: "eth0".to_string(),
            version: IpVersion::V4,
            pools: vec!["a".to_string(), "b".to_string()],
            failures: vec![
                ("a".to_string(), ManagerError::Exhausted("a".to_string())),
                ("b".to_string(), ManagerError::NotFound("b".to_string())),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("IPv4"));
        assert!(msg.contains("a: IP pool exhausted"));
        assert!(msg.contains("b: Not found"));
    }
}
