//! SpiderEndpoint CRD
//!
//! The durable ownership ledger: which container of a pod holds which
//! addresses right now, plus the allocations it held before.

use crate::ip_pool::Route;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer keeping an endpoint alive until its addresses are released
pub const ENDPOINT_FINALIZER: &str = "spiderpool.spidernet.io";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v2beta1",
    kind = "SpiderEndpoint",
    namespaced,
    shortname = "se",
    status = "SpiderEndpointStatus"
)]
pub struct SpiderEndpointSpec {}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpiderEndpointStatus {
    /// Allocation of the running container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<PodIPAllocation>,

    /// Previous allocations, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PodIPAllocation>,

    /// Kind of the pod's top controller (e.g., "StatefulSet")
    #[serde(default)]
    pub owner_controller_type: String,

    /// Name of the pod's top controller
    #[serde(default)]
    pub owner_controller_name: String,
}

/// Addresses held by one pod incarnation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodIPAllocation {
    /// Container ID the allocation was made for
    #[serde(rename = "containerID")]
    pub container_id: String,

    /// Pod UID the allocation was made for
    pub uid: String,

    /// Node the pod ran on
    #[serde(default)]
    pub node: String,

    /// Per-NIC details
    #[serde(default)]
    pub ips: Vec<IPAllocationDetail>,

    /// Creation time of the allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Addresses of one NIC
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPAllocationDetail {
    /// Interface name
    pub nic: String,

    /// IPv4 address in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    /// IPv6 address in CIDR notation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    /// Pool the IPv4 address came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_pool: Option<String>,

    /// Pool the IPv6 address came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_pool: Option<String>,

    /// IPv4 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<String>,

    /// IPv6 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<String>,

    /// VLAN ID
    #[serde(default)]
    pub vlan: i64,

    /// Suppress default route injection for this NIC
    #[serde(default)]
    pub clean_gateway: bool,

    /// Routes attached to the NIC
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl SpiderEndpoint {
    /// Current allocation, if any
    pub fn current(&self) -> Option<&PodIPAllocation> {
        self.status.as_ref().and_then(|s| s.current.as_ref())
    }

    /// Historical allocations
    pub fn history(&self) -> &[PodIPAllocation] {
        self.status.as_ref().map(|s| s.history.as_slice()).unwrap_or_default()
    }

    /// Kind of the owning controller, empty when unknown
    pub fn owner_controller_type(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.owner_controller_type.as_str())
            .unwrap_or_default()
    }

    /// Name of the owning controller, empty when unknown
    pub fn owner_controller_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.owner_controller_name.as_str())
            .unwrap_or_default()
    }
}
