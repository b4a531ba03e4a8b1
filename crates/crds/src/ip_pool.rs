//! SpiderIPPool CRD
//!
//! Defines a cluster-scoped pool of pod IP addresses together with the
//! affinities that decide which pods may draw from it.

use crate::selector::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "spiderpool.spidernet.io",
    version = "v2beta1",
    kind = "SpiderIPPool",
    shortname = "sp",
    status = "SpiderIPPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SpiderIPPoolSpec {
    /// IP version of every address in the pool (4 or 6)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_version: Option<i64>,

    /// Subnet CIDR the pool addresses belong to (e.g., "10.6.0.0/16")
    pub subnet: String,

    /// Addresses or address ranges ("10.6.0.10-10.6.0.20") handed out by the pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,

    /// Addresses never handed out
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "excludeIPs")]
    pub exclude_ips: Vec<String>,

    /// Gateway injected as the default route of the NIC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// VLAN ID (0 means untagged)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<i64>,

    /// Static routes attached to every address of the pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,

    /// Pods allowed to use the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_affinity: Option<LabelSelector>,

    /// Namespaces allowed to use the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_affinity: Option<LabelSelector>,

    /// Namespaces allowed to use the pool, by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_name: Vec<String>,

    /// Nodes allowed to use the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<LabelSelector>,

    /// Nodes allowed to use the pool, by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_name: Vec<String>,

    /// A disabled pool keeps its allocations but hands out no new address
    #[serde(default)]
    pub disable: bool,

    /// Marks the pool as a cluster default pool
    #[serde(default)]
    pub default: bool,
}

/// Static route
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,

    /// Next hop
    pub gw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpiderIPPoolStatus {
    /// Allocated addresses, JSON encoded map of IP to owner
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "allocatedIPs")]
    pub allocated_ips: Option<String>,

    /// Number of addresses the pool can hand out
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "totalIPCount")]
    pub total_ip_count: Option<i64>,

    /// Number of addresses currently allocated
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "allocatedIPCount")]
    pub allocated_ip_count: Option<i64>,
}

impl SpiderIPPool {
    /// Pool name, empty when the object carries no name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// VLAN of the pool, 0 when untagged
    pub fn vlan(&self) -> i64 {
        self.spec.vlan.unwrap_or_default()
    }

    /// Whether the pool is being deleted
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Number of addresses reported by the pool controller
    pub fn total_ip_count(&self) -> i64 {
        self.status
            .as_ref()
            .and_then(|s| s.total_ip_count)
            .unwrap_or_default()
    }
}
