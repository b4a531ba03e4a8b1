//! Data model of the allocation engine.
//!
//! Everything here lives for a single allocation or release call; the only
//! durable state is the endpoint record owned by the endpoint manager.

use crds::{Route, SpiderIPPool};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// IP family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpVersion {
    /// IPv4
    #[serde(rename = "4")]
    V4,
    /// IPv6
    #[serde(rename = "6")]
    V6,
}

impl IpVersion {
    /// Numeric version as stored in pool specs
    pub fn as_i64(self) -> i64 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }

    /// Parses the numeric version stored in pool specs
    pub fn from_i64(version: i64) -> Option<Self> {
        match version {
            4 => Some(IpVersion::V4),
            6 => Some(IpVersion::V6),
            _ => None,
        }
    }

    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Value of the auto-pool version label
    pub fn label_value(self) -> &'static str {
        match self {
            IpVersion::V4 => crds::labels::IPV4_LABEL_VALUE,
            IpVersion::V6 => crds::labels::IPV6_LABEL_VALUE,
        }
    }

    /// Default route destination of the family
    pub fn default_route_dst(self) -> &'static str {
        match self {
            IpVersion::V4 => "0.0.0.0/0",
            IpVersion::V6 => "::/0",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

/// One address handed out by a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IPConfig {
    /// Address in CIDR notation, e.g. "10.6.0.5/16"
    pub address: String,
    /// Gateway of the pool, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Pool the address came from
    #[serde(rename = "ipPool")]
    pub ip_pool: String,
    /// Interface the address is for
    pub nic: String,
    /// IP family
    pub version: IpVersion,
    /// VLAN of the pool
    #[serde(default)]
    pub vlan: i64,
}

impl IPConfig {
    /// Address without its prefix length
    pub fn ip(&self) -> &str {
        self.address.split('/').next().unwrap_or_default()
    }
}

/// Final outcome for one (NIC, address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationResult {
    /// Drawn address
    pub ip: IPConfig,
    /// Routes attached to the NIC through this address
    pub routes: Vec<Route>,
    /// Suppress default route injection
    pub clean_gateway: bool,
}

/// One IP family's ordered pool list for a NIC
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    /// Family every pool of the candidate must serve
    pub ip_version: IpVersion,
    /// Pools to try, in order
    pub pools: Vec<String>,
    /// Fetched pool objects, filled once per allocation call
    pub pool_objects: HashMap<String, Arc<SpiderIPPool>>,
}

impl PoolCandidate {
    /// Candidate whose pool objects are not fetched yet
    pub fn new(ip_version: IpVersion, pools: Vec<String>) -> Self {
        Self {
            ip_version,
            pools,
            pool_objects: HashMap::new(),
        }
    }
}

/// Allocation intent of one interface
#[derive(Debug, Clone)]
pub struct ToBeAllocated {
    /// Interface name
    pub nic: String,
    /// Suppress default route injection
    pub clean_gateway: bool,
    /// One candidate per IP family
    pub pool_candidates: Vec<PoolCandidate>,
}

impl ToBeAllocated {
    /// Builds the intent from per-family pool lists, skipping empty families.
    pub fn from_pools(nic: &str, clean_gateway: bool, ipv4: Vec<String>, ipv6: Vec<String>) -> Self {
        let mut pool_candidates = Vec::new();
        if !ipv4.is_empty() {
            pool_candidates.push(PoolCandidate::new(IpVersion::V4, ipv4));
        }
        if !ipv6.is_empty() {
            pool_candidates.push(PoolCandidate::new(IpVersion::V6, ipv6));
        }
        Self {
            nic: nic.to_string(),
            clean_gateway,
            pool_candidates,
        }
    }

    /// Every pool name referenced by the intent, duplicates included
    pub fn pool_names(&self) -> impl Iterator<Item = &str> {
        self.pool_candidates
            .iter()
            .flat_map(|c| c.pools.iter().map(String::as_str))
    }
}

/// Address together with the pod UID that owns it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpAndUid {
    /// Bare address, without prefix length
    pub ip: String,
    /// Owner pod UID
    pub uid: String,
}

/// Address to give back to an explicit pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedIp {
    /// Owning pool
    pub pool: String,
    /// Bare address
    pub ip: String,
    /// Owner pod UID
    pub uid: String,
}

/// Arguments of a CNI ADD call
#[derive(Debug, Clone, Default)]
pub struct AddArgs {
    /// Container ID
    pub container_id: String,
    /// Interface name the CNI call is for
    pub if_name: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Pod UID as seen by the kubelet
    pub pod_uid: String,
    /// IPv4 pools from the CNI network configuration
    pub default_ipv4_ippool: Vec<String>,
    /// IPv6 pools from the CNI network configuration
    pub default_ipv6_ippool: Vec<String>,
    /// Clean gateway flag from the CNI network configuration
    pub clean_gateway: bool,
}

/// Arguments of a CNI DEL call
#[derive(Debug, Clone, Default)]
pub struct DelArgs {
    /// Container ID
    pub container_id: String,
    /// Interface name the CNI call is for
    pub if_name: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Pod UID as seen by the kubelet
    pub pod_uid: String,
    /// Also match historical allocations of the endpoint
    pub release_history: bool,
}

/// Route handed back to the CNI plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRoute {
    /// Interface the route belongs to
    pub if_name: String,
    /// Destination CIDR
    pub dst: String,
    /// Next hop
    pub gw: String,
}

/// Answer to a CNI ADD call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddResponse {
    /// Addresses, one per (NIC, family)
    pub ips: Vec<IPConfig>,
    /// Routes, grouped per NIC
    pub routes: Vec<ResponseRoute>,
}
