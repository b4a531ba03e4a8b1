//! Pod and namespace annotations steering pool selection.
//!
//! All parsing happens before any address is drawn so malformed input never
//! consumes addresses.

use crate::cidr::Cidr;
use crate::error::IpamError;
use crate::types::IpVersion;
use crds::Route;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

/// Pod: single-NIC explicit pools
pub const ANNO_POD_IPPOOL: &str = "ipam.spidernet.io/ippool";
/// Pod: multi-NIC explicit pools
pub const ANNO_POD_IPPOOLS: &str = "ipam.spidernet.io/ippools";
/// Pod: single-NIC subnet auto-pool
pub const ANNO_SPIDER_SUBNET: &str = "ipam.spidernet.io/subnet";
/// Pod: multi-NIC subnet auto-pools
pub const ANNO_SPIDER_SUBNETS: &str = "ipam.spidernet.io/subnets";
/// Pod: auto-pool size, "N" or "+N"
pub const ANNO_SPIDER_SUBNET_POOL_IP_NUMBER: &str = "ipam.spidernet.io/ippool-ip-number";
/// Pod: reclaim the auto-pool with its workload
pub const ANNO_SPIDER_SUBNET_RECLAIM_IPPOOL: &str = "ipam.spidernet.io/ippool-reclaim";
/// Pod: custom routes
pub const ANNO_POD_ROUTES: &str = "ipam.spidernet.io/routes";
/// Namespace: default IPv4 pools
pub const ANNO_NS_DEFAULT_V4_POOL: &str = "ipam.spidernet.io/default-ipv4-ippool";
/// Namespace: default IPv6 pools
pub const ANNO_NS_DEFAULT_V6_POOL: &str = "ipam.spidernet.io/default-ipv6-ippool";

/// Pools of one NIC as written in an annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PoolsItem {
    /// Interface name
    #[serde(default)]
    pub interface: String,
    /// IPv4 pool names
    #[serde(default)]
    pub ipv4: Vec<String>,
    /// IPv6 pool names
    #[serde(default)]
    pub ipv6: Vec<String>,
    /// Suppress default route injection
    #[serde(default, rename = "cleangateway")]
    pub clean_gateway: bool,
}

/// Subnets of one NIC as written in an annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubnetItem {
    /// Interface name
    #[serde(default)]
    pub interface: String,
    /// IPv4 subnet names, only the first is used
    #[serde(default)]
    pub ipv4: Vec<String>,
    /// IPv6 subnet names, only the first is used
    #[serde(default)]
    pub ipv6: Vec<String>,
    /// Suppress default route injection
    #[serde(default, rename = "cleangateway")]
    pub clean_gateway: bool,
}

impl SubnetItem {
    /// Subnet serving `version`, if any
    pub fn subnet(&self, version: IpVersion) -> Option<&str> {
        match version {
            IpVersion::V4 => self.ipv4.first(),
            IpVersion::V6 => self.ipv6.first(),
        }
        .map(String::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MultiPoolsAnnotation {
    List(Vec<PoolsItem>),
    ByInterface(BTreeMap<String, PoolsItem>),
}

/// Requested auto-pool size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolIpNumber {
    /// Exactly this many addresses
    Fixed(usize),
    /// Replica count plus this many addresses
    Flexible(usize),
}

/// Parses the single-NIC pool annotation for `nic`.
pub fn parse_ippool(value: &str, nic: &str) -> Result<PoolsItem, IpamError> {
    let mut item: PoolsItem = serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {ANNO_POD_IPPOOL}: {e}")))?;
    if item.interface.is_empty() {
        item.interface = nic.to_string();
    } else if item.interface != nic {
        return Err(IpamError::WrongInput(format!(
            "interface {} in annotation {ANNO_POD_IPPOOL} does not match CNI interface {nic}",
            item.interface
        )));
    }
    Ok(item)
}

/// Parses the multi-NIC pool annotation.
///
/// Accepts either a list of items carrying `interface`, or an object keyed
/// by interface name. Every interface must appear once and `nic` must be one
/// of them.
pub fn parse_ippools(value: &str, nic: &str) -> Result<Vec<PoolsItem>, IpamError> {
    let parsed: MultiPoolsAnnotation = serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {ANNO_POD_IPPOOLS}: {e}")))?;
    let items: Vec<PoolsItem> = match parsed {
        MultiPoolsAnnotation::List(items) => items,
        MultiPoolsAnnotation::ByInterface(map) => map
            .into_iter()
            .map(|(interface, item)| PoolsItem { interface, ..item })
            .collect(),
    };
    check_interfaces(items.iter().map(|i| i.interface.as_str()), ANNO_POD_IPPOOLS, nic)?;
    Ok(items)
}

/// Parses the single-NIC subnet annotation for `nic`.
pub fn parse_subnet(value: &str, nic: &str) -> Result<SubnetItem, IpamError> {
    let mut item: SubnetItem = serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {ANNO_SPIDER_SUBNET}: {e}")))?;
    if item.interface.is_empty() {
        item.interface = nic.to_string();
    } else if item.interface != nic {
        return Err(IpamError::WrongInput(format!(
            "interface {} in annotation {ANNO_SPIDER_SUBNET} does not match CNI interface {nic}",
            item.interface
        )));
    }
    Ok(item)
}

/// Parses the multi-NIC subnet annotation.
pub fn parse_subnets(value: &str, nic: &str) -> Result<Vec<SubnetItem>, IpamError> {
    let items: Vec<SubnetItem> = serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {ANNO_SPIDER_SUBNETS}: {e}")))?;
    check_interfaces(items.iter().map(|i| i.interface.as_str()), ANNO_SPIDER_SUBNETS, nic)?;
    Ok(items)
}

fn check_interfaces<'a>(
    interfaces: impl Iterator<Item = &'a str>,
    annotation: &str,
    nic: &str,
) -> Result<(), IpamError> {
    let mut seen = HashSet::new();
    for interface in interfaces {
        if interface.is_empty() {
            return Err(IpamError::WrongInput(format!(
                "annotation {annotation} has an item without interface"
            )));
        }
        if !seen.insert(interface) {
            return Err(IpamError::WrongInput(format!(
                "annotation {annotation} names interface {interface} more than once"
            )));
        }
    }
    if !seen.contains(nic) {
        return Err(IpamError::WrongInput(format!(
            "annotation {annotation} does not configure CNI interface {nic}"
        )));
    }
    Ok(())
}

/// Parses a namespace default pool annotation (JSON list of names).
pub fn parse_pool_list(value: &str, annotation: &str) -> Result<Vec<String>, IpamError> {
    serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {annotation}: {e}")))
}

/// Parses the auto-pool size annotation.
pub fn parse_ip_number(value: &str) -> Result<PoolIpNumber, IpamError> {
    let invalid = |e: std::num::ParseIntError| {
        IpamError::WrongInput(format!(
            "invalid annotation {ANNO_SPIDER_SUBNET_POOL_IP_NUMBER} {value}: {e}"
        ))
    };
    match value.trim().strip_prefix('+') {
        Some(flexible) => flexible.parse().map(PoolIpNumber::Flexible).map_err(invalid),
        None => value.trim().parse().map(PoolIpNumber::Fixed).map_err(invalid),
    }
}

/// Parses the auto-pool reclaim annotation.
pub fn parse_reclaim(value: &str) -> Result<bool, IpamError> {
    value.trim().parse().map_err(|e| {
        IpamError::WrongInput(format!(
            "invalid annotation {ANNO_SPIDER_SUBNET_RECLAIM_IPPOOL} {value}: {e}"
        ))
    })
}

/// Parses and validates the custom routes annotation.
pub fn parse_routes(value: &str) -> Result<Vec<Route>, IpamError> {
    let routes: Vec<Route> = serde_json::from_str(value)
        .map_err(|e| IpamError::WrongInput(format!("invalid annotation {ANNO_POD_ROUTES}: {e}")))?;
    for route in &routes {
        let dst = Cidr::parse(&route.dst)?;
        let gw: IpAddr = route.gw.parse().map_err(|e| {
            IpamError::WrongInput(format!("invalid gateway {} of route to {}: {e}", route.gw, route.dst))
        })?;
        if IpVersion::of(&dst.addr()) != IpVersion::of(&gw) {
            return Err(IpamError::WrongInput(format!(
                "route to {} and its gateway {} are of different IP versions",
                route.dst, route.gw
            )));
        }
    }
    Ok(routes)
}
