//! Conversions between allocation results, endpoint details and responses.

use crate::cidr::Cidr;
use crate::error::IpamError;
use crate::types::{AddResponse, AllocationResult, IPConfig, IpAndUid, IpVersion, ResponseRoute};
use crds::{IPAllocationDetail, Route};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Folds per-family results into one endpoint detail per NIC.
pub fn results_to_details(results: &[AllocationResult]) -> Vec<IPAllocationDetail> {
    let mut by_nic: BTreeMap<&str, IPAllocationDetail> = BTreeMap::new();
    for result in results {
        let detail = by_nic
            .entry(result.ip.nic.as_str())
            .or_insert_with(|| IPAllocationDetail {
                nic: result.ip.nic.clone(),
                vlan: result.ip.vlan,
                clean_gateway: result.clean_gateway,
                ..Default::default()
            });
        match result.ip.version {
            IpVersion::V4 => {
                detail.ipv4 = Some(result.ip.address.clone());
                detail.ipv4_pool = Some(result.ip.ip_pool.clone());
                detail.ipv4_gateway = result.ip.gateway.clone();
            }
            IpVersion::V6 => {
                detail.ipv6 = Some(result.ip.address.clone());
                detail.ipv6_pool = Some(result.ip.ip_pool.clone());
                detail.ipv6_gateway = result.ip.gateway.clone();
            }
        }
        for route in &result.routes {
            if !detail.routes.contains(route) {
                detail.routes.push(route.clone());
            }
        }
    }
    by_nic.into_values().collect()
}

/// Splits endpoint details back into per-family results.
///
/// Routes go to the result of the family their gateway belongs to.
pub fn details_to_results(details: &[IPAllocationDetail]) -> Vec<AllocationResult> {
    let mut results = Vec::new();
    for detail in details {
        let families = [
            (IpVersion::V4, &detail.ipv4, &detail.ipv4_pool, &detail.ipv4_gateway),
            (IpVersion::V6, &detail.ipv6, &detail.ipv6_pool, &detail.ipv6_gateway),
        ];
        for (version, address, pool, gateway) in families {
            let Some(address) = address else {
                continue;
            };
            let routes = detail
                .routes
                .iter()
                .filter(|route| route_version(route) == Some(version))
                .cloned()
                .collect();
            results.push(AllocationResult {
                ip: IPConfig {
                    address: address.clone(),
                    gateway: gateway.clone(),
                    ip_pool: pool.clone().unwrap_or_default(),
                    nic: detail.nic.clone(),
                    version,
                    vlan: detail.vlan,
                },
                routes,
                clean_gateway: detail.clean_gateway,
            });
        }
    }
    results
}

fn route_version(route: &Route) -> Option<IpVersion> {
    route.gw.parse::<IpAddr>().ok().map(|gw| IpVersion::of(&gw))
}

/// Builds the CNI answer out of the final results.
///
/// A result without clean-gateway whose pool has a gateway adds a default
/// route of its family.
pub fn results_to_response(results: &[AllocationResult]) -> AddResponse {
    let mut sorted: Vec<&AllocationResult> = results.iter().collect();
    sorted.sort_by(|a, b| (&a.ip.nic, a.ip.version).cmp(&(&b.ip.nic, b.ip.version)));

    let mut response = AddResponse::default();
    for result in sorted {
        if !result.clean_gateway
            && let Some(gateway) = &result.ip.gateway
        {
            response.routes.push(ResponseRoute {
                if_name: result.ip.nic.clone(),
                dst: result.ip.version.default_route_dst().to_string(),
                gw: gateway.clone(),
            });
        }
        for route in &result.routes {
            response.routes.push(ResponseRoute {
                if_name: result.ip.nic.clone(),
                dst: route.dst.clone(),
                gw: route.gw.clone(),
            });
        }
        response.ips.push(result.ip.clone());
    }
    response
}

/// Attaches each custom route to the result whose subnet contains its gateway.
pub fn group_custom_routes(results: &mut [AllocationResult], routes: Vec<Route>) -> Result<(), IpamError> {
    for route in routes {
        let gw: IpAddr = route
            .gw
            .parse()
            .map_err(|e| IpamError::WrongInput(format!("invalid gateway {} of route to {}: {e}", route.gw, route.dst)))?;

        let mut target = None;
        for (i, result) in results.iter().enumerate() {
            if Cidr::parse(&result.ip.address)?.contains(&gw) {
                target = Some(i);
                break;
            }
        }

        match target {
            Some(i) => {
                if !results[i].routes.contains(&route) {
                    results[i].routes.push(route);
                }
            }
            None => {
                return Err(IpamError::WrongInput(format!(
                    "gateway {} of custom route to {} is not in the subnet of any allocated IP",
                    route.gw, route.dst
                )));
            }
        }
    }
    Ok(())
}

/// Groups the addresses of `details` by owning pool.
pub fn details_by_pool(details: &[IPAllocationDetail], uid: &str) -> BTreeMap<String, Vec<IpAndUid>> {
    let mut by_pool: BTreeMap<String, Vec<IpAndUid>> = BTreeMap::new();
    for detail in details {
        let families = [(&detail.ipv4, &detail.ipv4_pool), (&detail.ipv6, &detail.ipv6_pool)];
        for (address, pool) in families {
            let (Some(address), Some(pool)) = (address, pool) else {
                continue;
            };
            by_pool.entry(pool.clone()).or_default().push(IpAndUid {
                ip: bare_ip(address).to_string(),
                uid: uid.to_string(),
            });
        }
    }
    by_pool
}

/// Address without prefix length
pub fn bare_ip(address: &str) -> &str {
    address.split('/').next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(nic: &str, version: IpVersion, address: &str, pool: &str, gateway: Option<&str>) -> AllocationResult {
        AllocationResult {
            ip: IPConfig {
                address: address.to_string(),
                gateway: gateway.map(str::to_string),
                ip_pool: pool.to_string(),
                nic: nic.to_string(),
                version,
                vlan: 0,
            },
            routes: Vec::new(),
            clean_gateway: false,
        }
    }

    fn route(dst: &str, gw: &str) -> Route {
        Route {
            dst: dst.to_string(),
            gw: gw.to_string(),
        }
    }

    #[test]
    fn test_details_fold_families_per_nic() {
        let mut v6 = result("eth0", IpVersion::V6, "fd00::5/64", "pool-v6", Some("fd00::1"));
        v6.routes.push(route("fd01::/64", "fd00::1"));
        let results = vec![
            result("eth0", IpVersion::V4, "10.6.0.5/16", "pool-v4", Some("10.6.0.1")),
            v6,
            result("net1", IpVersion::V4, "10.7.0.5/16", "pool-net1", None),
        ];

        let details = results_to_details(&results);
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].nic, "eth0");
        assert_eq!(details[0].ipv4.as_deref(), Some("10.6.0.5/16"));
        assert_eq!(details[0].ipv6_pool.as_deref(), Some("pool-v6"));
        assert_eq!(details[0].routes.len(), 1);
        assert_eq!(details[1].ipv4_pool.as_deref(), Some("pool-net1"));

        let mut back = details_to_results(&details);
        back.sort_by(|a, b| (&a.ip.nic, a.ip.version).cmp(&(&b.ip.nic, b.ip.version)));
        assert_eq!(back, results);
    }

    #[test]
    fn test_response_adds_default_routes_unless_clean_gateway() {
        let mut net1 = result("net1", IpVersion::V4, "10.7.0.5/16", "pool-net1", Some("10.7.0.1"));
        net1.clean_gateway = true;
        let results = vec![
            net1,
            result("eth0", IpVersion::V6, "fd00::5/64", "pool-v6", Some("fd00::1")),
            result("eth0", IpVersion::V4, "10.6.0.5/16", "pool-v4", None),
        ];

        let response = results_to_response(&results);
        assert_eq!(response.ips.len(), 3);
        assert_eq!(response.ips[0].version, IpVersion::V4);
        assert_eq!(response.ips[0].nic, "eth0");
        assert_eq!(
            response.routes,
            vec![ResponseRoute {
                if_name: "eth0".to_string(),
                dst: "::/0".to_string(),
                gw: "fd00::1".to_string(),
            }]
        );
    }

    #[test]
    fn test_group_custom_routes() {
        let mut results = vec![
            result("eth0", IpVersion::V4, "10.6.0.5/16", "a", None),
            result("net1", IpVersion::V4, "10.7.0.5/16", "b", None),
        ];
        group_custom_routes(&mut results, vec![route("192.168.0.0/24", "10.7.0.1")]).unwrap();
        assert!(results[0].routes.is_empty());
        assert_eq!(results[1].routes, vec![route("192.168.0.0/24", "10.7.0.1")]);

        let err = group_custom_routes(&mut results, vec![route("192.168.0.0/24", "10.9.0.1")]);
        assert!(matches!(err, Err(IpamError::WrongInput(_))));
    }

    #[test]
    fn test_details_by_pool() {
        let details = results_to_details(&[
            result("eth0", IpVersion::V4, "10.6.0.5/16", "a", None),
            result("net1", IpVersion::V4, "10.6.0.6/16", "a", None),
            result("eth0", IpVersion::V6, "fd00::5/64", "b", None),
        ]);
        let by_pool = details_by_pool(&details, "uid-1");
        assert_eq!(by_pool.len(), 2);
        assert_eq!(by_pool["a"].len(), 2);
        assert_eq!(by_pool["b"][0].ip, "fd00::5");
        assert_eq!(by_pool["b"][0].uid, "uid-1");
    }
}
