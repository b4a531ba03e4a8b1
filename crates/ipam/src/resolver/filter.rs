//! Post-resolution pipeline: version filter, precheck, affinity filter and
//! VLAN check.

use super::CandidateResolver;
use crate::cidr::Cidr;
use crate::config::IpamConfig;
use crate::error::IpamError;
use crate::manager::IPPoolManager;
use crate::selector;
use crate::types::{IpVersion, ToBeAllocated};
use crds::SpiderIPPool;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// IP version served by `pool`, falling back to its subnet's family.
pub fn pool_version(pool: &SpiderIPPool) -> Option<IpVersion> {
    match pool.spec.ip_version {
        Some(version) => IpVersion::from_i64(version),
        None => Cidr::parse(&pool.spec.subnet)
            .ok()
            .map(|cidr| IpVersion::of(&cidr.addr())),
    }
}

/// Drops candidates of disabled families.
///
/// An interface left without any candidate is an error. Under dual-stack an
/// interface with a single family is accepted.
pub(super) fn filter_by_version(config: &IpamConfig, tbas: &mut [ToBeAllocated]) -> Result<(), IpamError> {
    for tba in tbas.iter_mut() {
        tba.pool_candidates.retain(|candidate| {
            let enabled = match candidate.ip_version {
                IpVersion::V4 => config.enable_ipv4,
                IpVersion::V6 => config.enable_ipv6,
            };
            if !enabled {
                info!(
                    "Ignoring {} IP pools {:?} of {}: {} is disabled",
                    candidate.ip_version, candidate.pools, tba.nic, candidate.ip_version
                );
            }
            enabled
        });
        if tba.pool_candidates.is_empty() {
            return Err(IpamError::WrongInput(format!(
                "no IP pool of an enabled IP version is specified for {}",
                tba.nic
            )));
        }
    }
    Ok(())
}

/// Fetches every named pool once and attaches it to its candidates.
///
/// A pool named twice in one candidate is an error; a pool that cannot be
/// fetched fails the whole call.
pub(super) async fn precheck(
    token: &CancellationToken,
    pool_manager: &dyn IPPoolManager,
    tbas: &mut [ToBeAllocated],
) -> Result<(), IpamError> {
    let mut names: Vec<String> = Vec::new();
    for tba in tbas.iter() {
        for candidate in &tba.pool_candidates {
            let mut seen = HashSet::new();
            for pool in &candidate.pools {
                if !seen.insert(pool.as_str()) {
                    return Err(IpamError::WrongInput(format!(
                        "duplicate IP pool {} in {} candidate of {}",
                        pool, candidate.ip_version, tba.nic
                    )));
                }
                if !names.contains(pool) {
                    names.push(pool.clone());
                }
            }
        }
    }

    let fetched = try_join_all(names.iter().map(|name| pool_manager.get_ippool_by_name(token, name))).await?;
    let objects: HashMap<String, Arc<SpiderIPPool>> = names.into_iter().zip(fetched.into_iter().map(Arc::new)).collect();

    for tba in tbas.iter_mut() {
        for candidate in tba.pool_candidates.iter_mut() {
            for pool in &candidate.pools {
                if let Some(object) = objects.get(pool) {
                    candidate.pool_objects.insert(pool.clone(), Arc::clone(object));
                }
            }
        }
    }
    Ok(())
}

/// Labels and names the affinity checks run against
struct AffinityTarget<'a> {
    namespace: &'a str,
    pod_labels: BTreeMap<String, String>,
    namespace_labels: BTreeMap<String, String>,
    node_name: &'a str,
    node_labels: BTreeMap<String, String>,
}

/// Why a pool cannot serve the pod, `None` when it can
fn unusable_reason(
    pool: &SpiderIPPool,
    version: IpVersion,
    target: &AffinityTarget<'_>,
) -> Result<Option<String>, IpamError> {
    if pool.is_terminating() {
        return Ok(Some("terminating".to_string()));
    }
    if pool.spec.disable {
        return Ok(Some("disabled".to_string()));
    }
    if pool_version(pool) != Some(version) {
        return Ok(Some(format!("not an {} pool", version)));
    }
    if let Some(affinity) = &pool.spec.pod_affinity
        && !selector::matches(affinity, &target.pod_labels)?
    {
        return Ok(Some("pod affinity does not match".to_string()));
    }
    if !pool.spec.namespace_name.is_empty() && !pool.spec.namespace_name.iter().any(|n| n == target.namespace) {
        return Ok(Some(format!("namespace {} is not allowed", target.namespace)));
    }
    if let Some(affinity) = &pool.spec.namespace_affinity
        && !selector::matches(affinity, &target.namespace_labels)?
    {
        return Ok(Some("namespace affinity does not match".to_string()));
    }
    if !pool.spec.node_name.is_empty() && !pool.spec.node_name.iter().any(|n| n == target.node_name) {
        return Ok(Some(format!("node {} is not allowed", target.node_name)));
    }
    if let Some(affinity) = &pool.spec.node_affinity
        && !selector::matches(affinity, &target.node_labels)?
    {
        return Ok(Some("node affinity does not match".to_string()));
    }
    Ok(None)
}

impl CandidateResolver {
    /// Drops pools the pod may not use; a candidate left empty is an error.
    pub(super) async fn filter_by_affinity(
        &self,
        token: &CancellationToken,
        pod: &Pod,
        tbas: &mut [ToBeAllocated],
    ) -> Result<(), IpamError> {
        let mut needs_namespace = false;
        let mut needs_node = false;
        for candidate in tbas.iter().flat_map(|tba| tba.pool_candidates.iter()) {
            for pool in candidate.pool_objects.values() {
                needs_namespace |= pool.spec.namespace_affinity.is_some();
                needs_node |= pool.spec.node_affinity.is_some();
            }
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default();

        let namespace_labels = if needs_namespace {
            self.namespace_manager
                .get_namespace_by_name(token, namespace)
                .await?
                .metadata
                .labels
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        let node_labels = if needs_node {
            self.node_manager
                .get_node_by_name(token, node_name)
                .await?
                .metadata
                .labels
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        let target = AffinityTarget {
            namespace,
            pod_labels: pod.metadata.labels.clone().unwrap_or_default(),
            namespace_labels,
            node_name,
            node_labels,
        };

        for tba in tbas.iter_mut() {
            for candidate in tba.pool_candidates.iter_mut() {
                let mut kept = Vec::with_capacity(candidate.pools.len());
                let mut reasons = Vec::new();
                for name in &candidate.pools {
                    let Some(pool) = candidate.pool_objects.get(name) else {
                        reasons.push(format!("{}: not fetched", name));
                        continue;
                    };
                    match unusable_reason(pool, candidate.ip_version, &target)? {
                        Some(reason) => {
                            debug!("Filtered out IP pool {} for {}: {}", name, tba.nic, reason);
                            reasons.push(format!("{}: {}", name, reason));
                        }
                        None => kept.push(name.clone()),
                    }
                }

                if kept.is_empty() {
                    return Err(IpamError::NoAvailablePool(format!(
                        "all {} IP pools of {} are filtered out ({})",
                        candidate.ip_version,
                        tba.nic,
                        reasons.join(", ")
                    )));
                }
                candidate.pool_objects.retain(|name, _| kept.contains(name));
                candidate.pools = kept;
            }
        }
        Ok(())
    }
}

/// All pools feeding one interface must share a VLAN.
pub(super) fn verify_vlans(tbas: &[ToBeAllocated]) -> Result<(), IpamError> {
    for tba in tbas {
        let mut first: Option<(&str, i64)> = None;
        for candidate in &tba.pool_candidates {
            for name in &candidate.pools {
                let Some(pool) = candidate.pool_objects.get(name) else {
                    continue;
                };
                match first {
                    None => first = Some((name.as_str(), pool.vlan())),
                    Some((first_name, vlan)) if vlan != pool.vlan() => {
                        return Err(IpamError::WrongInput(format!(
                            "IP pools {} (VLAN {}) and {} (VLAN {}) of {} are in different VLANs",
                            first_name,
                            vlan,
                            name,
                            pool.vlan(),
                            tba.nic
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolCandidate;
    use crds::{LabelSelector, SpiderIPPoolSpec};

    fn pool(name: &str, version: i64, vlan: i64) -> SpiderIPPool {
        SpiderIPPool::new(
            name,
            SpiderIPPoolSpec {
                ip_version: Some(version),
                subnet: if version == 4 { "10.6.0.0/16" } else { "fd00::/64" }.to_string(),
                vlan: Some(vlan),
                ..Default::default()
            },
        )
    }

    fn tba_with(pools: &[SpiderIPPool]) -> ToBeAllocated {
        let mut candidate = PoolCandidate::new(
            IpVersion::V4,
            pools.iter().map(|p| p.name().to_string()).collect(),
        );
        for p in pools {
            candidate.pool_objects.insert(p.name().to_string(), Arc::new(p.clone()));
        }
        ToBeAllocated {
            nic: "eth0".to_string(),
            clean_gateway: false,
            pool_candidates: vec![candidate],
        }
    }

    fn target() -> AffinityTarget<'static> {
        AffinityTarget {
            namespace: "default",
            pod_labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
            namespace_labels: BTreeMap::new(),
            node_name: "node-1",
            node_labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_pool_version_falls_back_to_subnet() {
        let mut p = pool("a", 6, 0);
        assert_eq!(pool_version(&p), Some(IpVersion::V6));
        p.spec.ip_version = None;
        p.spec.subnet = "10.0.0.0/8".to_string();
        assert_eq!(pool_version(&p), Some(IpVersion::V4));
    }

    #[test]
    fn test_version_filter() {
        let config = IpamConfig::default();
        let mut tbas = vec![ToBeAllocated::from_pools(
            "eth0",
            false,
            vec!["v4".to_string()],
            vec!["v6".to_string()],
        )];
        filter_by_version(&config, &mut tbas).unwrap();
        assert_eq!(tbas[0].pool_candidates.len(), 1);
        assert_eq!(tbas[0].pool_candidates[0].ip_version, IpVersion::V4);

        let mut only_v6 = vec![ToBeAllocated::from_pools("eth0", false, Vec::new(), vec!["v6".to_string()])];
        assert!(matches!(
            filter_by_version(&config, &mut only_v6),
            Err(IpamError::WrongInput(_))
        ));
    }

    #[test]
    fn test_dual_stack_accepts_single_family() {
        let config = IpamConfig {
            enable_ipv6: true,
            ..Default::default()
        };
        let mut tbas = vec![ToBeAllocated::from_pools("eth0", false, vec!["v4".to_string()], Vec::new())];
        assert!(filter_by_version(&config, &mut tbas).is_ok());
    }

    #[test]
    fn test_unusable_reasons() {
        let target = target();
        assert!(unusable_reason(&pool("a", 4, 0), IpVersion::V4, &target).unwrap().is_none());
        assert!(unusable_reason(&pool("a", 6, 0), IpVersion::V4, &target).unwrap().is_some());

        let mut disabled = pool("a", 4, 0);
        disabled.spec.disable = true;
        assert_eq!(
            unusable_reason(&disabled, IpVersion::V4, &target).unwrap().as_deref(),
            Some("disabled")
        );

        let mut other_app = pool("a", 4, 0);
        other_app.spec.pod_affinity = Some(LabelSelector::from_labels(BTreeMap::from([(
            "app".to_string(),
            "db".to_string(),
        )])));
        assert!(unusable_reason(&other_app, IpVersion::V4, &target).unwrap().is_some());

        let mut other_node = pool("a", 4, 0);
        other_node.spec.node_name = vec!["node-2".to_string()];
        assert!(unusable_reason(&other_node, IpVersion::V4, &target).unwrap().is_some());

        let mut this_ns = pool("a", 4, 0);
        this_ns.spec.namespace_name = vec!["default".to_string()];
        assert!(unusable_reason(&this_ns, IpVersion::V4, &target).unwrap().is_none());
    }

    #[test]
    fn test_verify_vlans() {
        assert!(verify_vlans(&[tba_with(&[pool("a", 4, 10), pool("b", 4, 10)])]).is_ok());
        assert!(matches!(
            verify_vlans(&[tba_with(&[pool("a", 4, 10), pool("b", 4, 20)])]),
            Err(IpamError::WrongInput(_))
        ));
    }
}
