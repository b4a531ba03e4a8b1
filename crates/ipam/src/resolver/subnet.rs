//! Subnet auto-pools
//!
//! In subnet mode every (subnet, workload, interface, version) gets its own
//! pool, created empty by the subnet controller and filled asynchronously.
//! The resolver asks for creation or resizing, then waits until the pool
//! holds the desired number of addresses.

use super::CandidateResolver;
use crate::annotations::{
    self, ANNO_SPIDER_SUBNET_POOL_IP_NUMBER, ANNO_SPIDER_SUBNET_RECLAIM_IPPOOL, PoolIpNumber, SubnetItem,
};
use crate::error::{IpamError, ManagerError};
use crate::types::{IpVersion, ToBeAllocated};
use crate::workload::{pod_key, ControllerKind, PodTopController};
use crds::labels::{
    LABEL_IPPOOL_INTERFACE, LABEL_IPPOOL_VERSION, LABEL_OWNER_APPLICATION_UID, LABEL_OWNER_SPIDER_SUBNET,
};
use crds::LabelSelector;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Labels identifying the auto-pool of a workload interface
pub fn auto_pool_labels(
    subnet: &str,
    controller: &PodTopController,
    nic: &str,
    version: IpVersion,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_OWNER_SPIDER_SUBNET.to_string(), subnet.to_string()),
        (LABEL_IPPOOL_VERSION.to_string(), version.label_value().to_string()),
        (LABEL_IPPOOL_INTERFACE.to_string(), nic.to_string()),
        (LABEL_OWNER_APPLICATION_UID.to_string(), controller.uid.clone()),
    ])
}

/// Number of addresses the auto-pool of `controller` should hold.
///
/// A fixed annotation wins. Otherwise an orphan pod needs one address and a
/// sized controller needs its replicas plus the flexible margin. `None`
/// means the controller kind has no replica notion.
pub fn desired_ip_number(
    controller: &PodTopController,
    ip_number: Option<PoolIpNumber>,
    default_flexible: usize,
) -> Option<usize> {
    let flexible = match ip_number {
        Some(PoolIpNumber::Fixed(n)) => return Some(n),
        Some(PoolIpNumber::Flexible(n)) => n,
        None => default_flexible,
    };
    if controller.kind == ControllerKind::Pod {
        return Some(1);
    }
    if let ControllerKind::Unknown(_) = controller.kind {
        return None;
    }
    controller
        .replicas
        .map(|replicas| usize::try_from(replicas).unwrap_or_default() + flexible)
}

/// One auto-pool to find or create
struct AutoPool<'a> {
    subnet: &'a str,
    nic: &'a str,
    version: IpVersion,
    desired: Option<usize>,
    reclaim: bool,
}

impl CandidateResolver {
    /// Candidates backed by the auto-pools of `items`.
    pub(super) async fn auto_pool_candidates(
        &self,
        token: &CancellationToken,
        pod: &Pod,
        controller: &PodTopController,
        items: Vec<SubnetItem>,
    ) -> Result<Vec<ToBeAllocated>, IpamError> {
        let pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();
        let ip_number = pod_annotations
            .get(ANNO_SPIDER_SUBNET_POOL_IP_NUMBER)
            .map(|v| annotations::parse_ip_number(v))
            .transpose()?;
        let reclaim = pod_annotations
            .get(ANNO_SPIDER_SUBNET_RECLAIM_IPPOOL)
            .map(|v| annotations::parse_reclaim(v))
            .transpose()?
            .unwrap_or(self.config.enable_auto_pool_reclaim);
        let desired = desired_ip_number(
            controller,
            ip_number,
            self.config.cluster_subnet_default_flexible_ip_number,
        );
        let pod_selector = controller
            .selector
            .clone()
            .unwrap_or_else(|| LabelSelector::from_labels(pod.metadata.labels.clone().unwrap_or_default()));

        info!(
            "Pod {} of {} {} needs auto-created IP pools of {:?} IPs",
            pod_key(pod),
            controller.kind,
            controller.name,
            desired
        );

        let mut tbas = Vec::with_capacity(items.len());
        for item in items {
            let request = |version: IpVersion| {
                let subnet = item.subnet(version).filter(|_| match version {
                    IpVersion::V4 => self.config.enable_ipv4,
                    IpVersion::V6 => self.config.enable_ipv6,
                });
                subnet.map(|subnet| AutoPool {
                    subnet,
                    nic: &item.interface,
                    version,
                    desired,
                    reclaim,
                })
            };
            let (v4, v6) = (request(IpVersion::V4), request(IpVersion::V6));

            let (v4, v6) = tokio::join!(
                self.auto_pool_name(token, controller, &pod_selector, v4),
                self.auto_pool_name(token, controller, &pod_selector, v6),
            );
            let (ipv4, ipv6) = match (v4, v6) {
                (Ok(ipv4), Ok(ipv6)) => (ipv4, ipv6),
                (v4, v6) => {
                    let errors = [v4.err(), v6.err()].into_iter().flatten().collect();
                    return Err(IpamError::aggregate(errors).unwrap_or_else(|| {
                        IpamError::AutoPoolNotReady(format!("auto-created IP pools of {}", item.interface))
                    }));
                }
            };

            tbas.push(ToBeAllocated::from_pools(
                &item.interface,
                item.clean_gateway,
                ipv4.into_iter().collect(),
                ipv6.into_iter().collect(),
            ));
        }
        Ok(tbas)
    }

    /// Name of the ready auto-pool, `None` when no pool is requested.
    async fn auto_pool_name(
        &self,
        token: &CancellationToken,
        controller: &PodTopController,
        pod_selector: &LabelSelector,
        request: Option<AutoPool<'_>>,
    ) -> Result<Option<String>, IpamError> {
        let Some(request) = request else {
            return Ok(None);
        };
        let labels = auto_pool_labels(request.subnet, controller, request.nic, request.version);
        let ready = |total: i64| request.desired.is_none_or(|d| i64::try_from(d) == Ok(total));

        let existing = self.pool_manager.list_ippools(token, &labels).await?;
        match existing.first() {
            None => {
                info!(
                    "Creating {} auto-created IP pool of {} {} for {} from subnet {}",
                    request.version, controller.kind, controller.name, request.nic, request.subnet
                );
                self.subnet_manager
                    .allocate_empty_ippool(
                        token,
                        request.subnet,
                        controller,
                        pod_selector,
                        request.desired,
                        request.version,
                        request.reclaim,
                        request.nic,
                    )
                    .await?;
            }
            Some(pool) if ready(pool.total_ip_count()) => return Ok(Some(pool.name().to_string())),
            Some(pool) => {
                if let Some(desired) = request.desired {
                    info!(
                        "Scaling auto-created IP pool {} from {} to {} IPs",
                        pool.name(),
                        pool.total_ip_count(),
                        desired
                    );
                    self.subnet_manager
                        .check_scale_ippool(token, pool, request.subnet, desired)
                        .await?;
                }
            }
        }

        let mut last = String::from("not created yet");
        for attempt in 1..=self.config.operation_retries {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(IpamError::Canceled(format!(
                        "waiting for auto-created {} IP pool of {}",
                        request.version, request.nic
                    )));
                }
                _ = tokio::time::sleep(self.config.operation_gap()) => {}
            }

            match self.pool_manager.list_ippools(token, &labels).await {
                Ok(pools) => match pools.first() {
                    Some(pool) if ready(pool.total_ip_count()) => {
                        debug!("Auto-created IP pool {} is ready after {} attempts", pool.name(), attempt);
                        return Ok(Some(pool.name().to_string()));
                    }
                    Some(pool) => {
                        last = format!("{} holds {} IPs", pool.name(), pool.total_ip_count());
                    }
                    None => last = String::from("not created yet"),
                },
                Err(ManagerError::Canceled(what)) => return Err(IpamError::Canceled(what)),
                Err(e) => {
                    warn!("Failed to list auto-created IP pools of {}: {}", request.nic, e);
                    last = e.to_string();
                }
            }
        }

        Err(IpamError::AutoPoolNotReady(format!(
            "{} IP pool of {} {} for {} from subnet {} wants {:?} IPs after {} attempts: {}",
            request.version,
            controller.kind,
            controller.name,
            request.nic,
            request.subnet,
            request.desired,
            self.config.operation_retries,
            last
        )))
    }
}
