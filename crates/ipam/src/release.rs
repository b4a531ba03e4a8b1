//! Release engine

use crate::convert::{bare_ip, details_by_pool};
use crate::error::IpamError;
use crate::ipam::{Ipam, PoolOp};
use crate::types::{DelArgs, IpAndUid, ReleasedIp};
use crate::workload::{is_pod_running, ControllerKind};
use crds::{PodIPAllocation, SpiderEndpoint};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

impl Ipam {
    /// Releases the addresses of a pod.
    ///
    /// A pod that is still running keeps its addresses. The failure cache
    /// entry of the pod is dropped whatever the outcome; addresses it held are
    /// returned first unless the pod is still running.
    pub async fn release(
        &self,
        token: &CancellationToken,
        args: &DelArgs,
    ) -> Result<(), IpamError> {
        self.metrics.release_total.inc();
        let timer = self.metrics.release_duration_seconds.start_timer();
        info!(
            "Releasing IPs of pod {}/{} interface {} container {}",
            args.pod_namespace, args.pod_name, args.if_name, args.container_id
        );

        let result = self.release_inner(token, args).await;
        timer.observe_duration();

        if let Err(e) = &result {
            self.metrics.release_failure_total.inc();
            error!(
                "Failed to release IPs of pod {}/{} interface {}: {}",
                args.pod_namespace, args.pod_name, args.if_name, e
            );
        }
        result
    }

    /// Releases an explicit set of addresses, grouped by pool.
    pub async fn release_ips(
        &self,
        token: &CancellationToken,
        ips: Vec<ReleasedIp>,
    ) -> Result<(), IpamError> {
        self.metrics.release_total.inc();
        let timer = self.metrics.release_duration_seconds.start_timer();

        let mut by_pool: BTreeMap<String, Vec<IpAndUid>> = BTreeMap::new();
        let mut uids = Vec::new();
        for released in ips {
            if !uids.contains(&released.uid) {
                uids.push(released.uid.clone());
            }
            by_pool.entry(released.pool).or_default().push(IpAndUid {
                ip: released.ip,
                uid: released.uid,
            });
        }

        let result = self.fan_out_by_pool(token, PoolOp::Release, by_pool).await;
        for uid in &uids {
            self.failure_cache.clear(uid);
        }
        timer.observe_duration();

        if let Err(e) = &result {
            self.metrics.release_failure_total.inc();
            error!("Failed to release IPs of pod UIDs {:?}: {}", uids, e);
        }
        result
    }

    async fn release_inner(
        &self,
        token: &CancellationToken,
        args: &DelArgs,
    ) -> Result<(), IpamError> {
        let mut uids = vec![args.pod_uid.clone()];
        let result = self.release_pod(token, args, &mut uids).await;
        for uid in uids.iter().filter(|uid| !uid.is_empty()) {
            self.failure_cache.clear(uid);
        }
        result
    }

    /// Releases what the pod holds, collecting every UID whose failure cache
    /// entry goes with it.
    async fn release_pod(
        &self,
        token: &CancellationToken,
        args: &DelArgs,
        uids: &mut Vec<String>,
    ) -> Result<(), IpamError> {
        match self
            .managers
            .pod
            .get_pod_by_name(token, &args.pod_namespace, &args.pod_name)
            .await
        {
            Ok(pod) => {
                let same_incarnation = args.pod_uid.is_empty()
                    || pod.metadata.uid.as_deref() == Some(args.pod_uid.as_str());
                if same_incarnation && let Some(uid) = pod.metadata.uid.clone() {
                    uids.push(uid);
                }
                if same_incarnation && is_pod_running(&pod) {
                    info!(
                        "Pod {}/{} is still running, keeping its IPs",
                        args.pod_namespace, args.pod_name
                    );
                    return Ok(());
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("Pod {}/{} is gone", args.pod_namespace, args.pod_name);
            }
            Err(e) => return Err(e.into()),
        }

        let released = self.release_endpoint(token, args, uids).await;
        let cached = self.release_cached(token, uids).await;
        match IpamError::aggregate([released.err(), cached.err()].into_iter().flatten().collect()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the addresses held by failed allocations of `uids` to their
    /// pools. Those addresses are in no endpoint record.
    async fn release_cached(
        &self,
        token: &CancellationToken,
        uids: &[String],
    ) -> Result<(), IpamError> {
        let mut by_pool: BTreeMap<String, Vec<IpAndUid>> = BTreeMap::new();
        for uid in uids.iter().filter(|uid| !uid.is_empty()) {
            for result in self.failure_cache.get(uid).unwrap_or_default() {
                let ip = IpAndUid {
                    ip: bare_ip(&result.ip.address).to_string(),
                    uid: uid.clone(),
                };
                let entry = by_pool.entry(result.ip.ip_pool).or_default();
                if !entry.contains(&ip) {
                    entry.push(ip);
                }
            }
        }
        if by_pool.is_empty() {
            return Ok(());
        }

        info!(
            "Releasing IPs of failed allocations of pod UIDs {:?} from IP pools {:?}",
            uids,
            by_pool.keys().collect::<Vec<_>>()
        );
        self.fan_out_by_pool(token, PoolOp::Release, by_pool).await
    }

    async fn release_endpoint(
        &self,
        token: &CancellationToken,
        args: &DelArgs,
        uids: &mut Vec<String>,
    ) -> Result<(), IpamError> {
        let Some(endpoint) = self
            .managers
            .endpoint
            .get_endpoint_by_name(token, &args.pod_namespace, &args.pod_name)
            .await?
        else {
            info!(
                "Pod {}/{} has no endpoint, nothing to release",
                args.pod_namespace, args.pod_name
            );
            return Ok(());
        };

        if self.config.enable_stateful_set
            && ControllerKind::from_kind(endpoint.owner_controller_type()) == ControllerKind::StatefulSet
        {
            return self.release_statefulset_endpoint(token, args, &endpoint, uids).await;
        }

        let Some((allocation, is_current)) = retrieve_allocation(&endpoint, args) else {
            info!(
                "No IP allocation of pod {}/{} matches container {} UID {}",
                args.pod_namespace, args.pod_name, args.container_id, args.pod_uid
            );
            return Ok(());
        };
        uids.push(allocation.uid.clone());

        self.fan_out_by_pool(token, PoolOp::Release, details_by_pool(&allocation.ips, &allocation.uid))
            .await?;

        if is_current {
            self.managers.endpoint.remove_finalizer(token, &endpoint).await?;
        }
        Ok(())
    }

    /// A replica that may come back keeps its addresses; otherwise every
    /// recorded address is released and the record deleted.
    async fn release_statefulset_endpoint(
        &self,
        token: &CancellationToken,
        args: &DelArgs,
        endpoint: &SpiderEndpoint,
        uids: &mut Vec<String>,
    ) -> Result<(), IpamError> {
        let statefulset = endpoint.owner_controller_name();
        let valid = self
            .managers
            .statefulset
            .is_valid_statefulset_pod(token, &args.pod_namespace, &args.pod_name, statefulset)
            .await?;
        if valid {
            info!(
                "Pod {}/{} is still a replica of StatefulSet {}, keeping its IPs",
                args.pod_namespace, args.pod_name, statefulset
            );
            return Ok(());
        }

        info!(
            "Pod {}/{} is no longer a replica of StatefulSet {}, releasing all its IPs",
            args.pod_namespace, args.pod_name, statefulset
        );
        let mut by_pool: BTreeMap<String, Vec<IpAndUid>> = BTreeMap::new();
        for allocation in endpoint.current().into_iter().chain(endpoint.history()) {
            uids.push(allocation.uid.clone());
            for (pool, ips) in details_by_pool(&allocation.ips, &allocation.uid) {
                let entry = by_pool.entry(pool).or_default();
                for ip in ips {
                    if !entry.contains(&ip) {
                        entry.push(ip);
                    }
                }
            }
        }

        self.fan_out_by_pool(token, PoolOp::Release, by_pool).await?;
        self.managers.endpoint.remove_finalizer(token, endpoint).await?;
        self.managers.endpoint.delete_endpoint(token, endpoint).await?;
        Ok(())
    }
}

/// Allocation the delete call refers to, and whether it is the current one.
///
/// Matches on the pod UID, or on the container ID when the caller has no
/// UID. History is searched only on request.
fn retrieve_allocation<'a>(endpoint: &'a SpiderEndpoint, args: &DelArgs) -> Option<(&'a PodIPAllocation, bool)> {
    let matches = |allocation: &PodIPAllocation| {
        if args.pod_uid.is_empty() {
            allocation.container_id == args.container_id
        } else {
            allocation.uid == args.pod_uid
        }
    };

    if let Some(current) = endpoint.current()
        && matches(current)
    {
        return Some((current, true));
    }
    if args.release_history {
        return endpoint
            .history()
            .iter()
            .find(|allocation| matches(*allocation))
            .map(|allocation| (allocation, false));
    }
    None
}
