//! Allocation engine
//!
//! `allocate` answers a CNI ADD call. In order it:
//!
//! 1. refuses pods that must not get addresses;
//! 2. re-registers the recorded addresses of a StatefulSet replica;
//! 3. returns the current allocation of the same container (multi-NIC);
//! 4. otherwise resolves candidates and draws one address per interface and
//!    family, all candidates concurrently, pools of one candidate in order.
//!
//! Results of a call that fails after drawing are kept in the failure cache
//! and reused by the retry.

use crate::annotations::{self, ANNO_POD_ROUTES};
use crate::convert::{details_by_pool, details_to_results, group_custom_routes, results_to_response};
use crate::error::{IpamError, ManagerError};
use crate::failure_cache::FailureCache;
use crate::ipam::{Ipam, PoolOp};
use crate::manager::IPPoolManager;
use crate::metrics::IpamMetrics;
use crate::types::{AddArgs, AddResponse, AllocationResult, PoolCandidate, ToBeAllocated};
use crate::workload::{pod_key, pod_lifecycle, ControllerKind, PodTopController};
use crds::SpiderEndpoint;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// UID of the pod incarnation, as recorded by the API server
fn pod_uid(pod: &Pod, fallback: &str) -> String {
    pod.metadata
        .uid
        .clone()
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn node_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default()
}

impl Ipam {
    /// Allocates the addresses of a pod interface.
    pub async fn allocate(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
    ) -> Result<AddResponse, IpamError> {
        self.metrics.allocation_total.inc();
        let timer = self.metrics.allocation_duration_seconds.start_timer();
        info!(
            "Allocating IPs for pod {}/{} interface {} container {}",
            args.pod_namespace, args.pod_name, args.if_name, args.container_id
        );

        let result = self.allocate_inner(token, args).await;
        timer.observe_duration();

        match &result {
            Ok(response) => {
                let ips: Vec<&str> = response.ips.iter().map(|ip| ip.address.as_str()).collect();
                info!(
                    "Allocated IPs {:?} to pod {}/{} interface {}",
                    ips, args.pod_namespace, args.pod_name, args.if_name
                );
            }
            Err(e) => {
                self.metrics.allocation_failure_total.inc();
                error!(
                    "Failed to allocate IPs for pod {}/{} interface {}: {}",
                    args.pod_namespace, args.pod_name, args.if_name, e
                );
            }
        }
        result
    }

    async fn allocate_inner(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
    ) -> Result<AddResponse, IpamError> {
        let pod = self
            .managers
            .pod
            .get_pod_by_name(token, &args.pod_namespace, &args.pod_name)
            .await?;
        let lifecycle = pod_lifecycle(&pod);
        if !lifecycle.is_allocatable() {
            return Err(IpamError::NotAllocatablePod {
                pod: pod_key(&pod),
                status: lifecycle.to_string(),
            });
        }

        let controller = self.managers.pod.get_pod_top_controller(token, &pod).await?;
        debug!("Top controller of pod {} is {} {}", pod_key(&pod), controller.kind, controller.name);

        let endpoint = self
            .managers
            .endpoint
            .get_endpoint_by_name(token, &args.pod_namespace, &args.pod_name)
            .await?;

        if let Some(endpoint) = &endpoint {
            if self.config.enable_stateful_set
                && controller.kind == ControllerKind::StatefulSet
                && let Some(response) = self.reallocate_statefulset_ips(token, args, &pod, endpoint).await?
            {
                return Ok(response);
            }
            if let Some(response) = reuse_existing_allocation(args, endpoint) {
                return Ok(response);
            }
        }

        self.allocate_in_standard_mode(token, args, pod, controller, endpoint)
            .await
    }

    /// Re-registers the recorded addresses of a StatefulSet replica.
    ///
    /// `None` means the record holds nothing for this interface and a fresh
    /// allocation is needed.
    async fn reallocate_statefulset_ips(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
        pod: &Pod,
        endpoint: &SpiderEndpoint,
    ) -> Result<Option<AddResponse>, IpamError> {
        let current = endpoint.current().ok_or_else(|| {
            IpamError::DataBroken(format!(
                "endpoint of StatefulSet pod {} has no current IP allocation",
                pod_key(pod)
            ))
        })?;
        if !current.ips.iter().any(|detail| detail.nic == args.if_name) {
            info!(
                "Endpoint of StatefulSet pod {} holds no IP for {}, allocating",
                pod_key(pod),
                args.if_name
            );
            return Ok(None);
        }

        let uid = pod_uid(pod, &args.pod_uid);
        info!("Reusing IPs of StatefulSet pod {} for pod UID {}", pod_key(pod), uid);
        self.fan_out_by_pool(token, PoolOp::UpdateAllocated, details_by_pool(&current.ips, &uid))
            .await?;

        if current.uid != uid || current.container_id != args.container_id {
            self.managers
                .endpoint
                .reallocate_current_ip_allocation(token, &args.container_id, &uid, node_name(pod), endpoint)
                .await?;
        }

        Ok(Some(results_to_response(&details_to_results(&current.ips))))
    }

    async fn allocate_in_standard_mode(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
        pod: Pod,
        controller: PodTopController,
        endpoint: Option<SpiderEndpoint>,
    ) -> Result<AddResponse, IpamError> {
        let custom_routes = match pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNO_POD_ROUTES))
        {
            Some(value) => annotations::parse_routes(value)?,
            None => Vec::new(),
        };

        let tbas = self.resolver.resolve(token, args, &pod, &controller).await?;
        let uid = pod_uid(&pod, &args.pod_uid);
        let pod = Arc::new(pod);

        let (mut results, errors) = {
            let pool_names: Vec<String> = tbas
                .iter()
                .flat_map(ToBeAllocated::pool_names)
                .map(str::to_string)
                .collect();
            let _ticket = self.limiter.acquire(token, pool_names).await?;
            self.allocate_for_all_nics(token, &uid, &pod, tbas).await
        };

        if let Some(e) = IpamError::aggregate(errors) {
            self.failure_cache.store(&uid, results);
            return Err(e);
        }

        if let Err(e) = group_custom_routes(&mut results, custom_routes) {
            self.failure_cache.store(&uid, results);
            return Err(e);
        }

        if let Err(e) = self
            .managers
            .endpoint
            .patch_ip_allocation_results(
                token,
                &args.container_id,
                &results,
                endpoint.as_ref(),
                &pod,
                &controller,
            )
            .await
        {
            self.failure_cache.store(&uid, results);
            return Err(e.into());
        }

        self.failure_cache.clear(&uid);
        Ok(results_to_response(&results))
    }

    /// Draws one address per (interface, candidate) concurrently.
    ///
    /// Returns every success and every failure; a failure never aborts the
    /// other candidates.
    async fn allocate_for_all_nics(
        &self,
        token: &CancellationToken,
        uid: &str,
        pod: &Arc<Pod>,
        tbas: Vec<ToBeAllocated>,
    ) -> (Vec<AllocationResult>, Vec<IpamError>) {
        let mut tasks = JoinSet::new();
        for tba in tbas {
            for candidate in tba.pool_candidates {
                let task = CandidateTask {
                    pool_manager: Arc::clone(&self.managers.ippool),
                    failure_cache: self.failure_cache.clone(),
                    metrics: Arc::clone(&self.metrics),
                    token: token.clone(),
                    uid: uid.to_string(),
                    nic: tba.nic.clone(),
                    clean_gateway: tba.clean_gateway,
                    candidate,
                    pod: Arc::clone(pod),
                };
                tasks.spawn(task.run());
            }
        }

        let mut results = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(IpamError::TaskFailed(e.to_string())),
            }
        }
        (results, errors)
    }
}

/// Current allocation of the same container, when it covers the interface
fn reuse_existing_allocation(args: &AddArgs, endpoint: &SpiderEndpoint) -> Option<AddResponse> {
    let current = endpoint.current()?;
    if current.container_id != args.container_id || !current.ips.iter().any(|d| d.nic == args.if_name) {
        return None;
    }
    info!(
        "Reusing IPs already allocated to container {} of pod {}/{} for {}",
        args.container_id, args.pod_namespace, args.pod_name, args.if_name
    );
    Some(results_to_response(&details_to_results(&current.ips)))
}

/// Draw of one address for one interface and family
struct CandidateTask {
    pool_manager: Arc<dyn IPPoolManager>,
    failure_cache: FailureCache,
    metrics: Arc<IpamMetrics>,
    token: CancellationToken,
    uid: String,
    nic: String,
    clean_gateway: bool,
    candidate: PoolCandidate,
    pod: Arc<Pod>,
}

impl CandidateTask {
    async fn run(self) -> Result<AllocationResult, IpamError> {
        if let Some(result) = self.reuse_cached() {
            return Ok(result);
        }

        let mut failures = Vec::new();
        for pool in &self.candidate.pools {
            if self.token.is_cancelled() {
                return Err(IpamError::Canceled(format!(
                    "allocating {} IP for {}",
                    self.candidate.ip_version, self.nic
                )));
            }
            match self.pool_manager.allocate_ip(&self.token, pool, &self.nic, &self.pod).await {
                Ok(mut ip) => {
                    let object = self.candidate.pool_objects.get(pool);
                    if ip.gateway.is_none() {
                        ip.gateway = object.and_then(|p| p.spec.gateway.clone());
                    }
                    if let Some(object) = object {
                        ip.vlan = object.vlan();
                    }
                    info!("Allocated IP {} from IP pool {} for {}", ip.address, pool, self.nic);
                    return Ok(AllocationResult {
                        ip,
                        routes: object.map(|p| p.spec.routes.clone()).unwrap_or_default(),
                        clean_gateway: self.clean_gateway,
                    });
                }
                Err(ManagerError::Canceled(what)) => return Err(IpamError::Canceled(what)),
                Err(e) => {
                    warn!(
                        "Failed to allocate {} IP for {} from IP pool {}: {}",
                        self.candidate.ip_version, self.nic, pool, e
                    );
                    failures.push((pool.clone(), e));
                }
            }
        }

        Err(IpamError::PoolsExhausted {
            nic: self.nic,
            version: self.candidate.ip_version,
            pools: self.candidate.pools,
            failures,
        })
    }

    /// Address this UID already holds from one of the candidate's pools
    fn reuse_cached(&self) -> Option<AllocationResult> {
        let mut cached = self
            .failure_cache
            .find(&self.uid, &self.candidate.pools, &self.nic)?;
        if let Some(pool) = self.candidate.pool_objects.get(&cached.ip.ip_pool) {
            cached.ip.gateway = pool.spec.gateway.clone();
            cached.ip.vlan = pool.vlan();
            cached.routes = pool.spec.routes.clone();
        }
        cached.clean_gateway = self.clean_gateway;
        self.metrics.failure_cache_reused_total.inc();
        info!(
            "Reusing IP {} of IP pool {} for {} from a failed allocation of pod UID {}",
            cached.ip.address, cached.ip.ip_pool, self.nic, self.uid
        );
        Some(cached)
    }
}
