//! Candidate resolver
//!
//! Works out, for one pod and CNI call, which pools every interface draws
//! from. Sources are tried in a fixed precedence and the first one present
//! wins:
//!
//! 1. subnet annotations (`subnets`, then `subnet`), subnet feature only
//! 2. multi-NIC pool annotation
//! 3. single-NIC pool annotation
//! 4. cluster default subnets, subnet feature only
//! 5. namespace default pools
//! 6. pools of the CNI network configuration
//! 7. cluster default pools
//!
//! The chosen candidates then go through the version filter, the precheck,
//! the affinity filter and the VLAN check (see [`filter`]).

mod filter;
mod subnet;

pub use filter::pool_version;
pub use subnet::{auto_pool_labels, desired_ip_number};

use crate::annotations::{
    self, ANNO_NS_DEFAULT_V4_POOL, ANNO_NS_DEFAULT_V6_POOL, ANNO_POD_IPPOOL, ANNO_POD_IPPOOLS,
    ANNO_SPIDER_SUBNET, ANNO_SPIDER_SUBNETS, SubnetItem,
};
use crate::config::IpamConfig;
use crate::error::IpamError;
use crate::manager::{IPPoolManager, NamespaceManager, NodeManager, SubnetManager};
use crate::types::{AddArgs, ToBeAllocated};
use crate::workload::{pod_key, PodTopController};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resolves and filters pool candidates
#[derive(Clone)]
pub struct CandidateResolver {
    config: Arc<IpamConfig>,
    pool_manager: Arc<dyn IPPoolManager>,
    subnet_manager: Arc<dyn SubnetManager>,
    namespace_manager: Arc<dyn NamespaceManager>,
    node_manager: Arc<dyn NodeManager>,
}

impl std::fmt::Debug for CandidateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CandidateResolver {
    /// Creates a resolver.
    pub fn new(
        config: Arc<IpamConfig>,
        pool_manager: Arc<dyn IPPoolManager>,
        subnet_manager: Arc<dyn SubnetManager>,
        namespace_manager: Arc<dyn NamespaceManager>,
        node_manager: Arc<dyn NodeManager>,
    ) -> Self {
        Self {
            config,
            pool_manager,
            subnet_manager,
            namespace_manager,
            node_manager,
        }
    }

    /// Resolves the allocation intent of every interface of `pod`.
    ///
    /// Every returned candidate has its pool objects fetched and has passed
    /// all filters; nothing has been drawn yet.
    pub async fn resolve(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
        pod: &Pod,
        controller: &PodTopController,
    ) -> Result<Vec<ToBeAllocated>, IpamError> {
        let mut tbas = self.from_sources(token, args, pod, controller).await?;

        filter::filter_by_version(&self.config, &mut tbas)?;
        filter::precheck(token, self.pool_manager.as_ref(), &mut tbas).await?;
        self.filter_by_affinity(token, pod, &mut tbas).await?;
        filter::verify_vlans(&tbas)?;

        for tba in &tbas {
            for candidate in &tba.pool_candidates {
                debug!(
                    "Pod {} {} {} candidate pools {:?}",
                    pod_key(pod),
                    tba.nic,
                    candidate.ip_version,
                    candidate.pools
                );
            }
        }
        Ok(tbas)
    }

    async fn from_sources(
        &self,
        token: &CancellationToken,
        args: &AddArgs,
        pod: &Pod,
        controller: &PodTopController,
    ) -> Result<Vec<ToBeAllocated>, IpamError> {
        let key = pod_key(pod);
        let nic = args.if_name.as_str();
        let pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();

        if self.config.enable_spider_subnet {
            if let Some(value) = pod_annotations.get(ANNO_SPIDER_SUBNETS) {
                info!("Pod {} uses subnets from annotation {}", key, ANNO_SPIDER_SUBNETS);
                let items = annotations::parse_subnets(value, nic)?;
                return self.auto_pool_candidates(token, pod, controller, items).await;
            }
            if let Some(value) = pod_annotations.get(ANNO_SPIDER_SUBNET) {
                info!("Pod {} uses subnet from annotation {}", key, ANNO_SPIDER_SUBNET);
                let item = annotations::parse_subnet(value, nic)?;
                return self.auto_pool_candidates(token, pod, controller, vec![item]).await;
            }
        }

        if let Some(value) = pod_annotations.get(ANNO_POD_IPPOOLS) {
            info!("Pod {} uses IP pools from annotation {}", key, ANNO_POD_IPPOOLS);
            let items = annotations::parse_ippools(value, nic)?;
            return Ok(items
                .into_iter()
                .map(|item| ToBeAllocated::from_pools(&item.interface, item.clean_gateway, item.ipv4, item.ipv6))
                .collect());
        }

        if let Some(value) = pod_annotations.get(ANNO_POD_IPPOOL) {
            info!("Pod {} uses IP pools from annotation {}", key, ANNO_POD_IPPOOL);
            let item = annotations::parse_ippool(value, nic)?;
            return Ok(vec![ToBeAllocated::from_pools(
                nic,
                item.clean_gateway,
                item.ipv4,
                item.ipv6,
            )]);
        }

        if self.config.enable_spider_subnet
            && (!self.config.cluster_default_ipv4_subnet.is_empty()
                || !self.config.cluster_default_ipv6_subnet.is_empty())
        {
            info!("Pod {} uses cluster default subnets", key);
            let item = SubnetItem {
                interface: nic.to_string(),
                ipv4: self.config.cluster_default_ipv4_subnet.clone(),
                ipv6: self.config.cluster_default_ipv6_subnet.clone(),
                clean_gateway: args.clean_gateway,
            };
            return self.auto_pool_candidates(token, pod, controller, vec![item]).await;
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let ns = self.namespace_manager.get_namespace_by_name(token, namespace).await?;
        let ns_annotations: BTreeMap<String, String> = ns.metadata.annotations.unwrap_or_default();
        let ns_ipv4 = match ns_annotations.get(ANNO_NS_DEFAULT_V4_POOL) {
            Some(value) => annotations::parse_pool_list(value, ANNO_NS_DEFAULT_V4_POOL)?,
            None => Vec::new(),
        };
        let ns_ipv6 = match ns_annotations.get(ANNO_NS_DEFAULT_V6_POOL) {
            Some(value) => annotations::parse_pool_list(value, ANNO_NS_DEFAULT_V6_POOL)?,
            None => Vec::new(),
        };
        if !ns_ipv4.is_empty() || !ns_ipv6.is_empty() {
            info!("Pod {} uses default IP pools of namespace {}", key, namespace);
            return Ok(vec![ToBeAllocated::from_pools(nic, args.clean_gateway, ns_ipv4, ns_ipv6)]);
        }

        if !args.default_ipv4_ippool.is_empty() || !args.default_ipv6_ippool.is_empty() {
            info!("Pod {} uses IP pools of the CNI configuration", key);
            return Ok(vec![ToBeAllocated::from_pools(
                nic,
                args.clean_gateway,
                args.default_ipv4_ippool.clone(),
                args.default_ipv6_ippool.clone(),
            )]);
        }

        if !self.config.cluster_default_ipv4_ippool.is_empty()
            || !self.config.cluster_default_ipv6_ippool.is_empty()
        {
            info!("Pod {} uses cluster default IP pools", key);
            return Ok(vec![ToBeAllocated::from_pools(
                nic,
                args.clean_gateway,
                self.config.cluster_default_ipv4_ippool.clone(),
                self.config.cluster_default_ipv6_ippool.clone(),
            )]);
        }

        Err(IpamError::NoAvailablePool(format!(
            "no IP pool or subnet is configured for pod {} interface {}",
            key, nic
        )))
    }
}
