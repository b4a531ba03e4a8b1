//! IPAM engine
//!
//! Ties the resolver, the admission limiter, the failure cache and the
//! collaborators together. Allocation lives in `allocate.rs`, release in
//! `release.rs`.

use crate::config::IpamConfig;
use crate::error::{IpamError, ManagerError};
use crate::failure_cache::FailureCache;
use crate::limiter::Limiter;
use crate::manager::{
    EndpointManager, IPPoolManager, NamespaceManager, NodeManager, PodManager, StatefulSetManager,
    SubnetManager,
};
use crate::metrics::IpamMetrics;
use crate::resolver::CandidateResolver;
use crate::types::IpAndUid;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Collaborators the engine works through
#[derive(Clone)]
pub struct Managers {
    /// Pool ledgers
    pub ippool: Arc<dyn IPPoolManager>,
    /// Endpoint records
    pub endpoint: Arc<dyn EndpointManager>,
    /// Subnet auto-pools
    pub subnet: Arc<dyn SubnetManager>,
    /// Pod lookups
    pub pod: Arc<dyn PodManager>,
    /// Namespace lookups
    pub namespace: Arc<dyn NamespaceManager>,
    /// Node lookups
    pub node: Arc<dyn NodeManager>,
    /// StatefulSet lookups
    pub statefulset: Arc<dyn StatefulSetManager>,
}

/// Pod IP allocation and release engine
#[derive(Clone)]
pub struct Ipam {
    pub(crate) config: Arc<IpamConfig>,
    pub(crate) managers: Managers,
    pub(crate) resolver: CandidateResolver,
    pub(crate) limiter: Limiter,
    pub(crate) failure_cache: FailureCache,
    pub(crate) metrics: Arc<IpamMetrics>,
}

impl std::fmt::Debug for Managers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Managers").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Ipam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipam")
            .field("config", &self.config)
            .field("limiter", &self.limiter)
            .field("failure_cache", &self.failure_cache)
            .finish_non_exhaustive()
    }
}

/// Ledger operation applied to every pool of a fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolOp {
    /// Give the addresses back
    Release,
    /// Re-register the addresses under their owner UID
    UpdateAllocated,
}

impl Ipam {
    /// Creates an engine. The limiter does not run until [`Ipam::start`].
    pub fn new(config: IpamConfig, managers: Managers, metrics: Arc<IpamMetrics>) -> Result<Self, IpamError> {
        config.validate()?;
        let config = Arc::new(config);
        let resolver = CandidateResolver::new(
            Arc::clone(&config),
            Arc::clone(&managers.ippool),
            Arc::clone(&managers.subnet),
            Arc::clone(&managers.namespace),
            Arc::clone(&managers.node),
        );
        let limiter = Limiter::new(config.limiter.clone(), Arc::clone(&metrics));

        Ok(Self {
            config,
            managers,
            resolver,
            limiter,
            failure_cache: FailureCache::new(),
            metrics,
        })
    }

    /// Starts the admission limiter; it stops when `token` is canceled.
    pub fn start(&self, token: CancellationToken) -> Result<JoinHandle<()>, IpamError> {
        info!(
            "Starting IPAM (IPv4 {}, IPv6 {}, StatefulSet {}, subnet {})",
            self.config.enable_ipv4,
            self.config.enable_ipv6,
            self.config.enable_stateful_set,
            self.config.enable_spider_subnet
        );
        self.limiter.start(token)
    }

    /// Engine configuration
    pub fn config(&self) -> &IpamConfig {
        &self.config
    }

    /// Failure cache shared by every call of the engine
    pub fn failure_cache(&self) -> &FailureCache {
        &self.failure_cache
    }

    /// Applies `op` to every pool of `by_pool` concurrently.
    ///
    /// Tickets for all pools are held for the whole fan-out. Every failure is
    /// collected; none aborts its siblings.
    pub(crate) async fn fan_out_by_pool(
        &self,
        token: &CancellationToken,
        op: PoolOp,
        by_pool: BTreeMap<String, Vec<IpAndUid>>,
    ) -> Result<(), IpamError> {
        if by_pool.is_empty() {
            return Ok(());
        }
        let _ticket = self.limiter.acquire(token, by_pool.keys().cloned()).await?;

        let mut tasks = JoinSet::new();
        for (pool, ips) in by_pool {
            let pool_manager = Arc::clone(&self.managers.ippool);
            let token = token.clone();
            tasks.spawn(async move {
                if token.is_cancelled() {
                    return Err(IpamError::Canceled(format!("{:?} of IP pool {}", op, pool)));
                }
                let result: Result<(), ManagerError> = match op {
                    PoolOp::Release => pool_manager.release_ip(&token, &pool, &ips).await,
                    PoolOp::UpdateAllocated => pool_manager.update_allocated_ips(&token, &pool, &ips).await,
                };
                match result {
                    Ok(()) => {
                        info!("{:?} {} IPs of IP pool {}", op, ips.len(), pool);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Failed to {:?} IPs {:?} of IP pool {}: {}", op, ips, pool, e);
                        Err(IpamError::from(e))
                    }
                }
            });
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(IpamError::TaskFailed(e.to_string())),
            }
        }
        match IpamError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
