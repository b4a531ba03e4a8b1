//! Mock subnet controller

use super::pool::MockIPPoolManager;
use crate::error::ManagerError;
use crate::manager::SubnetManager;
use crate::resolver::auto_pool_labels;
use crate::types::IpVersion;
use crate::workload::PodTopController;
use crds::labels::LABEL_IPPOOL_RECLAIM;
use crds::{LabelSelector, SpiderIPPool, SpiderIPPoolSpec};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Subnet the mock controller carves pools from
#[derive(Clone, Debug)]
struct MockSubnet {
    version: IpVersion,
    cidr: String,
    gateway: Option<String>,
    free: VecDeque<String>,
}

/// Mock SubnetManager
///
/// Creates and resizes auto-pools in the wrapped [`MockIPPoolManager`]
/// immediately, so a created pool is ready on the next lookup.
#[derive(Debug, Clone)]
pub struct MockSubnetManager {
    pools: MockIPPoolManager,
    subnets: Arc<Mutex<HashMap<String, MockSubnet>>>,
    // Accept requests without ever acting on them
    stalled: Arc<AtomicBool>,
    create_calls: Arc<AtomicUsize>,
    scale_calls: Arc<AtomicUsize>,
}

impl MockSubnetManager {
    /// Controller creating pools in `pools`
    pub fn new(pools: MockIPPoolManager) -> Self {
        Self {
            pools,
            subnets: Arc::new(Mutex::new(HashMap::new())),
            stalled: Arc::new(AtomicBool::new(false)),
            create_calls: Arc::new(AtomicUsize::new(0)),
            scale_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Add a subnet with its free addresses (for test setup)
    pub fn add_subnet(&self, name: &str, version: IpVersion, cidr: &str, gateway: Option<&str>, addresses: &[&str]) {
        self.subnets.lock().unwrap().insert(
            name.to_string(),
            MockSubnet {
                version,
                cidr: cidr.to_string(),
                gateway: gateway.map(str::to_string),
                free: addresses.iter().map(|a| a.to_string()).collect(),
            },
        );
    }

    /// Accept creation and scaling requests without carrying them out
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of `allocate_empty_ippool` calls
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `check_scale_ippool` calls
    pub fn scale_calls(&self) -> usize {
        self.scale_calls.load(Ordering::SeqCst)
    }

    fn take(&self, subnet: &str, count: usize) -> Result<(MockSubnet, Vec<String>), ManagerError> {
        let mut subnets = self.subnets.lock().unwrap();
        let entry = subnets
            .get_mut(subnet)
            .ok_or_else(|| ManagerError::NotFound(format!("SpiderSubnet {}", subnet)))?;
        if entry.free.len() < count {
            return Err(ManagerError::Exhausted(format!("SpiderSubnet {}", subnet)));
        }
        let taken = entry.free.drain(..count).collect();
        Ok((entry.clone(), taken))
    }
}

#[async_trait::async_trait]
impl SubnetManager for MockSubnetManager {
    async fn allocate_empty_ippool(
        &self,
        _token: &CancellationToken,
        subnet: &str,
        controller: &PodTopController,
        pod_selector: &LabelSelector,
        desired_ip_number: Option<usize>,
        version: IpVersion,
        reclaim: bool,
        nic: &str,
    ) -> Result<(), ManagerError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (source, addresses) = self.take(subnet, desired_ip_number.unwrap_or(1))?;
        if source.version != version {
            return Err(ManagerError::Api(format!("SpiderSubnet {} is not {}", subnet, version)));
        }

        let name = format!("auto{}-{}-{}-{}", version.as_i64(), controller.name, nic, n);
        let mut pool = SpiderIPPool::new(
            &name,
            SpiderIPPoolSpec {
                ip_version: Some(version.as_i64()),
                subnet: source.cidr,
                gateway: source.gateway,
                pod_affinity: Some(pod_selector.clone()),
                ..Default::default()
            },
        );
        let mut labels = auto_pool_labels(subnet, controller, nic, version);
        labels.insert(LABEL_IPPOOL_RECLAIM.to_string(), reclaim.to_string());
        pool.metadata.labels = Some(labels);

        let addresses: Vec<&str> = addresses.iter().map(String::as_str).collect();
        self.pools.add_pool(pool, &addresses);
        Ok(())
    }

    async fn check_scale_ippool(
        &self,
        _token: &CancellationToken,
        pool: &SpiderIPPool,
        subnet: &str,
        desired_ip_number: usize,
    ) -> Result<(), ManagerError> {
        self.scale_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let name = pool.name().to_string();
        let mut stored = self
            .pools
            .pool(&name)
            .ok_or_else(|| ManagerError::NotFound(format!("SpiderIPPool {}", name)))?;
        let total = usize::try_from(stored.total_ip_count()).unwrap_or_default();
        if desired_ip_number > total {
            let (_, addresses) = self.take(subnet, desired_ip_number - total)?;
            let addresses: Vec<&str> = addresses.iter().map(String::as_str).collect();
            self.pools.add_free(&name, &addresses);
        }
        // Shrinking only lowers the reported size
        stored.status.get_or_insert_with(Default::default).total_ip_count = Some(desired_ip_number as i64);
        self.pools.update_pool(stored);
        Ok(())
    }
}
