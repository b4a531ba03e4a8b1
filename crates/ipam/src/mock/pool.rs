//! Mock pool ledger

use crate::convert::bare_ip;
use crate::error::ManagerError;
use crate::manager::{cancelable, IPPoolManager};
use crate::resolver::pool_version;
use crate::types::{IPConfig, IpAndUid, IpVersion};
use crds::{SpiderIPPool, SpiderIPPoolStatus};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Mock IPPoolManager
///
/// Every pool hands out its free addresses in insertion order and remembers
/// the owner UID of every address it handed out.
#[derive(Debug, Clone, Default)]
pub struct MockIPPoolManager {
    pools: Arc<Mutex<HashMap<String, SpiderIPPool>>>,
    // Addresses in CIDR notation, in hand-out order
    free: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
    // pool -> bare IP -> (CIDR address, owner UID)
    allocated: Arc<Mutex<HashMap<String, BTreeMap<String, (String, String)>>>>,
    broken: Arc<Mutex<HashSet<String>>>,
    // Draws never answer until canceled
    hung: Arc<AtomicBool>,
    allocate_calls: Arc<AtomicUsize>,
    release_calls: Arc<AtomicUsize>,
    update_calls: Arc<AtomicUsize>,
}

impl MockIPPoolManager {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pool with its free addresses ("10.6.0.5/16")
    pub fn add_pool(&self, mut pool: SpiderIPPool, addresses: &[&str]) {
        let name = pool.metadata.name.clone().unwrap_or_default();
        pool.status = Some(SpiderIPPoolStatus {
            total_ip_count: Some(addresses.len() as i64),
            allocated_ip_count: Some(0),
            ..Default::default()
        });
        self.pools.lock().unwrap().insert(name.clone(), pool);
        self.free
            .lock()
            .unwrap()
            .insert(name, addresses.iter().map(|a| a.to_string()).collect());
    }

    /// Replace the stored pool object, keeping its addresses
    pub fn update_pool(&self, pool: SpiderIPPool) {
        let name = pool.metadata.name.clone().unwrap_or_default();
        self.pools.lock().unwrap().insert(name, pool);
    }

    /// Stored pool object
    pub fn pool(&self, name: &str) -> Option<SpiderIPPool> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Make every draw from `pool` fail with an API error
    pub fn break_pool(&self, pool: &str) {
        self.broken.lock().unwrap().insert(pool.to_string());
    }

    /// Undo [`MockIPPoolManager::break_pool`]
    pub fn repair_pool(&self, pool: &str) {
        self.broken.lock().unwrap().remove(pool);
    }

    /// Make every draw wait until its caller cancels it
    pub fn hang_allocations(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    /// Give `pool` more free addresses
    pub fn add_free(&self, pool: &str, addresses: &[&str]) {
        let mut free = self.free.lock().unwrap();
        let queue = free.entry(pool.to_string()).or_default();
        queue.extend(addresses.iter().map(|a| a.to_string()));
    }

    /// Free addresses left in `pool`
    pub fn free_count(&self, pool: &str) -> usize {
        self.free.lock().unwrap().get(pool).map(VecDeque::len).unwrap_or_default()
    }

    /// Bare IP -> owner UID of every address handed out by `pool`
    pub fn allocated(&self, pool: &str) -> BTreeMap<String, String> {
        self.allocated
            .lock()
            .unwrap()
            .get(pool)
            .map(|ips| ips.iter().map(|(ip, (_, uid))| (ip.clone(), uid.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of `allocate_ip` calls
    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    /// Number of `release_ip` calls
    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Number of `update_allocated_ips` calls
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of calls that mutate a ledger
    pub fn mutation_calls(&self) -> usize {
        self.allocate_calls() + self.release_calls() + self.update_calls()
    }

    fn set_allocated_count(&self, pool: &str, count: usize) {
        if let Some(object) = self.pools.lock().unwrap().get_mut(pool) {
            object.status.get_or_insert_with(Default::default).allocated_ip_count = Some(count as i64);
        }
    }
}

#[async_trait::async_trait]
impl IPPoolManager for MockIPPoolManager {
    async fn get_ippool_by_name(
        &self,
        _token: &CancellationToken,
        name: &str,
    ) -> Result<SpiderIPPool, ManagerError> {
        self.pool(name)
            .ok_or_else(|| ManagerError::NotFound(format!("SpiderIPPool {}", name)))
    }

    async fn list_ippools(
        &self,
        _token: &CancellationToken,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<SpiderIPPool>, ManagerError> {
        let pools = self.pools.lock().unwrap();
        let mut matching: Vec<SpiderIPPool> = pools
            .values()
            .filter(|pool| {
                let pool_labels = pool.metadata.labels.clone().unwrap_or_default();
                labels.iter().all(|(k, v)| pool_labels.get(k) == Some(v))
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(matching)
    }

    async fn allocate_ip(
        &self,
        token: &CancellationToken,
        pool: &str,
        nic: &str,
        pod: &Pod,
    ) -> Result<IPConfig, ManagerError> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        if self.hung.load(Ordering::SeqCst) {
            let what = format!("allocate IP from SpiderIPPool {}", pool);
            return cancelable(token, &what, std::future::pending::<Result<IPConfig, ManagerError>>()).await;
        }
        let object = self
            .pool(pool)
            .ok_or_else(|| ManagerError::NotFound(format!("SpiderIPPool {}", pool)))?;
        if self.broken.lock().unwrap().contains(pool) {
            return Err(ManagerError::Api(format!("SpiderIPPool {} is unavailable", pool)));
        }

        let address = self
            .free
            .lock()
            .unwrap()
            .get_mut(pool)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ManagerError::Exhausted(pool.to_string()))?;

        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let count = {
            let mut allocated = self.allocated.lock().unwrap();
            let ips = allocated.entry(pool.to_string()).or_default();
            ips.insert(bare_ip(&address).to_string(), (address.clone(), uid));
            ips.len()
        };
        self.set_allocated_count(pool, count);

        Ok(IPConfig {
            address,
            gateway: object.spec.gateway.clone(),
            ip_pool: pool.to_string(),
            nic: nic.to_string(),
            version: pool_version(&object).unwrap_or(IpVersion::V4),
            vlan: object.vlan(),
        })
    }

    async fn release_ip(
        &self,
        _token: &CancellationToken,
        pool: &str,
        ips: &[IpAndUid],
    ) -> Result<(), ManagerError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let mut returned = Vec::new();
        let count = {
            let mut allocated = self.allocated.lock().unwrap();
            let owned = allocated.entry(pool.to_string()).or_default();
            for ip in ips {
                // Addresses taken over by another UID stay where they are
                if owned.get(&ip.ip).is_some_and(|(_, uid)| uid == &ip.uid)
                    && let Some((address, _)) = owned.remove(&ip.ip)
                {
                    returned.push(address);
                }
            }
            owned.len()
        };
        self.free
            .lock()
            .unwrap()
            .entry(pool.to_string())
            .or_default()
            .extend(returned);
        self.set_allocated_count(pool, count);
        Ok(())
    }

    async fn update_allocated_ips(
        &self,
        _token: &CancellationToken,
        pool: &str,
        ips: &[IpAndUid],
    ) -> Result<(), ManagerError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.pool(pool).is_none() {
            return Err(ManagerError::NotFound(format!("SpiderIPPool {}", pool)));
        }
        let mut free = self.free.lock().unwrap();
        let queue = free.entry(pool.to_string()).or_default();
        let count = {
            let mut allocated = self.allocated.lock().unwrap();
            let owned = allocated.entry(pool.to_string()).or_default();
            for ip in ips {
                let address = match queue.iter().position(|a| bare_ip(a) == ip.ip) {
                    Some(i) => queue.remove(i).unwrap_or_default(),
                    None => owned
                        .get(&ip.ip)
                        .map(|(address, _)| address.clone())
                        .unwrap_or_else(|| ip.ip.clone()),
                };
                owned.insert(ip.ip.clone(), (address, ip.uid.clone()));
            }
            owned.len()
        };
        drop(free);
        self.set_allocated_count(pool, count);
        Ok(())
    }
}
