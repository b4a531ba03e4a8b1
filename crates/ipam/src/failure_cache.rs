//! Failure cache
//!
//! Addresses obtained by an allocation call that failed as a whole, keyed by
//! the pod UID, so the retried call reuses them instead of drawing again.
//!
//! Entry lifetime:
//! - stored (overwriting) when an allocation call fails after drawing;
//! - removed when an allocation for the UID succeeds;
//! - removed when the UID is released, whatever the release outcome.
//!
//! The cache is bounded by the number of live pods. The lock only guards map
//! operations; no I/O happens under it.

use crate::types::AllocationResult;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Per-UID cache of partially successful allocation results
#[derive(Debug, Clone, Default)]
pub struct FailureCache {
    entries: Arc<RwLock<HashMap<String, Vec<AllocationResult>>>>,
}

impl FailureCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Results stored for `uid`, if any
    pub fn get(&self, uid: &str) -> Option<Vec<AllocationResult>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(uid).cloned()
    }

    /// The stored result of `uid` for `nic` drawn from one of `pools`.
    ///
    /// `pools` is searched in order, so the pool a retry would have tried
    /// first wins.
    pub fn find(&self, uid: &str, pools: &[String], nic: &str) -> Option<AllocationResult> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let results = entries.get(uid)?;
        pools.iter().find_map(|pool| {
            results
                .iter()
                .find(|r| r.ip.nic == nic && &r.ip.ip_pool == pool)
                .cloned()
        })
    }

    /// Replaces the results stored for `uid`.
    ///
    /// Storing nothing leaves the cache untouched.
    pub fn store(&self, uid: &str, results: Vec<AllocationResult>) {
        if results.is_empty() {
            return;
        }
        debug!("Caching {} allocation results of pod UID {}", results.len(), uid);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(uid.to_string(), results);
    }

    /// Forgets `uid`.
    pub fn clear(&self, uid: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.remove(uid).is_some() {
            debug!("Cleared cached allocation results of pod UID {}", uid);
        }
    }

    /// Number of UIDs with cached results
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IPConfig, IpVersion};

    fn result(nic: &str, pool: &str, address: &str) -> AllocationResult {
        AllocationResult {
            ip: IPConfig {
                address: address.to_string(),
                gateway: None,
                ip_pool: pool.to_string(),
                nic: nic.to_string(),
                version: IpVersion::V4,
                vlan: 0,
            },
            routes: Vec::new(),
            clean_gateway: false,
        }
    }

    #[test]
    fn test_find_by_nic_and_pool_order() {
        let cache = FailureCache::new();
        cache.store(
            "uid-1",
            vec![result("eth0", "pool-b", "10.0.1.2/24"), result("net1", "pool-a", "10.0.0.9/24")],
        );

        let pools = vec!["pool-a".to_string(), "pool-b".to_string()];
        let found = cache.find("uid-1", &pools, "eth0").unwrap();
        assert_eq!(found.ip.address, "10.0.1.2/24");
        assert_eq!(cache.find("uid-1", &pools, "net1").unwrap().ip.ip_pool, "pool-a");
        assert!(cache.find("uid-1", &pools, "net2").is_none());
        assert!(cache.find("uid-2", &pools, "eth0").is_none());
    }

    #[test]
    fn test_store_overwrites_and_clear_removes() {
        let cache = FailureCache::new();
        cache.store("uid-1", vec![result("eth0", "pool-a", "10.0.0.2/24")]);
        cache.store("uid-1", vec![result("eth0", "pool-a", "10.0.0.3/24")]);
        assert_eq!(cache.get("uid-1").unwrap().len(), 1);
        assert_eq!(cache.get("uid-1").unwrap()[0].ip.address, "10.0.0.3/24");

        cache.store("uid-1", Vec::new());
        assert_eq!(cache.len(), 1);

        cache.clear("uid-1");
        assert!(cache.is_empty());
        cache.clear("uid-1");
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = FailureCache::new();
        let other = cache.clone();
        other.store("uid-1", vec![result("eth0", "pool-a", "10.0.0.2/24")]);
        assert!(cache.get("uid-1").is_some());
    }
}
