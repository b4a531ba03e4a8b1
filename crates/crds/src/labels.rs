//! Well-known labels and annotations
//!
//! Subnet auto-pools carry these labels so the IPAM engine can find the pool
//! created for a given (subnet, workload, interface, version).

/// Subnet the auto-pool was carved from
pub const LABEL_OWNER_SPIDER_SUBNET: &str = "ipam.spidernet.io/owner-spider-subnet";

/// IP version of the auto-pool ("IPv4" or "IPv6")
pub const LABEL_IPPOOL_VERSION: &str = "ipam.spidernet.io/ippool-version";

/// Interface the auto-pool serves
pub const LABEL_IPPOOL_INTERFACE: &str = "ipam.spidernet.io/interface";

/// UID of the workload owning the auto-pool
pub const LABEL_OWNER_APPLICATION_UID: &str = "ipam.spidernet.io/owner-application-uid";

/// Whether the auto-pool is reclaimed together with its workload
pub const LABEL_IPPOOL_RECLAIM: &str = "ipam.spidernet.io/ippool-reclaim";

/// Label value for IPv4 pools
pub const IPV4_LABEL_VALUE: &str = "IPv4";

/// Label value for IPv6 pools
pub const IPV6_LABEL_VALUE: &str = "IPv6";
