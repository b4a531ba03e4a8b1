//! IPAM configuration.
//!
//! Loaded from the agent's YAML config file. The value is handed to the
//! engine and resolver constructors; nothing reads it from a global.

use crate::error::IpamError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "IPAM_CONFIG_PATH";

/// Cluster-wide IPAM settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpamConfig {
    /// Hand out IPv4 addresses
    #[serde(rename = "enableIPv4")]
    pub enable_ipv4: bool,

    /// Hand out IPv6 addresses
    #[serde(rename = "enableIPv6")]
    pub enable_ipv6: bool,

    /// Keep StatefulSet replica addresses across pod restarts
    pub enable_stateful_set: bool,

    /// Resolve pools through subnet auto-pools
    pub enable_spider_subnet: bool,

    /// Cluster default IPv4 pools
    #[serde(rename = "clusterDefaultIPv4IPPool")]
    pub cluster_default_ipv4_ippool: Vec<String>,

    /// Cluster default IPv6 pools
    #[serde(rename = "clusterDefaultIPv6IPPool")]
    pub cluster_default_ipv6_ippool: Vec<String>,

    /// Cluster default IPv4 subnets for auto-pools
    #[serde(rename = "clusterDefaultIPv4Subnet")]
    pub cluster_default_ipv4_subnet: Vec<String>,

    /// Cluster default IPv6 subnets for auto-pools
    #[serde(rename = "clusterDefaultIPv6Subnet")]
    pub cluster_default_ipv6_subnet: Vec<String>,

    /// Extra addresses an auto-pool keeps above the replica count
    #[serde(rename = "clusterSubnetDefaultFlexibleIPNumber")]
    pub cluster_subnet_default_flexible_ip_number: usize,

    /// Reclaim auto-pools together with their workload unless annotated
    pub enable_auto_pool_reclaim: bool,

    /// Attempts of the auto-pool wait loop
    pub operation_retries: usize,

    /// Delay between attempts of the auto-pool wait loop
    pub operation_gap_millis: u64,

    /// Admission limiter settings
    pub limiter: LimiterConfig,
}

/// Admission limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterConfig {
    /// Requests allowed to wait at once
    pub max_queue_size: usize,

    /// Longest time a request may wait for its tickets
    pub max_wait_seconds: u64,

    /// Concurrent operations allowed per pool
    pub max_concurrent_per_pool: usize,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: false,
            enable_stateful_set: true,
            enable_spider_subnet: false,
            cluster_default_ipv4_ippool: Vec::new(),
            cluster_default_ipv6_ippool: Vec::new(),
            cluster_default_ipv4_subnet: Vec::new(),
            cluster_default_ipv6_subnet: Vec::new(),
            cluster_subnet_default_flexible_ip_number: 1,
            enable_auto_pool_reclaim: true,
            operation_retries: 30,
            operation_gap_millis: 1000,
            limiter: LimiterConfig::default(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_wait_seconds: 15,
            max_concurrent_per_pool: 1,
        }
    }
}

impl LimiterConfig {
    /// Longest time a request may wait for its tickets
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }
}

impl IpamConfig {
    /// Parses a YAML document and validates it.
    pub fn from_yaml(yaml: &str) -> Result<Self, IpamError> {
        let config: IpamConfig = serde_yaml::from_str(yaml)
            .map_err(|e| IpamError::WrongInput(format!("invalid IPAM config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the YAML config file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, IpamError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            IpamError::WrongInput(format!("failed to read IPAM config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Loads the file named by `IPAM_CONFIG_PATH`, or the defaults when unset.
    pub fn from_env() -> Result<Self, IpamError> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                info!("Loading IPAM config from {}", path);
                Self::from_file(path)
            }
            Err(_) => {
                info!("{} not set, using default IPAM config", CONFIG_PATH_ENV);
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), IpamError> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err(IpamError::WrongInput(
                "at least one of IPv4 and IPv6 must be enabled".to_string(),
            ));
        }
        if self.limiter.max_queue_size == 0 {
            return Err(IpamError::WrongInput(
                "limiter maxQueueSize must be positive".to_string(),
            ));
        }
        if self.limiter.max_concurrent_per_pool == 0 {
            return Err(IpamError::WrongInput(
                "limiter maxConcurrentPerPool must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay between attempts of the auto-pool wait loop
    pub fn operation_gap(&self) -> Duration {
        Duration::from_millis(self.operation_gap_millis)
    }
}
