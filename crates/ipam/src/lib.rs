//! Spiderpool IPAM engine
//!
//! Allocates pod addresses out of `SpiderIPPool` objects and releases them,
//! recording ownership in `SpiderEndpoint` objects. The engine talks to the
//! cluster only through the traits in [`manager`].
//!
//! ```ignore
//! let ipam = Ipam::new(IpamConfig::from_env()?, managers, metrics)?;
//! let _limiter = ipam.start(shutdown.clone())?;
//! let response = ipam.allocate(&token, &add_args).await?;
//! ```

pub mod annotations;
pub mod cidr;
pub mod config;
pub mod convert;
pub mod error;
pub mod failure_cache;
pub mod kube_lookup;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod resolver;
pub mod selector;
pub mod types;
pub mod workload;

mod allocate;
mod ipam;
mod release;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use config::{IpamConfig, LimiterConfig};
pub use error::{IpamError, ManagerError};
pub use ipam::{Ipam, Managers};
pub use metrics::IpamMetrics;
pub use types::*;
