//! Spiderpool CRD Definitions
//!
//! Kubernetes Custom Resource Definitions consumed by the IPAM engine.

pub mod endpoint;
pub mod ip_pool;
pub mod labels;
pub mod selector;

pub use endpoint::*;
pub use ip_pool::*;
pub use selector::*;
