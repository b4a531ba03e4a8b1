//! IPAM metrics.

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

/// Counters and timings of allocation, release and admission.
#[derive(Debug, Clone)]
pub struct IpamMetrics {
    /// Allocation calls
    pub allocation_total: IntCounter,
    /// Failed allocation calls
    pub allocation_failure_total: IntCounter,
    /// Duration of allocation calls
    pub allocation_duration_seconds: Histogram,
    /// Release calls
    pub release_total: IntCounter,
    /// Failed release calls
    pub release_failure_total: IntCounter,
    /// Duration of release calls
    pub release_duration_seconds: Histogram,
    /// Time spent waiting for admission tickets
    pub limiter_queuing_duration_seconds: Histogram,
    /// Addresses reused from the failure cache instead of drawn again
    pub failure_cache_reused_total: IntCounter,
}

impl IpamMetrics {
    /// Creates the metrics and registers them into `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.allocation_total.clone()))?;
        registry.register(Box::new(metrics.allocation_failure_total.clone()))?;
        registry.register(Box::new(metrics.allocation_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.release_total.clone()))?;
        registry.register(Box::new(metrics.release_failure_total.clone()))?;
        registry.register(Box::new(metrics.release_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.limiter_queuing_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.failure_cache_reused_total.clone()))?;
        Ok(metrics)
    }

    /// Creates the metrics without exposing them anywhere.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(Self {
            allocation_total: IntCounter::new(
                "ipam_allocation_total",
                "Total number of IP allocation calls.",
            )?,
            allocation_failure_total: IntCounter::new(
                "ipam_allocation_failure_total",
                "Total number of failed IP allocation calls.",
            )?,
            allocation_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "ipam_allocation_duration_seconds",
                "Duration of IP allocation calls.",
            ))?,
            release_total: IntCounter::new(
                "ipam_release_total",
                "Total number of IP release calls.",
            )?,
            release_failure_total: IntCounter::new(
                "ipam_release_failure_total",
                "Total number of failed IP release calls.",
            )?,
            release_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "ipam_release_duration_seconds",
                "Duration of IP release calls.",
            ))?,
            limiter_queuing_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "ipam_limiter_queuing_duration_seconds",
                "Time spent waiting for IP pool admission tickets.",
            ))?,
            failure_cache_reused_total: IntCounter::new(
                "ipam_failure_cache_reused_total",
                "Total number of addresses reused from a failed allocation attempt.",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = IpamMetrics::new(&registry).unwrap();
        metrics.allocation_total.inc();
        assert_eq!(registry.gather().len(), 8);
        // Same names cannot be registered twice
        assert!(IpamMetrics::new(&registry).is_err());
    }
}
