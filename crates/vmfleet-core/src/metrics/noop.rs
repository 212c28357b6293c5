use crate::metrics::backend::{CacheLookup, CallOutcome, MetricsBackend};

/// Metrics backend that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsBackend for NoOpMetrics {
    #[inline(always)]
    fn record_provider_call(&self, _: &str, _: CallOutcome, _: u64) {}

    #[inline(always)]
    fn record_retry(&self, _: &str) {}

    #[inline(always)]
    fn record_capacity_rejected(&self, _: &str) {}

    #[inline(always)]
    fn record_cache_lookup(&self, _: &str, _: CacheLookup) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_metrics_is_zero_size() {
        assert_eq!(std::mem::size_of::<NoOpMetrics>(), 0);
    }
}
