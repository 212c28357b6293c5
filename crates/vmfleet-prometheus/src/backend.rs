use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    proto::MetricFamily,
};

use vmfleet_core::metrics::{CacheLookup, CallOutcome, MetricsBackend};

const NAMESPACE: &str = "vmfleet";

/// Prometheus metrics backend.
///
/// Cloning is cheap; clones share the same collectors and registry.
///
/// ## Label cardinality
/// - `operation`: `create`, `start`, `stop`, `delete`, `fetch_instances`
/// - `outcome`: `success`, `failure`
/// - `image`: one value per configured image descriptor
/// - `cache` / `result`: one cache per fleet; `hit`, `miss`, `coalesced`
#[derive(Clone)]
pub struct PrometheusMetrics {
    provider_calls: CounterVec,
    provider_call_duration: HistogramVec,
    provider_retries: CounterVec,
    capacity_rejections: CounterVec,
    cache_lookups: CounterVec,
    registry: Arc<Registry>,
}

impl PrometheusMetrics {
    /// Register every collector in `registry`.
    pub fn new_with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let provider_calls = CounterVec::new(
            Opts::new("provider_calls_total", "Provider calls by final outcome")
                .namespace(NAMESPACE),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(provider_calls.clone()))?;

        // Provider calls take seconds to minutes (VM creation), retries included.
        let provider_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "provider_call_duration_seconds",
                "Provider call duration including retries",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["operation"],
        )?;
        registry.register(Box::new(provider_call_duration.clone()))?;

        let provider_retries = CounterVec::new(
            Opts::new("provider_retries_total", "Retried provider calls").namespace(NAMESPACE),
            &["operation"],
        )?;
        registry.register(Box::new(provider_retries.clone()))?;

        let capacity_rejections = CounterVec::new(
            Opts::new(
                "capacity_rejections_total",
                "Start requests rejected because the image was at capacity",
            )
            .namespace(NAMESPACE),
            &["image"],
        )?;
        registry.register(Box::new(capacity_rejections.clone()))?;

        let cache_lookups = CounterVec::new(
            Opts::new("cache_lookups_total", "Task cache lookups by result").namespace(NAMESPACE),
            &["cache", "result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        Ok(Self {
            provider_calls,
            provider_call_duration,
            provider_retries,
            capacity_rejections,
            cache_lookups,
            registry,
        })
    }

    /// Backend with its own fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::new_with_registry(Arc::new(Registry::new()))
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Everything in the text exposition format, ready to serve on `/metrics`.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Underlying registry, for registering application metrics alongside.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl MetricsBackend for PrometheusMetrics {
    fn record_provider_call(&self, operation: &str, outcome: CallOutcome, duration_ms: u64) {
        self.provider_calls
            .with_label_values(&[operation, outcome.as_label()])
            .inc();
        self.provider_call_duration
            .with_label_values(&[operation])
            .observe(duration_ms as f64 / 1000.0);
    }

    fn record_retry(&self, operation: &str) {
        self.provider_retries.with_label_values(&[operation]).inc();
    }

    fn record_capacity_rejected(&self, image: &str) {
        self.capacity_rejections.with_label_values(&[image]).inc();
    }

    fn record_cache_lookup(&self, cache: &str, lookup: CacheLookup) {
        self.cache_lookups
            .with_label_values(&[cache, lookup.as_label()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|f| f.name() == name)
            .unwrap_or_else(|| panic!("metric {name} not found"))
    }

    #[test]
    fn provider_calls_feed_counter_and_histogram() {
        let metrics = PrometheusMetrics::new().unwrap();

        metrics.record_provider_call("create", CallOutcome::Success, 42_000);
        metrics.record_provider_call("create", CallOutcome::Failure, 1_500);
        metrics.record_provider_call("delete", CallOutcome::Success, 9_000);

        let families = metrics.gather();
        assert_eq!(
            family(&families, "vmfleet_provider_calls_total").get_metric().len(),
            3
        );
        assert_eq!(
            family(&families, "vmfleet_provider_call_duration_seconds")
                .get_metric()
                .len(),
            2
        );
    }

    #[test]
    fn retries_rejections_and_lookups_are_counted() {
        let metrics = PrometheusMetrics::new().unwrap();

        metrics.record_retry("start");
        metrics.record_retry("start");
        metrics.record_capacity_rejected("linux-agents");
        metrics.record_cache_lookup("inventory:linux-agents", CacheLookup::Hit);
        metrics.record_cache_lookup("inventory:linux-agents", CacheLookup::Coalesced);

        let families = metrics.gather();
        assert_eq!(
            family(&families, "vmfleet_provider_retries_total")
                .get_metric()
                .len(),
            1
        );
        assert_eq!(
            family(&families, "vmfleet_capacity_rejections_total")
                .get_metric()
                .len(),
            1
        );
        assert_eq!(
            family(&families, "vmfleet_cache_lookups_total").get_metric().len(),
            2
        );
    }

    #[test]
    fn text_exposition_contains_labels() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.record_capacity_rejected("win-agents");
        metrics.record_retry("stop");
        metrics.record_retry("stop");

        let text = metrics.encode_text().unwrap();
        assert!(text.contains(r#"vmfleet_capacity_rejections_total{image="win-agents"} 1"#));
        assert!(text.contains(r#"vmfleet_provider_retries_total{operation="stop"} 2"#));
    }

    #[test]
    fn registering_twice_in_one_registry_fails() {
        let registry = Arc::new(Registry::new());
        PrometheusMetrics::new_with_registry(registry.clone()).unwrap();

        assert!(PrometheusMetrics::new_with_registry(registry).is_err());
    }
}
