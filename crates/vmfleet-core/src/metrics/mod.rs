//! Metrics abstraction for fleet operations.
//!
//! Backends (prometheus, statsd, ...) implement [`MetricsBackend`] and are handed to the
//! controller builder; the default is [`NoOpMetrics`].
mod backend;
pub use backend::{CacheLookup, CallOutcome, MetricsBackend, MetricsHandle};

mod noop;
pub use noop::NoOpMetrics;

use std::sync::Arc;

/// Create a no-op metrics handle.
#[inline]
pub fn noop_metrics() -> MetricsHandle {
    Arc::new(NoOpMetrics)
}
