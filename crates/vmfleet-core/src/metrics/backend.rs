use std::sync::Arc;

/// Outcome of one provider call, after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
        }
    }
}

/// How a task-cache lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Fresh cached value returned.
    Hit,
    /// Nothing usable cached.
    Miss,
    /// Caller joined a fetch that was already in flight.
    Coalesced,
}

impl CacheLookup {
    #[inline]
    pub fn as_label(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Coalesced => "coalesced",
        }
    }
}

/// Metrics sink for fleet operations.
///
/// Implementations are injected when building a [`crate::FleetController`].
/// All label values passed in are low-cardinality (operation names, image ids, cache names).
pub trait MetricsBackend: Send + Sync + 'static {
    /// Record a finished provider call.
    ///
    /// # Arguments
    /// - `operation`: one of the `OP_*` constants in [`crate::connector`]
    /// - `outcome`: final outcome after all retries
    /// - `duration_ms`: wall time including retry sleeps
    fn record_provider_call(&self, operation: &str, outcome: CallOutcome, duration_ms: u64);

    /// Record one retry of a provider call.
    fn record_retry(&self, operation: &str);

    /// Record a `start_new_instance` rejected because the image is at capacity.
    fn record_capacity_rejected(&self, image: &str);

    /// Record a task-cache lookup.
    fn record_cache_lookup(&self, cache: &str, lookup: CacheLookup);
}

/// Shared handle to a metrics backend.
pub type MetricsHandle = Arc<dyn MetricsBackend>;
