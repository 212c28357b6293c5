//! Fleet controller for cloud build-agent instances.
//!
//! Three layers, leaves first:
//! - [`retry`]: retry-with-backoff around any fallible async call;
//! - [`cache`]: request-coalescing cache for provider queries;
//! - [`fleet`]: per-image slot allocation and instance lifecycle.
//!
//! Provider access goes through the [`connector::ApiConnector`] seam.
pub mod cache;
pub mod connector;
pub mod error;
pub mod fleet;
pub mod map;
pub mod metrics;
pub mod retry;

pub use error::FleetError;
pub use fleet::{
    FleetBuilder, FleetController, Instance, InstanceHandle, InstanceListener, Inventory,
    PendingInstance,
};

pub mod prelude {
    pub use crate::cache::{CacheError, TaskCache, TaskLoader};
    pub use crate::connector::{ApiConnector, ConnectorError, ConnectorHandle};
    pub use crate::error::FleetError;
    pub use crate::fleet::{
        FleetBuilder, FleetController, InstanceHandle, InstanceListener, PendingInstance,
    };
    pub use crate::metrics::{MetricsBackend, MetricsHandle};
    pub use crate::retry::{RetryPolicy, Sleeper};
}
