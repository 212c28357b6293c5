//! Seam between the fleet controller and a concrete cloud API.
//!
//! The controller never inspects provider payloads: it hands over a prepared
//! [`ProvisionSpec`] and reacts only to the [`ConnectorError`] classification.
use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use vmfleet_model::{ImageDescriptor, ProviderInstance, ProvisionSpec};

use crate::fleet::Instance;

#[cfg(any(test, feature = "mock"))]
mod mock;
#[cfg(any(test, feature = "mock"))]
pub use mock::{MockConnector, MockOp};

pub const OP_CREATE: &str = "create";
pub const OP_START: &str = "start";
pub const OP_STOP: &str = "stop";
pub const OP_DELETE: &str = "delete";
pub const OP_FETCH: &str = "fetch_instances";

/// Failure reported by an [`ApiConnector`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Network hiccup, 5xx, timeout.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The provider rate-limited the request.
    #[error("throttled by provider{}", .retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    Throttled { retry_after_ms: Option<u64> },

    #[error("resource not found: {0}")]
    NotFound(String),

    /// Request understood and refused (quota, bad template, auth).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ConnectorError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectorError::Transient(_) | ConnectorError::Throttled { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::Transient(_) => "transient",
            ConnectorError::Throttled { .. } => "throttled",
            ConnectorError::NotFound(_) => "not_found",
            ConnectorError::Rejected(_) => "rejected",
        }
    }
}

/// Provider operations the controller relies on.
///
/// Implementations must be safe to call concurrently for different instances;
/// the controller never issues two state-changing calls for one instance at once.
#[async_trait]
pub trait ApiConnector: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Create and boot a brand new instance.
    async fn create_instance(
        &self,
        instance: &Instance,
        spec: &ProvisionSpec,
    ) -> Result<(), ConnectorError>;

    /// Boot an existing, stopped instance.
    async fn start_instance(
        &self,
        instance: &Instance,
        spec: &ProvisionSpec,
    ) -> Result<(), ConnectorError>;

    /// Stop and deallocate, keeping the instance for reuse.
    async fn stop_instance(&self, instance: &Instance) -> Result<(), ConnectorError>;

    /// Delete the instance and everything created for it.
    async fn delete_instance(&self, instance: &Instance) -> Result<(), ConnectorError>;

    /// List every provider instance belonging to `image`, keyed by instance name.
    async fn fetch_instances(
        &self,
        image: &ImageDescriptor,
    ) -> Result<BTreeMap<String, ProviderInstance>, ConnectorError>;
}

/// Shared handle to a connector.
pub type ConnectorHandle = Arc<dyn ApiConnector>;
