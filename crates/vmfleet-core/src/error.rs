use thiserror::Error;

use vmfleet_model::{InstanceStatus, ValidationErrors};

use crate::{cache::CacheError, connector::ConnectorError};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("image {image} is at capacity ({max_instances} instances)")]
    CapacityExceeded { image: String, max_instances: u32 },

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("provider call for {instance} failed: {source}")]
    Provider {
        instance: String,
        #[source]
        source: ConnectorError,
    },

    #[error("provider inventory unavailable: {0}")]
    Cache(#[from] CacheError<ConnectorError>),

    #[error("instance {instance} cannot be changed while {status}")]
    InvalidState {
        instance: String,
        status: InstanceStatus,
    },

    #[error("instance {0} does not belong to this fleet")]
    UnknownInstance(String),

    #[error("provisioning of {instance} was cancelled")]
    Cancelled { instance: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, FleetError::CapacityExceeded { .. })
    }

    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::CapacityExceeded { .. } => "capacity_exceeded",
            FleetError::Validation(_) => "validation",
            FleetError::Provider { .. } => "provider",
            FleetError::Cache(_) => "cache",
            FleetError::InvalidState { .. } => "invalid_state",
            FleetError::UnknownInstance(_) => "unknown_instance",
            FleetError::Cancelled { .. } => "cancelled",
            FleetError::Internal(_) => "internal",
        }
    }
}
