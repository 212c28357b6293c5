use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    SourceHash,
    error::{ModelError, ModelResult},
};

/// Lifecycle status of one instance slot.
///
/// ```text
/// Idle -> Starting -> Running -> Stopping -> Stopped | Terminated
///            |                      ^
///            +------> Error --------+
/// Stopped -> Starting   (reuse)
/// ```
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    /// Slot exists but nothing has been requested yet.
    #[default]
    Idle,
    /// Claimed; the provider create/start call is in flight.
    Starting,
    Running,
    /// The provider stop/delete call is in flight.
    Stopping,
    /// Deallocated but kept for reuse.
    Stopped,
    /// Deleted at the provider; the slot leaves the fleet.
    Terminated,
    /// Provisioning or teardown failed. The slot keeps its capacity until cleaned up.
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Idle => "idle",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Error => "error",
        }
    }

    /// Whether a slot in this status counts against `max_instances`.
    pub fn consumes_capacity(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting
                | InstanceStatus::Running
                | InstanceStatus::Stopping
                | InstanceStatus::Error
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Terminated)
                | (Stopping, Error)
                | (Stopped, Starting)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(InstanceStatus::Idle),
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            "terminated" => Ok(InstanceStatus::Terminated),
            "error" | "failed" => Ok(InstanceStatus::Error),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Power/provisioning state reported by the cloud provider for one instance.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderState {
    Provisioning,
    Running,
    Stopping,
    /// Stopped and deallocated.
    Stopped,
    Deleting,
    Failed,
    #[default]
    Unknown,
}

impl ProviderState {
    /// Status a slot adopted from the provider inventory starts in.
    ///
    /// Anything the controller cannot classify is treated as `Error` so it keeps capacity.
    pub fn to_instance_status(&self) -> InstanceStatus {
        match self {
            ProviderState::Provisioning => InstanceStatus::Starting,
            ProviderState::Running => InstanceStatus::Running,
            ProviderState::Stopping | ProviderState::Deleting => InstanceStatus::Stopping,
            ProviderState::Stopped => InstanceStatus::Stopped,
            ProviderState::Failed | ProviderState::Unknown => InstanceStatus::Error,
        }
    }
}

impl FromStr for ProviderState {
    type Err = ModelError;
    fn from_str(s: &str) -> ModelResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provisioning" | "creating" | "starting" => Ok(ProviderState::Provisioning),
            "running" => Ok(ProviderState::Running),
            "stopping" | "deallocating" => Ok(ProviderState::Stopping),
            "stopped" | "deallocated" => Ok(ProviderState::Stopped),
            "deleting" => Ok(ProviderState::Deleting),
            "failed" => Ok(ProviderState::Failed),
            "unknown" | "" => Ok(ProviderState::Unknown),
            other => Err(ModelError::UnknownProviderState(other.to_string())),
        }
    }
}

/// One entry of a provider inventory listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInstance {
    pub state: ProviderState,
    /// Value of the source-hash tag, when the instance carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<SourceHash>,
}

impl ProviderInstance {
    pub fn new(state: ProviderState) -> Self {
        Self {
            state,
            source_hash: None,
        }
    }

    pub fn with_source_hash(mut self, hash: SourceHash) -> Self {
        self.source_hash = Some(hash);
        self
    }
}
