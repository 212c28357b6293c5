use serde::{Deserialize, Serialize};

#[cfg(feature = "schema")]
use schemars::JsonSchema;

use crate::{RetryStrategy, TimeoutMs, UserData};

/// Controller-wide settings shared by every fleet of one cloud profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
    /// Cloud profile identifier of the orchestration server, written into user data and tags.
    pub profile_id: String,
    /// Retry settings for state-changing provider calls.
    pub retry: RetryStrategy,
    /// How long a provider inventory listing stays fresh.
    pub cache_ttl_ms: TimeoutMs,
    /// Extra user data given to every instance. Per-start user data wins on conflicts.
    #[serde(skip_serializing_if = "UserData::is_empty")]
    pub user_data: UserData,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            profile_id: "default".to_string(),
            retry: RetryStrategy::default(),
            cache_ttl_ms: 5_000,
            user_data: UserData::new(),
        }
    }
}
