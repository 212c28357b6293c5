use serde::{Deserialize, Serialize};

#[cfg(feature = "schema")]
use schemars::JsonSchema;

use crate::TimeoutMs;

/// Declarative retry settings for provider calls.
///
/// The delay before retry `attempt` (1-based) is `first_ms * factor^(attempt - 1)`,
/// capped at `max_delay_ms` when set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schema", derive(JsonSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct RetryStrategy {
    /// Retries after the initial call. `0` disables retrying.
    pub max_retries: u32,
    pub first_ms: TimeoutMs,
    pub factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<TimeoutMs>,
}

impl RetryStrategy {
    /// A strategy that never retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Uncapped delay for the given 1-based retry attempt.
    pub fn interval_ms(&self, attempt: u32) -> TimeoutMs {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.first_ms as f64 * self.factor.powi(exp);
        if delay.is_finite() && delay < TimeoutMs::MAX as f64 {
            delay.max(0.0) as TimeoutMs
        } else {
            TimeoutMs::MAX
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_ms: 1_000,
            factor: 2.0,
            max_delay_ms: Some(30_000),
        }
    }
}
