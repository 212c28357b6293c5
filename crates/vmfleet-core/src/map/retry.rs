use vmfleet_model::RetryStrategy;

use crate::{connector::ConnectorError, retry::RetryPolicy};

/// Retry policy for state-changing provider calls.
///
/// Only transient and throttling errors are retried; delays follow
/// `first_ms * factor^(attempt-1)`, capped by `max_delay_ms`.
pub fn to_retry_policy(s: &RetryStrategy) -> RetryPolicy<ConnectorError> {
    let strategy = s.clone();
    RetryPolicy::new()
        .max_retries(s.max_retries)
        .retry_if(ConnectorError::is_transient)
        .interval(move |attempt| strategy.interval_ms(attempt))
        .max_delay_ms(s.max_delay_ms)
}
