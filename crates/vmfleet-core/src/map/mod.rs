//! Conversions from declarative model settings into runtime policies.
mod retry;

pub use retry::to_retry_policy;
