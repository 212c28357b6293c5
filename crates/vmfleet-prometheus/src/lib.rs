//! Prometheus backend for the vmfleet metrics seam.
//!
//! [`PrometheusMetrics`] implements [`vmfleet_core::metrics::MetricsBackend`] and is
//! handed to the controller builder:
//!
//! ```rust
//! use std::sync::Arc;
//! use vmfleet_prometheus::PrometheusMetrics;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::new()?;
//! let handle: vmfleet_core::metrics::MetricsHandle = Arc::new(metrics.clone());
//! // FleetController::builder(image, connector).with_metrics(handle)...
//! # let _ = handle;
//! let body = metrics.encode_text()?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```
//!
//! ## Metrics
//! - `vmfleet_provider_calls_total{operation, outcome}`: counter
//! - `vmfleet_provider_call_duration_seconds{operation}`: histogram, retries included
//! - `vmfleet_provider_retries_total{operation}`: counter
//! - `vmfleet_capacity_rejections_total{image}`: counter
//! - `vmfleet_cache_lookups_total{cache, result}`: counter
//!
//! No HTTP server is included; serve [`PrometheusMetrics::encode_text`] from
//! whatever the host application already runs.
mod backend;
pub use backend::PrometheusMetrics;

pub use prometheus::{Encoder, Registry, TextEncoder};
