use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::info;

use vmfleet_model::{FleetConfig, ImageDescriptor};

use super::{FleetController, InstanceListener, Inventory, slots::Slots};
use crate::{
    cache::{TaskCache, TaskLoader},
    connector::{ConnectorError, ConnectorHandle, OP_FETCH},
    error::FleetError,
    map::to_retry_policy,
    metrics::{CallOutcome, MetricsHandle, noop_metrics},
    retry::RetryPolicy,
};

/// Loads the provider inventory of one image.
pub(crate) struct InventoryLoader {
    connector: ConnectorHandle,
    image: Arc<ImageDescriptor>,
    metrics: MetricsHandle,
}

#[async_trait]
impl TaskLoader<String, Inventory> for InventoryLoader {
    type Error = ConnectorError;

    async fn load(&self, _source_id: String) -> Result<Inventory, ConnectorError> {
        let started = Instant::now();
        let res = self.connector.fetch_instances(&self.image).await;

        let outcome = if res.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        self.metrics
            .record_provider_call(OP_FETCH, outcome, started.elapsed().as_millis() as u64);
        res.map(Arc::new)
    }
}

/// Builder for [`FleetController`].
///
/// ```ignore
/// let fleet = FleetController::builder(image, connector)
///     .with_config(cfg)
///     .with_metrics(metrics)
///     .with_listener(Arc::new(LoggingListener))
///     .build()?;
/// ```
pub struct FleetBuilder {
    image: ImageDescriptor,
    connector: ConnectorHandle,
    config: FleetConfig,
    metrics: MetricsHandle,
    retry: Option<RetryPolicy<ConnectorError>>,
    listeners: Vec<Arc<dyn InstanceListener>>,
}

impl FleetBuilder {
    pub(crate) fn new(image: ImageDescriptor, connector: ConnectorHandle) -> Self {
        Self {
            image,
            connector,
            config: FleetConfig::default(),
            metrics: noop_metrics(),
            retry: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: FleetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the retry policy derived from `FleetConfig::retry`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy<ConnectorError>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn InstanceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Validate the descriptor and assemble the controller.
    ///
    /// Every descriptor problem is reported at once; nothing is allocated on failure.
    pub fn build(self) -> Result<FleetController, FleetError> {
        self.image.validate()?;

        let image = Arc::new(self.image);
        let source_hash = image.source_hash();
        let retry = self
            .retry
            .unwrap_or_else(|| to_retry_policy(&self.config.retry));

        let loader = InventoryLoader {
            connector: Arc::clone(&self.connector),
            image: Arc::clone(&image),
            metrics: Arc::clone(&self.metrics),
        };
        let inventory = TaskCache::new(
            format!("inventory:{}", image.source_id),
            loader,
            Duration::from_millis(self.config.cache_ttl_ms),
        )
        .with_metrics(Arc::clone(&self.metrics));

        info!(
            image = %image.source_id,
            deploy = image.target.kind(),
            max_instances = image.max_instances,
            reuse_stopped = image.reuse_stopped,
            connector = self.connector.name(),
            "fleet controller ready"
        );

        Ok(FleetController {
            image,
            source_hash,
            config: self.config,
            connector: self.connector,
            retry,
            inventory,
            slots: Mutex::new(Slots::new()),
            listeners: Arc::new(RwLock::new(self.listeners)),
            metrics: self.metrics,
        })
    }
}
