//! Instance fleet controller.
//!
//! A [`FleetController`] owns every slot of one image descriptor. Slot claims and
//! capacity decisions happen under one `std::sync::Mutex` that is never held across
//! `.await`; provider calls run outside it, so one slow instance never blocks the
//! others.
//!
//! ```text
//! start:      claim (lock) ─▶ Starting ─▶ create/start (retry) ─▶ Running | Error
//! terminate:  wait !Starting ─▶ Stopping (lock) ─▶ stop/delete (retry)
//!                 ─▶ Stopped | Terminated ─▶ listeners.instance_terminated
//! ```
mod builder;
mod instance;
mod listener;
mod slots;

#[cfg(test)]
mod tests;

pub use builder::FleetBuilder;
pub use instance::{Instance, InstanceHandle};
pub use listener::InstanceListener;

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    time::Instant,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use vmfleet_model::{
    FleetConfig, ImageDescriptor, InstanceStatus, ProviderInstance, ProviderState,
    ProvisionSpec, SourceHash, TAG_PROFILE_ID, USER_DATA_AGENT_NAME, USER_DATA_IMAGE_ID,
    USER_DATA_PROFILE_ID, UserData,
};

use crate::{
    cache::TaskCache,
    connector::{ConnectorError, ConnectorHandle, OP_CREATE, OP_DELETE, OP_START, OP_STOP},
    error::FleetError,
    metrics::{CallOutcome, MetricsHandle},
    retry::RetryPolicy,
};
use builder::InventoryLoader;
use slots::{Claim, Slots};

/// Provider inventory of one image, keyed by instance name.
pub type Inventory = Arc<BTreeMap<String, ProviderInstance>>;

type Listeners = Arc<RwLock<Vec<Arc<dyn InstanceListener>>>>;

fn snapshot(listeners: &Listeners) -> Vec<Arc<dyn InstanceListener>> {
    listeners
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Controller for the instances of one image.
///
/// `Send + Sync`; share it through an `Arc`.
pub struct FleetController {
    image: Arc<ImageDescriptor>,
    source_hash: SourceHash,
    config: FleetConfig,
    connector: ConnectorHandle,
    retry: RetryPolicy<ConnectorError>,
    inventory: TaskCache<String, Inventory, InventoryLoader>,
    slots: Mutex<Slots>,
    listeners: Listeners,
    metrics: MetricsHandle,
}

impl FleetController {
    pub fn builder(image: ImageDescriptor, connector: ConnectorHandle) -> FleetBuilder {
        FleetBuilder::new(image, connector)
    }

    /// Controller with default config, metrics and no listeners.
    pub fn new(image: ImageDescriptor, connector: ConnectorHandle) -> Result<Self, FleetError> {
        Self::builder(image, connector).build()
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.image
    }

    /// Hash of the descriptor's current deploy target.
    pub fn source_hash(&self) -> &SourceHash {
        &self.source_hash
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Number of slots currently holding capacity.
    pub fn capacity_used(&self) -> usize {
        self.slots().capacity_used()
    }

    /// Snapshot of every live slot, ordered by index.
    pub fn instances(&self) -> Vec<InstanceHandle> {
        self.slots().iter().cloned().collect()
    }

    pub fn instance(&self, name: &str) -> Option<InstanceHandle> {
        self.slots().by_name(name).cloned()
    }

    /// Register a listener for later events.
    pub fn subscribe(&self, listener: Arc<dyn InstanceListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Claim a slot and provision an instance in it.
    ///
    /// Returns once the provider call finished. On provider failure the slot stays
    /// in `Error` and keeps its capacity. Dropping the returned future before it
    /// completes also leaves the slot in `Error`.
    #[instrument(level = "debug", skip_all, fields(image = %self.image.source_id))]
    pub async fn start_new_instance(
        &self,
        user_data: UserData,
    ) -> Result<InstanceHandle, FleetError> {
        let claim = self.claim()?;
        let mut guard = TransitionGuard::new(
            claim.instance(),
            &self.listeners,
            InstanceStatus::Starting,
            "provisioning abandoned",
        );
        self.provision(claim, user_data, &mut guard).await
    }

    /// Claim a slot now and provision it on a background task.
    ///
    /// Capacity errors are returned synchronously. Cancelling `cancel` stops waiting
    /// on the provider; the slot is then left in `Error`, still claimed.
    /// Must be called from within a tokio runtime.
    pub fn launch_new_instance(
        self: &Arc<Self>,
        user_data: UserData,
        cancel: CancellationToken,
    ) -> Result<PendingInstance, FleetError> {
        let claim = self.claim()?;
        let instance = Arc::clone(claim.instance());
        let mut guard = TransitionGuard::new(
            &instance,
            &self.listeners,
            InstanceStatus::Starting,
            "provisioning abandoned",
        );

        let fleet = Arc::clone(self);
        let name = instance.name().to_string();
        let completion = tokio::spawn(async move {
            tokio::select! {
                res = fleet.provision(claim, user_data, &mut guard) => return res.map(|_| ()),
                _ = cancel.cancelled() => {}
            }
            guard.abandon("provisioning cancelled");
            Err(FleetError::Cancelled { instance: name })
        });

        Ok(PendingInstance {
            instance,
            completion,
        })
    }

    /// Stop (reuse enabled) or delete (reuse disabled) an instance of this fleet.
    ///
    /// Slots whose create never succeeded are always deleted, and an instance the
    /// provider no longer knows counts as deleted. Either way the slot leaves the fleet.
    /// Waits for an in-flight start of the same slot to settle first. Listeners are
    /// told `instance_terminated` once, after the slot reached its final status.
    #[instrument(level = "debug", skip_all, fields(instance = %instance.name()))]
    pub async fn terminate_instance(&self, instance: &InstanceHandle) -> Result<(), FleetError> {
        instance.wait_while_starting().await;

        let from = {
            let slots = self.slots();
            if !slots.contains(instance) {
                return Err(FleetError::UnknownInstance(instance.name().to_string()));
            }
            let status = instance.status();
            if !status.can_transition_to(InstanceStatus::Stopping) {
                return Err(FleetError::InvalidState {
                    instance: instance.name().to_string(),
                    status,
                });
            }
            instance.set_status(InstanceStatus::Stopping)
        };
        let mut guard = TransitionGuard::new(
            instance,
            &self.listeners,
            InstanceStatus::Stopping,
            "termination abandoned",
        );
        self.notify_status(instance, from, InstanceStatus::Stopping)
            .await;

        // A slot whose create failed has nothing to keep for reuse.
        let stop = self.image.reuse_stopped && instance.is_provisioned();
        let result = if stop {
            self.provider_call(OP_STOP, || self.connector.stop_instance(instance))
                .await
        } else {
            self.provider_call(OP_DELETE, || self.connector.delete_instance(instance))
                .await
        };
        guard.disarm();
        self.inventory.invalidate(&self.image.source_id);

        let result = match result {
            Ok(()) if stop => Ok(InstanceStatus::Stopped),
            Ok(()) => Ok(InstanceStatus::Terminated),
            Err(ConnectorError::NotFound(_)) => {
                debug!(instance = instance.name(), "instance already gone at the provider");
                Ok(InstanceStatus::Terminated)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(to) => {
                {
                    let mut slots = self.slots();
                    instance.set_status(to);
                    if to == InstanceStatus::Terminated {
                        slots.remove(instance.index());
                    }
                }
                info!(instance = instance.name(), status = %to, "instance terminated");

                self.notify_status(instance, InstanceStatus::Stopping, to)
                    .await;
                for listener in self.listeners() {
                    listener.instance_terminated(instance).await;
                }
                Ok(())
            }
            Err(source) => {
                instance.set_last_error(source.to_string());
                instance.set_status(InstanceStatus::Error);
                error!(instance = instance.name(), error = %source, "termination failed");

                self.notify_status(instance, InstanceStatus::Stopping, InstanceStatus::Error)
                    .await;
                Err(FleetError::Provider {
                    instance: instance.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Adopt provider instances of this image the fleet does not know yet.
    ///
    /// Returns how many slots were adopted. Instances being deleted are ignored.
    #[instrument(level = "debug", skip_all, fields(image = %self.image.source_id))]
    pub async fn reconcile(&self) -> Result<usize, FleetError> {
        let inventory = self.provider_inventory().await?;

        let adopted: Vec<InstanceHandle> = {
            let mut slots = self.slots();
            inventory
                .iter()
                .filter(|(_, found)| found.state != ProviderState::Deleting)
                .filter_map(|(name, found)| {
                    let index = self.image.parse_instance_index(name)?;
                    if !slots.is_free(index) {
                        return None;
                    }
                    let inst = Arc::new(Instance::new(
                        index,
                        self.image.instance_name(index),
                        self.image.source_id.as_str(),
                        found.source_hash.clone(),
                        found.state.to_instance_status(),
                    ));
                    inst.mark_provisioned();
                    slots.adopt(Arc::clone(&inst)).then_some(inst)
                })
                .collect()
        };

        for inst in &adopted {
            let outdated = inst.is_outdated(&self.source_hash);
            info!(
                instance = inst.name(),
                status = %inst.status(),
                outdated,
                "adopted provider instance"
            );
        }
        Ok(adopted.len())
    }

    /// Provider inventory for this image, served from the cache while fresh.
    pub async fn provider_inventory(&self) -> Result<Inventory, FleetError> {
        Ok(self.inventory.get(self.image.source_id.clone()).await?)
    }

    /// Last provider state seen for `instance`, without querying the provider.
    pub fn observed_state(&self, instance: &Instance) -> Option<ProviderState> {
        self.inventory
            .get_from_cache(&self.image.source_id)
            .and_then(|inv| inv.get(instance.name()).map(|found| found.state))
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn InstanceListener>> {
        snapshot(&self.listeners)
    }

    fn claim(&self) -> Result<Claim, FleetError> {
        let claim = self.slots().claim(&self.image, &self.source_hash);
        claim.ok_or_else(|| {
            self.metrics.record_capacity_rejected(&self.image.source_id);
            warn!(
                image = %self.image.source_id,
                max_instances = self.image.max_instances,
                "capacity exceeded"
            );
            FleetError::CapacityExceeded {
                image: self.image.source_id.clone(),
                max_instances: self.image.max_instances,
            }
        })
    }

    async fn provision(
        &self,
        claim: Claim,
        user_data: UserData,
        guard: &mut TransitionGuard,
    ) -> Result<InstanceHandle, FleetError> {
        let (instance, reused) = match claim {
            Claim::Fresh(inst) => (inst, false),
            Claim::Reused(inst) => (inst, true),
        };
        let from = if reused {
            InstanceStatus::Stopped
        } else {
            InstanceStatus::Idle
        };
        self.notify_status(&instance, from, InstanceStatus::Starting)
            .await;

        let spec = self.prepare_spec(&instance, user_data);
        let result = if reused {
            self.provider_call(OP_START, || self.connector.start_instance(&instance, &spec))
                .await
        } else {
            self.provider_call(OP_CREATE, || self.connector.create_instance(&instance, &spec))
                .await
        };
        guard.disarm();
        self.inventory.invalidate(&self.image.source_id);

        match result {
            Ok(()) => {
                instance.mark_provisioned();
                instance.set_status(InstanceStatus::Running);
                info!(instance = instance.name(), reused, "instance running");

                self.notify_status(&instance, InstanceStatus::Starting, InstanceStatus::Running)
                    .await;
                Ok(instance)
            }
            Err(source) => {
                instance.set_last_error(source.to_string());
                instance.set_status(InstanceStatus::Error);
                error!(instance = instance.name(), error = %source, "provisioning failed");

                self.notify_status(&instance, InstanceStatus::Starting, InstanceStatus::Error)
                    .await;
                Err(FleetError::Provider {
                    instance: instance.name().to_string(),
                    source,
                })
            }
        }
    }

    fn prepare_spec(&self, instance: &Instance, user_data: UserData) -> ProvisionSpec {
        let profile_id = self.config.profile_id.as_str();
        let user_data = self
            .config
            .user_data
            .merged(&user_data)
            .with(USER_DATA_AGENT_NAME, instance.name())
            .with(USER_DATA_PROFILE_ID, profile_id)
            .with(USER_DATA_IMAGE_ID, self.image.source_id.as_str());

        let mut spec = self
            .image
            .target
            .prepare_spec(&self.image, instance.name(), user_data);
        spec.tags.insert(TAG_PROFILE_ID, profile_id);
        spec
    }

    /// Run one state-changing provider call through the retry policy.
    async fn provider_call<F, Fut>(&self, op: &'static str, work: F) -> Result<(), ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ConnectorError>>,
    {
        let metrics = Arc::clone(&self.metrics);
        let policy = self
            .retry
            .clone()
            .on_retry(move |_, _| metrics.record_retry(op));

        let started = Instant::now();
        let result = policy.run(work).await;

        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        self.metrics
            .record_provider_call(op, outcome, started.elapsed().as_millis() as u64);
        result
    }

    async fn notify_status(
        &self,
        instance: &InstanceHandle,
        from: InstanceStatus,
        to: InstanceStatus,
    ) {
        for listener in self.listeners() {
            listener.status_changed(instance, from, to).await;
        }
    }
}

/// Handle to an instance whose provisioning runs in the background.
#[derive(Debug)]
pub struct PendingInstance {
    instance: InstanceHandle,
    completion: JoinHandle<Result<(), FleetError>>,
}

impl PendingInstance {
    /// The claimed slot, usable right away.
    pub fn instance(&self) -> &InstanceHandle {
        &self.instance
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Wait for provisioning to finish.
    pub async fn wait(self) -> Result<InstanceHandle, FleetError> {
        match self.completion.await {
            Ok(Ok(())) => Ok(self.instance),
            Ok(Err(e)) => Err(e),
            Err(join) => Err(FleetError::Internal(format!(
                "provisioning task failed: {join}"
            ))),
        }
    }
}

/// Marks a slot `Error` if the future driving its provider call is dropped early.
struct TransitionGuard {
    instance: InstanceHandle,
    listeners: Listeners,
    pending: InstanceStatus,
    reason: &'static str,
    armed: bool,
}

impl TransitionGuard {
    fn new(
        instance: &InstanceHandle,
        listeners: &Listeners,
        pending: InstanceStatus,
        reason: &'static str,
    ) -> Self {
        Self {
            instance: Arc::clone(instance),
            listeners: Arc::clone(listeners),
            pending,
            reason,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Fail the pending transition now with `reason`.
    fn abandon(mut self, reason: &'static str) {
        self.reason = reason;
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if !self.armed || !self.instance.fail_if(self.pending) {
            return;
        }
        self.instance.set_last_error(self.reason);
        warn!(instance = self.instance.name(), reason = self.reason, "slot left in error");

        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let listeners = snapshot(&self.listeners);
            let instance = Arc::clone(&self.instance);
            let from = self.pending;
            rt.spawn(async move {
                for listener in listeners {
                    listener
                        .status_changed(&instance, from, InstanceStatus::Error)
                        .await;
                }
            });
        }
    }
}
