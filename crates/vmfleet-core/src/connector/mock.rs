use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tracing::trace;

use vmfleet_model::{ImageDescriptor, ProviderInstance, ProviderState, ProvisionSpec};

use super::{ApiConnector, ConnectorError};
use crate::fleet::Instance;

/// Connector operation, used to script failures and inspect calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Stop,
    Delete,
    Fetch,
}

#[derive(Default)]
struct MockState {
    instances: BTreeMap<String, ProviderInstance>,
    calls: Vec<(MockOp, String)>,
    specs: BTreeMap<String, ProvisionSpec>,
    failures: HashMap<MockOp, VecDeque<ConnectorError>>,
    latency: Option<Duration>,
    latency_for: HashMap<String, Duration>,
}

/// In-memory cloud provider.
///
/// Keeps a provider-side inventory, records every call, and can be scripted to
/// fail or to answer slowly. Used by tests and by the demo daemon.
#[derive(Default)]
pub struct MockConnector {
    state: Mutex<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: MockOp, err: ConnectorError) -> &Self {
        self.fail_times(op, 1, err)
    }

    /// Fail the next `n` calls of `op` with `err`.
    pub fn fail_times(&self, op: MockOp, n: usize, err: ConnectorError) -> &Self {
        let mut st = self.state();
        let queue = st.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, n));
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = Some(latency);
        self
    }

    /// Delay calls touching instance `name` by `latency`.
    pub fn with_latency_for(self, name: impl Into<String>, latency: Duration) -> Self {
        self.state().latency_for.insert(name.into(), latency);
        self
    }

    /// Seed the provider-side inventory.
    pub fn insert_instance(&self, name: impl Into<String>, instance: ProviderInstance) {
        self.state().instances.insert(name.into(), instance);
    }

    /// Current provider-side state of `name`.
    pub fn provider_state(&self, name: &str) -> Option<ProviderState> {
        self.state().instances.get(name).map(|i| i.state)
    }

    /// Last provision spec received for `name`.
    pub fn spec_of(&self, name: &str) -> Option<ProvisionSpec> {
        self.state().specs.get(name).cloned()
    }

    /// Instance names passed to `op`, in call order.
    pub fn calls_of(&self, op: MockOp) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|(o, _)| *o == op)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn fetch_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(o, _)| *o == MockOp::Fetch)
            .count()
    }

    /// Record the call, wait for the configured latency, and pop a scripted failure.
    async fn enter(&self, op: MockOp, name: &str) -> Result<(), ConnectorError> {
        let latency = {
            let mut st = self.state();
            st.calls.push((op, name.to_string()));
            st.latency_for.get(name).copied().or(st.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        trace!(?op, name, "mock connector call");
        let scripted = self.state().failures.get_mut(&op).and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set_state(&self, name: &str, state: ProviderState) -> Result<(), ConnectorError> {
        let mut st = self.state();
        let entry = st
            .instances
            .get_mut(name)
            .ok_or_else(|| ConnectorError::NotFound(name.to_string()))?;
        entry.state = state;
        Ok(())
    }
}

#[async_trait]
impl ApiConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_instance(
        &self,
        instance: &Instance,
        spec: &ProvisionSpec,
    ) -> Result<(), ConnectorError> {
        self.enter(MockOp::Create, instance.name()).await?;

        let created = ProviderInstance::new(ProviderState::Running)
            .with_source_hash(spec.source_hash.clone());
        let mut st = self.state();
        st.instances.insert(instance.name().to_string(), created);
        st.specs.insert(instance.name().to_string(), spec.clone());
        Ok(())
    }

    async fn start_instance(
        &self,
        instance: &Instance,
        spec: &ProvisionSpec,
    ) -> Result<(), ConnectorError> {
        self.enter(MockOp::Start, instance.name()).await?;
        self.set_state(instance.name(), ProviderState::Running)?;
        self.state()
            .specs
            .insert(instance.name().to_string(), spec.clone());
        Ok(())
    }

    async fn stop_instance(&self, instance: &Instance) -> Result<(), ConnectorError> {
        self.enter(MockOp::Stop, instance.name()).await?;
        self.set_state(instance.name(), ProviderState::Stopped)
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<(), ConnectorError> {
        self.enter(MockOp::Delete, instance.name()).await?;
        self.state()
            .instances
            .remove(instance.name())
            .map(|_| ())
            .ok_or_else(|| ConnectorError::NotFound(instance.name().to_string()))
    }

    async fn fetch_instances(
        &self,
        image: &ImageDescriptor,
    ) -> Result<BTreeMap<String, ProviderInstance>, ConnectorError> {
        // The listing reflects the moment of the request, not of the reply.
        let prefix = image.name_prefix.to_lowercase();
        let listing = self
            .state()
            .instances
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, inst)| (name.clone(), inst.clone()))
            .collect();

        self.enter(MockOp::Fetch, &image.source_id).await?;
        Ok(listing)
    }
}
