use async_trait::async_trait;

use vmfleet_model::InstanceStatus;

use super::InstanceHandle;

/// Observer of fleet lifecycle events.
///
/// Callbacks run after the transition they report has been applied, on the task
/// that performed it. Keep them short; a slow listener delays the caller.
#[async_trait]
pub trait InstanceListener: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called exactly once per successful `terminate_instance`, after the slot
    /// reached `Stopped` or `Terminated`.
    async fn instance_terminated(&self, instance: &InstanceHandle);

    async fn status_changed(
        &self,
        _instance: &InstanceHandle,
        _from: InstanceStatus,
        _to: InstanceStatus,
    ) {
    }
}
