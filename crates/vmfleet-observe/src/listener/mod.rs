#![cfg(feature = "listener")]

//! Fleet listener that turns lifecycle events into tracing logs.
//!
//! Severity follows the target status: failures are `error`, teardown is `info`,
//! routine progress is `debug`.
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use vmfleet_core::{InstanceHandle, InstanceListener};
use vmfleet_model::InstanceStatus;

/// Listener that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

#[async_trait]
impl InstanceListener for LoggingListener {
    fn name(&self) -> &str {
        "logging"
    }

    async fn instance_terminated(&self, instance: &InstanceHandle) {
        info!(
            instance = instance.name(),
            image = instance.image_id(),
            status = %instance.status(),
            "instance released"
        );
    }

    async fn status_changed(
        &self,
        instance: &InstanceHandle,
        from: InstanceStatus,
        to: InstanceStatus,
    ) {
        log_transition(instance, from, to);
    }
}

fn log_transition(instance: &InstanceHandle, from: InstanceStatus, to: InstanceStatus) {
    let name = instance.name();

    match to {
        InstanceStatus::Error => error!(
            instance = name,
            %from,
            reason = instance.last_error().as_deref().unwrap_or("unknown"),
            "instance failed"
        ),
        InstanceStatus::Running => info!(instance = name, %from, "instance running"),
        InstanceStatus::Stopped | InstanceStatus::Terminated => {
            info!(instance = name, %from, %to, "instance shut down")
        }
        InstanceStatus::Starting | InstanceStatus::Stopping => {
            debug!(instance = name, %from, %to, "instance transition")
        }
        InstanceStatus::Idle => warn!(instance = name, %from, "unexpected transition to idle"),
    }
}
