use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::watch;

use vmfleet_model::{InstanceStatus, SlotIndex, SourceHash};

/// One numbered slot of a fleet and the instance bound to it.
///
/// Identity (index, name, image) never changes. The status is published through a
/// `watch` channel so callers can await transitions without polling.
pub struct Instance {
    index: SlotIndex,
    name: String,
    image_id: String,
    source_hash: Option<SourceHash>,
    status: watch::Sender<InstanceStatus>,
    last_error: Mutex<Option<String>>,
    /// Set once the provider is known to hold a resource for this slot.
    provisioned: AtomicBool,
}

/// Shared handle to an instance slot.
pub type InstanceHandle = Arc<Instance>;

impl Instance {
    pub(crate) fn new(
        index: SlotIndex,
        name: String,
        image_id: impl Into<String>,
        source_hash: Option<SourceHash>,
        status: InstanceStatus,
    ) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            index,
            name,
            image_id: image_id.into(),
            source_hash,
            status,
            last_error: Mutex::new(None),
            provisioned: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> SlotIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `source_id` of the owning image.
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    /// Hash of the deploy target this instance was created from, when known.
    pub fn source_hash(&self) -> Option<&SourceHash> {
        self.source_hash.as_ref()
    }

    /// Whether this instance was deployed from something other than `current`.
    ///
    /// Instances without a recorded hash count as outdated.
    pub fn is_outdated(&self, current: &SourceHash) -> bool {
        self.source_hash.as_ref() != Some(current)
    }

    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every later status change.
    pub fn subscribe(&self) -> watch::Receiver<InstanceStatus> {
        self.status.subscribe()
    }

    /// Wait until the status satisfies `pred` and return it.
    pub async fn wait_for(&self, mut pred: impl FnMut(InstanceStatus) -> bool) -> InstanceStatus {
        let mut rx = self.status.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        match rx.wait_for(|s| pred(*s)).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    /// Wait for an in-flight create/start to settle.
    pub async fn wait_while_starting(&self) -> InstanceStatus {
        self.wait_for(|s| s != InstanceStatus::Starting).await
    }

    /// Message of the provider failure that put the instance into `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_last_error(&self, msg: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg.into());
    }

    /// Whether a create ever succeeded for this slot, or it was found at the provider.
    ///
    /// A slot whose create failed has nothing to stop or restart.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    pub(crate) fn mark_provisioned(&self) {
        self.provisioned.store(true, Ordering::Release);
    }

    /// Replace the status, returning the previous one.
    ///
    /// Callers hold the fleet lock so capacity accounting sees a consistent view.
    pub(crate) fn set_status(&self, next: InstanceStatus) -> InstanceStatus {
        let prev = self.status.send_replace(next);
        debug_assert!(
            prev.can_transition_to(next),
            "{}: illegal transition {prev} -> {next}",
            self.name
        );
        prev
    }

    /// Move to `Error` only if the status is still `pending`.
    pub(crate) fn fail_if(&self, pending: InstanceStatus) -> bool {
        self.status.send_if_modified(|s| {
            if *s == pending {
                *s = InstanceStatus::Error;
                true
            } else {
                false
            }
        })
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("image_id", &self.image_id)
            .field("status", &self.status())
            .field("provisioned", &self.is_provisioned())
            .finish()
    }
}
