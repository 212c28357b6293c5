use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::debug;

use vmfleet_model::{ImageDescriptor, InstanceStatus, SlotIndex, SourceHash};

use super::instance::{Instance, InstanceHandle};

/// Outcome of a successful slot claim.
pub(crate) enum Claim {
    /// A new slot; the instance must be created.
    Fresh(InstanceHandle),
    /// A stopped slot reactivated in place; the instance must be started.
    Reused(InstanceHandle),
}

impl Claim {
    pub(crate) fn instance(&self) -> &InstanceHandle {
        match self {
            Claim::Fresh(i) | Claim::Reused(i) => i,
        }
    }
}

/// Live slots of one fleet, guarded by the controller's mutex.
pub(crate) struct Slots {
    by_index: BTreeMap<SlotIndex, InstanceHandle>,
    /// Next index for a fresh slot; never decreases.
    next_index: SlotIndex,
    /// Indices whose instance was deleted. Never adopted again.
    retired: BTreeSet<SlotIndex>,
}

impl Slots {
    pub(crate) fn new() -> Self {
        Self {
            by_index: BTreeMap::new(),
            next_index: 1,
            retired: BTreeSet::new(),
        }
    }

    pub(crate) fn capacity_used(&self) -> usize {
        self.by_index
            .values()
            .filter(|i| i.status().consumes_capacity())
            .count()
    }

    /// Claim a slot for a new start, or `None` when the image is at capacity.
    ///
    /// With reuse enabled the lowest-index `Stopped` slot deployed from `hash` wins;
    /// otherwise a fresh slot is appended. Either way the slot leaves as `Starting`.
    pub(crate) fn claim(&mut self, image: &ImageDescriptor, hash: &SourceHash) -> Option<Claim> {
        if self.capacity_used() >= image.max_instances as usize {
            return None;
        }

        if image.reuse_stopped {
            let reusable = self
                .by_index
                .values()
                .find(|i| i.status() == InstanceStatus::Stopped && !i.is_outdated(hash));
            if let Some(inst) = reusable {
                inst.set_status(InstanceStatus::Starting);
                debug!(instance = inst.name(), "reusing stopped slot");
                return Some(Claim::Reused(Arc::clone(inst)));
            }
        }

        let index = self.next_index;
        self.next_index = self.next_index.checked_add(1)?;

        let inst = Arc::new(Instance::new(
            index,
            image.instance_name(index),
            image.source_id.as_str(),
            Some(hash.clone()),
            InstanceStatus::Starting,
        ));
        self.by_index.insert(index, Arc::clone(&inst));
        debug!(instance = inst.name(), "allocated fresh slot");
        Some(Claim::Fresh(inst))
    }

    /// Insert a slot discovered at the provider.
    ///
    /// Returns `false` if the index is taken or belongs to a deleted instance.
    pub(crate) fn adopt(&mut self, inst: InstanceHandle) -> bool {
        if !self.is_free(inst.index()) {
            return false;
        }
        self.next_index = self.next_index.max(inst.index().saturating_add(1));
        self.by_index.insert(inst.index(), inst);
        true
    }

    /// Drop a deleted slot and retire its index.
    pub(crate) fn remove(&mut self, index: SlotIndex) -> Option<InstanceHandle> {
        let removed = self.by_index.remove(&index)?;
        self.retired.insert(index);
        Some(removed)
    }

    /// Whether a provider instance at `index` may still be adopted.
    pub(crate) fn is_free(&self, index: SlotIndex) -> bool {
        !self.by_index.contains_key(&index) && !self.retired.contains(&index)
    }

    /// Whether `inst` is the very slot this fleet holds at its index.
    pub(crate) fn contains(&self, inst: &InstanceHandle) -> bool {
        self.by_index
            .get(&inst.index())
            .is_some_and(|held| Arc::ptr_eq(held, inst))
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<&InstanceHandle> {
        let name = name.to_lowercase();
        self.by_index.values().find(|i| i.name() == name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &InstanceHandle> {
        self.by_index.values()
    }
}
