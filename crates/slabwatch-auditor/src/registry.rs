//! Slab registry: which tracked allocations currently retain which slab.

use std::collections::HashMap;

use crate::slab::SlabId;
use crate::state::AllocId;

/// Bookkeeping for one live slab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabEntry {
    /// Total length of the backing region.
    pub total_len: usize,
    /// Live tracked retainers and the bytes each one requested.
    retainers: HashMap<AllocId, usize>,
    /// Sum of the retainers' requested lengths.
    retained_bytes: usize,
}

impl SlabEntry {
    fn new(total_len: usize) -> Self {
        Self {
            total_len,
            retainers: HashMap::new(),
            retained_bytes: 0,
        }
    }

    #[must_use]
    pub fn retainer_count(&self) -> usize {
        self.retainers.len()
    }

    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.retained_bytes
    }

    /// Slab bytes not covered by any live tracked retainer.
    #[must_use]
    pub fn overhead(&self) -> usize {
        self.total_len.saturating_sub(self.retained_bytes)
    }
}

/// Map from slab identity to its live retainers.
///
/// A slab has an entry iff at least one tracked allocation retains it, so the
/// registry's own size is bounded by the number of live tracked allocations.
#[derive(Debug, Default)]
pub struct SlabRegistry {
    slabs: HashMap<SlabId, SlabEntry>,
}

impl SlabRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as a retainer of `slab`, creating the entry if absent.
    /// Re-adding an id that is already present changes nothing.
    pub fn add(&mut self, slab: SlabId, total_len: usize, id: AllocId, requested_len: usize) {
        let entry = self
            .slabs
            .entry(slab)
            .or_insert_with(|| SlabEntry::new(total_len));
        if entry.retainers.insert(id, requested_len).is_none() {
            entry.retained_bytes = entry.retained_bytes.saturating_add(requested_len);
        }
    }

    /// Drop `id` from `slab`'s retainers, deleting the entry when it empties.
    ///
    /// Returns false when there was nothing to remove.
    pub fn remove(&mut self, slab: SlabId, id: AllocId) -> bool {
        let Some(entry) = self.slabs.get_mut(&slab) else {
            return false;
        };
        let Some(requested_len) = entry.retainers.remove(&id) else {
            return false;
        };
        entry.retained_bytes = entry.retained_bytes.saturating_sub(requested_len);
        if entry.retainers.is_empty() {
            self.slabs.remove(&slab);
        }
        true
    }

    /// Current live retainer count (0 when the slab is unknown).
    #[must_use]
    pub fn retainer_count(&self, slab: SlabId) -> usize {
        self.slabs.get(&slab).map_or(0, SlabEntry::retainer_count)
    }

    #[must_use]
    pub fn get(&self, slab: SlabId) -> Option<&SlabEntry> {
        self.slabs.get(&slab)
    }

    /// Number of live slabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slabs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    pub fn clear(&mut self) {
        self.slabs.clear();
    }
}
