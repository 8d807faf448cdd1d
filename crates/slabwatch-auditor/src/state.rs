//! Allocation records and their lifecycle states.

use std::fmt;
use std::time::Duration;

use crate::callsite::CallSiteId;
use crate::slab::SlabId;

/// Monotonic id of a tracked allocation. Never reused within one auditor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(u64);

impl AllocId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a tracked allocation.
///
/// `Pending -> Leaked` when its leak timer fires, `Pending | Leaked ->
/// Finalized` when its retainer is dropped. `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocState {
    /// Live, leak timer armed.
    Pending,
    /// Live past the leak threshold; recorded as a leak candidate.
    Leaked,
    /// Dropped and removed from every map.
    Finalized,
}

impl AllocState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Leaked)
                | (Self::Pending, Self::Finalized)
                | (Self::Leaked, Self::Finalized)
        )
    }
}

/// Immutable record of one tracked allocation, captured at interception time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocId,
    pub requested_len: usize,
    pub slab: SlabId,
    pub slab_len: usize,
    pub call_site: CallSiteId,
    /// Clock reading at interception.
    pub created_at: Duration,
}

/// An allocation that was still live when its leak timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakCandidate {
    pub id: AllocId,
    pub requested_len: usize,
    pub slab: SlabId,
    pub slab_len: usize,
}

impl From<&Allocation> for LeakCandidate {
    fn from(alloc: &Allocation) -> Self {
        Self {
            id: alloc.id,
            requested_len: alloc.requested_len,
            slab: alloc.slab,
            slab_len: alloc.slab_len,
        }
    }
}
