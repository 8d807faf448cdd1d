//! The allocation hook.
//!
//! [`AuditedAllocator`] sits in front of a real [`SlabAllocator`]. Every call
//! goes to the real primitive first; the returned handle is then either passed
//! straight through or registered with the auditor. Either way the caller gets
//! the same handle back, wrapped in a [`Tracked`] that derefs to it.

use std::fmt;
use std::ops::Deref;
use std::panic::Location;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::auditor::{AuditorState, LiveAllocation, Shared, SiteEntry};
use crate::callsite::CallSite;
use crate::lifecycle::Retainer;
use crate::metrics::AuditorMetrics;
use crate::slab::{SlabAllocator, SlabId, SlabView};
use crate::state::{AllocId, AllocState, Allocation};

/// An allocation primitive with the leak auditor interposed.
pub struct AuditedAllocator<A> {
    inner: A,
    hook: Option<Hook>,
}

#[derive(Clone)]
struct Hook {
    auditor: Weak<Shared>,
    generation: u64,
}

impl<A: SlabAllocator> AuditedAllocator<A> {
    /// An allocator that never tracks anything.
    #[must_use]
    pub fn passthrough(inner: A) -> Self {
        Self { inner, hook: None }
    }

    pub(crate) fn hooked(inner: A, auditor: Weak<Shared>, generation: u64) -> Self {
        Self {
            inner,
            hook: Some(Hook {
                auditor,
                generation,
            }),
        }
    }

    /// The wrapped primitive.
    #[must_use]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Whether allocations through this allocator are currently audited.
    /// Turns false once the auditor is stopped or dropped.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.live_hook().is_some()
    }

    fn live_hook(&self) -> Option<Arc<Shared>> {
        let hook = self.hook.as_ref()?;
        let shared = hook.auditor.upgrade()?;
        shared.is_generation_live(hook.generation).then_some(shared)
    }

    /// Allocate `len` bytes from the real primitive and track the result if
    /// it is large, or small relative to its slab.
    #[track_caller]
    pub fn allocate(&self, len: usize) -> Tracked<A::Buf> {
        let caller = Location::caller();
        let buf = self.inner.allocate(len);
        let Some((hook, shared)) = self.hook.as_ref().zip(self.live_hook()) else {
            return Tracked::untracked(buf);
        };
        AuditorMetrics::inc(&shared.metrics.allocations_seen);

        let config = &shared.config;
        if !config.should_track(buf.len(), buf.slab_len()) {
            return Tracked::untracked(buf);
        }

        let site = CallSite::capture(config.call_site, config.backtrace_depth, caller);
        let fallback = site.fallback;
        let now = shared.clock.now();
        let id = {
            let mut state = shared.state.lock();
            // Re-checked under the lock: `stop` flips the generation while
            // holding it.
            if !shared.is_generation_live(hook.generation) {
                return Tracked::untracked(buf);
            }
            state.track(&buf, site, now, config.leak_threshold)
        };

        AuditorMetrics::inc(&shared.metrics.allocations_tracked);
        if fallback {
            AuditorMetrics::inc(&shared.metrics.call_site_fallbacks);
        }
        Tracked {
            buf,
            retainer: Some(Retainer::new(id, Arc::downgrade(&shared))),
        }
    }
}

impl<A: SlabAllocator> SlabAllocator for AuditedAllocator<A> {
    type Buf = Tracked<A::Buf>;

    #[track_caller]
    fn allocate(&self, len: usize) -> Self::Buf {
        Self::allocate(self, len)
    }
}

impl<A: fmt::Debug> fmt::Debug for AuditedAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditedAllocator")
            .field("inner", &self.inner)
            .field("generation", &self.hook.as_ref().map(|h| h.generation))
            .finish()
    }
}

impl AuditorState {
    /// Register a freshly allocated handle: new id, slab retainer, leak timer.
    pub(crate) fn track<V: SlabView + ?Sized>(
        &mut self,
        view: &V,
        site: CallSite,
        now: Duration,
        leak_threshold: Duration,
    ) -> AllocId {
        self.next_id += 1;
        let id = AllocId::new(self.next_id);
        let alloc = Allocation {
            id,
            requested_len: view.len(),
            slab: view.slab_id(),
            slab_len: view.slab_len(),
            call_site: site.id,
            created_at: now,
        };
        self.call_sites
            .entry(site.id)
            .or_insert_with(|| SiteEntry::new(site.signature))
            .live += 1;
        self.registry
            .add(alloc.slab, alloc.slab_len, id, alloc.requested_len);
        self.timers.arm(id, now.saturating_add(leak_threshold));
        self.live.insert(
            id,
            LiveAllocation {
                alloc,
                state: AllocState::Pending,
            },
        );
        id
    }
}

/// A handle returned by [`AuditedAllocator::allocate`].
///
/// Derefs to the primitive's own handle. When the allocation was tracked,
/// dropping this value finalizes it with the auditor. The handle is
/// read-only through the wrapper: a tracked allocation keeps the one slab it
/// was registered with.
#[derive(Debug)]
pub struct Tracked<B> {
    // Fields drop in order: the slab is deregistered before `buf` can
    // release its region.
    retainer: Option<Retainer>,
    buf: B,
}

impl<B> Tracked<B> {
    fn untracked(buf: B) -> Self {
        Self {
            buf,
            retainer: None,
        }
    }

    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.retainer.is_some()
    }

    #[must_use]
    pub fn alloc_id(&self) -> Option<AllocId> {
        self.retainer.as_ref().map(Retainer::id)
    }

    /// Finalize the tracked allocation now and return the bare handle.
    ///
    /// The handle may keep its slab alive afterwards; the auditor no longer
    /// sees it.
    #[must_use]
    pub fn into_inner(self) -> B {
        let Self { buf, retainer } = self;
        drop(retainer);
        buf
    }
}

impl<B> Deref for Tracked<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.buf
    }
}

impl<B: SlabView> SlabView for Tracked<B> {
    fn len(&self) -> usize {
        self.buf.len()
    }

    fn slab_id(&self) -> SlabId {
        self.buf.slab_id()
    }

    fn slab_len(&self) -> usize {
        self.buf.slab_len()
    }
}
