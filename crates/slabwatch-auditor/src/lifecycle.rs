//! Allocation lifecycle: leak marking and finalization.
//!
//! Every tracked allocation is owned by a [`Retainer`] that travels with the
//! handle handed back to the caller. Dropping it finalizes the allocation
//! synchronously, exactly once. Both transitions out of `Pending` are safe
//! under any interleaving:
//! - finalizing an id that is already gone is a no-op;
//! - cancelling a timer that already fired is a no-op;
//! - a fired timer for an id that was finalized in between marks nothing.

use std::sync::Weak;

use crate::auditor::{AuditorState, Shared};
use crate::state::{AllocId, AllocState, Allocation, LeakCandidate};

/// Drop guard for one tracked allocation.
///
/// Holds only a weak reference: once the auditor is gone, dropping the
/// retainer does nothing.
#[derive(Debug)]
pub(crate) struct Retainer {
    id: AllocId,
    auditor: Weak<Shared>,
}

impl Retainer {
    pub(crate) fn new(id: AllocId, auditor: Weak<Shared>) -> Self {
        Self { id, auditor }
    }

    pub(crate) const fn id(&self) -> AllocId {
        self.id
    }
}

impl Drop for Retainer {
    fn drop(&mut self) {
        if let Some(shared) = self.auditor.upgrade() {
            shared.finalize(self.id);
        }
    }
}

/// Result of a finalization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeOutcome {
    /// The id was live and has been removed everywhere.
    Finalized { timer_cancelled: bool },
    /// The id was not live (already finalized, or cleared by `stop`).
    Redundant,
}

impl AuditorState {
    /// Terminal transition to `Finalized`: cancel the leak timer if still
    /// armed, release the slab retainer, and withdraw any leak candidate.
    pub(crate) fn finalize(&mut self, id: AllocId) -> FinalizeOutcome {
        let Some(entry) = self.live.remove(&id) else {
            return FinalizeOutcome::Redundant;
        };
        debug_assert!(entry.state.can_become(AllocState::Finalized));

        let timer_cancelled = self.timers.cancel(id);
        self.registry.remove(entry.alloc.slab, id);

        let site = entry.alloc.call_site;
        if entry.state == AllocState::Leaked {
            if let Some(bucket) = self.candidates.get_mut(&site) {
                bucket.retain(|candidate| candidate.id != id);
                if bucket.is_empty() {
                    self.candidates.remove(&site);
                }
            }
        }
        // Candidates never outlive their allocation.
        if let Some(known) = self.call_sites.get_mut(&site) {
            known.live = known.live.saturating_sub(1);
            if known.live == 0 {
                self.call_sites.remove(&site);
            }
        }
        FinalizeOutcome::Finalized { timer_cancelled }
    }

    /// Fire every leak timer due at `now`: each still-pending allocation
    /// becomes `Leaked` and joins its call site's candidate bucket. It stays
    /// registered as a slab retainer.
    pub(crate) fn mark_leaks(&mut self, now: std::time::Duration) -> Vec<Allocation> {
        let fired = self.timers.fire_due(now);
        let mut marked = Vec::with_capacity(fired.len());
        for id in fired {
            let Some(entry) = self.live.get_mut(&id) else {
                continue;
            };
            if !entry.state.can_become(AllocState::Leaked) {
                continue;
            }
            entry.state = AllocState::Leaked;
            self.candidates
                .entry(entry.alloc.call_site)
                .or_default()
                .push(LeakCandidate::from(&entry.alloc));
            marked.push(entry.alloc.clone());
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::callsite::{CallSite, CallSiteId};
    use crate::slab::{SlabBuf, SlabView};

    const THRESHOLD: Duration = Duration::from_secs(60);

    fn track(state: &mut AuditorState, buf: &SlabBuf, site: &str, now: Duration) -> AllocId {
        state.track(buf, CallSite::new(site), now, THRESHOLD)
    }

    #[test]
    fn finalize_before_threshold_leaves_no_candidate() {
        let mut state = AuditorState::default();
        let slab = SlabBuf::standalone(10_000);
        let view = slab.slice(0, 50).unwrap();
        let id = track(&mut state, &view, "a.rs:1:1", Duration::ZERO);

        assert_eq!(
            state.finalize(id),
            FinalizeOutcome::Finalized {
                timer_cancelled: true
            }
        );
        assert!(state.mark_leaks(Duration::from_secs(120)).is_empty());
        assert!(state.candidates.is_empty());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut state = AuditorState::default();
        let slab = SlabBuf::standalone(10_000);
        let a = slab.slice(0, 50).unwrap();
        let b = slab.slice(50, 100).unwrap();
        let id_a = track(&mut state, &a, "a.rs:1:1", Duration::ZERO);
        let _id_b = track(&mut state, &b, "a.rs:1:1", Duration::ZERO);

        assert!(matches!(
            state.finalize(id_a),
            FinalizeOutcome::Finalized { .. }
        ));
        assert_eq!(state.finalize(id_a), FinalizeOutcome::Redundant);
        assert_eq!(state.registry.retainer_count(a.slab_id()), 1);
        assert!(state.registry.get(a.slab_id()).is_some());
    }

    #[test]
    fn leaked_allocation_stays_registered_until_finalized() {
        let mut state = AuditorState::default();
        let slab = SlabBuf::standalone(10_000);
        let view = slab.slice(0, 50).unwrap();
        let id = track(&mut state, &view, "a.rs:1:1", Duration::ZERO);

        let marked = state.mark_leaks(THRESHOLD);
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].id, id);
        assert_eq!(state.live[&id].state, AllocState::Leaked);
        assert_eq!(state.registry.retainer_count(view.slab_id()), 1);
        assert_eq!(state.candidates.values().map(Vec::len).sum::<usize>(), 1);

        // Timer already fired: nothing left to cancel.
        assert_eq!(
            state.finalize(id),
            FinalizeOutcome::Finalized {
                timer_cancelled: false
            }
        );
        assert!(state.candidates.is_empty());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn leak_timer_fires_only_once() {
        let mut state = AuditorState::default();
        let view = SlabBuf::standalone(10_000).slice(0, 10).unwrap();
        track(&mut state, &view, "a.rs:1:1", Duration::ZERO);
        assert_eq!(state.mark_leaks(THRESHOLD).len(), 1);
        assert!(state.mark_leaks(THRESHOLD * 10).is_empty());
    }

    #[test]
    fn call_site_text_is_dropped_with_its_last_allocation() {
        let mut state = AuditorState::default();
        let slab = SlabBuf::standalone(10_000);
        let a = slab.slice(0, 50).unwrap();
        let b = slab.slice(50, 100).unwrap();
        let c = slab.slice(100, 150).unwrap();
        let id_a = track(&mut state, &a, "a.rs:1:1", Duration::ZERO);
        let id_b = track(&mut state, &b, "a.rs:1:1", Duration::ZERO);
        let id_c = track(&mut state, &c, "c.rs:3:3", Duration::ZERO);
        assert_eq!(state.call_sites.len(), 2);

        state.mark_leaks(THRESHOLD);
        state.finalize(id_a);
        assert_eq!(state.call_sites.len(), 2);
        let remaining = &state.call_sites[&CallSiteId::of("a.rs:1:1")];
        assert_eq!((remaining.signature.as_str(), remaining.live), ("a.rs:1:1", 1));

        state.finalize(id_b);
        state.finalize(id_c);
        assert!(state.call_sites.is_empty());
        assert!(state.candidates.is_empty());
    }

    #[test]
    fn retainer_without_auditor_is_inert() {
        let retainer = Retainer::new(AllocId::new(1), Weak::new());
        assert_eq!(retainer.id(), AllocId::new(1));
        drop(retainer);
    }
}
