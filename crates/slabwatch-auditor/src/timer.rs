//! One-shot leak timers, one per tracked allocation.
//!
//! Timers live in a deadline heap. Cancellation only removes the id from the
//! pending map; the heap entry goes stale and is skipped when it surfaces.
//! The heap is rebuilt when stale entries outnumber live ones.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::state::AllocId;

/// Heap slack tolerated before stale entries are compacted away.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, Default)]
pub struct LeakTimers {
    pending: HashMap<AllocId, Duration>,
    queue: BinaryHeap<Reverse<(Duration, AllocId)>>,
}

impl LeakTimers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `id` firing at `deadline`. Returns false if `id`
    /// already has a pending timer (the existing one is kept).
    pub fn arm(&mut self, id: AllocId, deadline: Duration) -> bool {
        if self.pending.contains_key(&id) {
            return false;
        }
        self.pending.insert(id, deadline);
        self.queue.push(Reverse((deadline, id)));
        true
    }

    /// Cancel `id`'s timer. Cancelling a fired or already cancelled timer is
    /// a no-op and returns false.
    pub fn cancel(&mut self, id: AllocId) -> bool {
        let cancelled = self.pending.remove(&id).is_some();
        if cancelled && self.queue.len() > self.pending.len() * 2 + COMPACT_SLACK {
            self.compact();
        }
        cancelled
    }

    /// Pop every timer due at or before `now`, in deadline order.
    pub fn fire_due(&mut self, now: Duration) -> Vec<AllocId> {
        let mut fired = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.queue.peek() {
            if deadline > now {
                break;
            }
            self.queue.pop();
            if self.pending.get(&id) == Some(&deadline) {
                self.pending.remove(&id);
                fired.push(id);
            }
        }
        fired
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every outstanding timer.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
    }

    fn compact(&mut self) {
        self.queue = self
            .pending
            .iter()
            .map(|(&id, &deadline)| Reverse((deadline, id)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn fires_in_deadline_order_and_only_once() {
        let mut timers = LeakTimers::new();
        timers.arm(AllocId::new(2), secs(61));
        timers.arm(AllocId::new(1), secs(60));
        timers.arm(AllocId::new(3), secs(120));

        assert!(timers.fire_due(secs(59)).is_empty());
        assert_eq!(
            timers.fire_due(secs(61)),
            vec![AllocId::new(1), AllocId::new(2)]
        );
        assert!(timers.fire_due(secs(61)).is_empty());
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.fire_due(secs(120)), vec![AllocId::new(3)]);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = LeakTimers::new();
        timers.arm(AllocId::new(1), secs(60));
        assert!(timers.cancel(AllocId::new(1)));
        assert!(!timers.cancel(AllocId::new(1)));
        assert!(timers.fire_due(secs(600)).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelling_a_fired_timer_is_a_noop() {
        let mut timers = LeakTimers::new();
        timers.arm(AllocId::new(7), secs(1));
        assert_eq!(timers.fire_due(secs(1)), vec![AllocId::new(7)]);
        assert!(!timers.cancel(AllocId::new(7)));
    }

    #[test]
    fn double_arm_keeps_the_first_deadline() {
        let mut timers = LeakTimers::new();
        assert!(timers.arm(AllocId::new(1), secs(10)));
        assert!(!timers.arm(AllocId::new(1), secs(5)));
        assert!(timers.fire_due(secs(5)).is_empty());
        assert_eq!(timers.fire_due(secs(10)), vec![AllocId::new(1)]);
    }

    #[test]
    fn heavy_cancellation_compacts_the_heap() {
        let mut timers = LeakTimers::new();
        for raw in 0..1_000 {
            timers.arm(AllocId::new(raw), secs(60));
        }
        for raw in 0..999 {
            timers.cancel(AllocId::new(raw));
        }
        assert_eq!(timers.len(), 1);
        assert!(timers.queue.len() <= 2 + COMPACT_SLACK + 1);
        assert_eq!(timers.fire_due(secs(60)), vec![AllocId::new(999)]);
    }

    #[test]
    fn clear_drops_everything() {
        let mut timers = LeakTimers::new();
        timers.arm(AllocId::new(1), secs(1));
        timers.clear();
        assert!(timers.is_empty());
        assert!(timers.fire_due(secs(10)).is_empty());
    }
}
