//! Atomic counters for auditor observability.
//!
//! All counters use relaxed ordering: they are diagnostic, not
//! synchronization primitives. Each auditor owns its own set.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-auditor operation counters.
#[derive(Debug)]
pub struct AuditorMetrics {
    /// Calls through an installed audited allocator.
    pub allocations_seen: AtomicU64,
    /// Allocations that matched the tracking predicate.
    pub allocations_tracked: AtomicU64,
    /// Leak timers that fired on a live allocation.
    pub leaks_marked: AtomicU64,
    /// Tracked allocations whose retainer was dropped.
    pub finalized: AtomicU64,
    /// Leak timers cancelled by finalization.
    pub timers_cancelled: AtomicU64,
    /// Finalizations for ids that were already gone.
    pub redundant_finalizations: AtomicU64,
    pub reports_emitted: AtomicU64,
    pub report_write_failures: AtomicU64,
    /// Call sites recorded as the placeholder signature.
    pub call_site_fallbacks: AtomicU64,
}

impl AuditorMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations_seen: AtomicU64::new(0),
            allocations_tracked: AtomicU64::new(0),
            leaks_marked: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
            timers_cancelled: AtomicU64::new(0),
            redundant_finalizations: AtomicU64::new(0),
            reports_emitted: AtomicU64::new(0),
            report_write_failures: AtomicU64::new(0),
            call_site_fallbacks: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations_seen: Self::get(&self.allocations_seen),
            allocations_tracked: Self::get(&self.allocations_tracked),
            leaks_marked: Self::get(&self.leaks_marked),
            finalized: Self::get(&self.finalized),
            timers_cancelled: Self::get(&self.timers_cancelled),
            redundant_finalizations: Self::get(&self.redundant_finalizations),
            reports_emitted: Self::get(&self.reports_emitted),
            report_write_failures: Self::get(&self.report_write_failures),
            call_site_fallbacks: Self::get(&self.call_site_fallbacks),
        }
    }
}

impl Default for AuditorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations_seen: u64,
    pub allocations_tracked: u64,
    pub leaks_marked: u64,
    pub finalized: u64,
    pub timers_cancelled: u64,
    pub redundant_finalizations: u64,
    pub reports_emitted: u64,
    pub report_write_failures: u64,
    pub call_site_fallbacks: u64,
}
