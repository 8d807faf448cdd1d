//! Leak attribution report.
//!
//! Built from the auditor state on every report tick. The report only reads
//! state; it never changes what is tracked.
//!
//! Slab overhead is attributed per live slab: its total length minus the bytes
//! requested by every live tracked retainer. Each leak candidate on the slab is
//! charged `overhead / retainers` (normalized) and the full `overhead` (raw).
//! Normalized shares of one slab sum to its overhead exactly once; raw totals
//! of co-retainers overcount it on purpose.
//!
//! Big-buffer accounting runs independently over the same candidates. An
//! allocation that is both large and slab-sharing appears in both lists.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::auditor::AuditorState;
use crate::callsite::{CallSiteId, UNKNOWN_CALL_SITE};

/// One call site's slab-leak line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlabLeakEntry {
    pub call_site: String,
    pub count: usize,
    pub average_leaked_bytes: f64,
    pub normalized_total: f64,
    pub raw_total: u64,
}

/// One call site's big-buffer line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BigBufferEntry {
    pub call_site: String,
    pub count: usize,
    pub average_bytes: f64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SlabLeakTotals {
    pub count: usize,
    pub normalized_total: f64,
    pub raw_total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BigBufferTotals {
    pub count: usize,
    pub total_bytes: u64,
}

/// A ranked leak report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakReport {
    /// Auditor clock reading when the report was built.
    pub generated_at: Duration,
    /// Live tracked allocations.
    pub live_allocations: usize,
    /// Slabs with at least one live tracked retainer.
    pub live_slabs: usize,
    /// Sorted by normalized total, largest first.
    pub slab_leaks: Vec<SlabLeakEntry>,
    /// Sorted by total bytes, largest first.
    pub big_buffers: Vec<BigBufferEntry>,
    pub slab_totals: SlabLeakTotals,
    pub big_buffer_totals: BigBufferTotals,
}

impl LeakReport {
    /// Slab-leak line for `call_site`, if it has one.
    #[must_use]
    pub fn slab_leak(&self, call_site: &str) -> Option<&SlabLeakEntry> {
        self.slab_leaks.iter().find(|e| e.call_site == call_site)
    }

    /// Big-buffer line for `call_site`, if it has one.
    #[must_use]
    pub fn big_buffer(&self, call_site: &str) -> Option<&BigBufferEntry> {
        self.big_buffers.iter().find(|e| e.call_site == call_site)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slab_leaks.is_empty() && self.big_buffers.is_empty()
    }

    /// Human-readable rendering, one line per call site plus grand totals.
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "slabwatch leak report at {:.1}s: {} live tracked allocations on {} slabs",
            self.generated_at.as_secs_f64(),
            self.live_allocations,
            self.live_slabs,
        )?;

        writeln!(f, "slab leaks (count, average, normalized total, raw total):")?;
        if self.slab_leaks.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for entry in &self.slab_leaks {
            writeln!(
                f,
                "  {}  count={} avg={} normalized={} raw={}",
                entry.call_site,
                entry.count,
                sized(entry.average_leaked_bytes),
                sized(entry.normalized_total),
                sized_exact(entry.raw_total),
            )?;
        }
        writeln!(
            f,
            "  TOTAL  count={} normalized={} raw={}",
            self.slab_totals.count,
            sized(self.slab_totals.normalized_total),
            sized_exact(self.slab_totals.raw_total),
        )?;

        writeln!(f, "big buffers (count, average, total):")?;
        if self.big_buffers.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for entry in &self.big_buffers {
            writeln!(
                f,
                "  {}  count={} avg={} total={}",
                entry.call_site,
                entry.count,
                sized(entry.average_bytes),
                sized_exact(entry.total_bytes),
            )?;
        }
        writeln!(
            f,
            "  TOTAL  count={} total={}",
            self.big_buffer_totals.count,
            sized_exact(self.big_buffer_totals.total_bytes),
        )
    }
}

fn sized(bytes: f64) -> String {
    format!("{} ({bytes:.0} B)", format_bytes(bytes))
}

fn sized_exact(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let human = format_bytes(bytes as f64);
    format!("{human} ({bytes} B)")
}

/// Short human byte size with decimal units: `999 B`, `9.85 kB`, `1.5 MB`.
#[must_use]
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    if !bytes.is_finite() || bytes < 1000.0 {
        return format!("{:.0} B", bytes.max(0.0));
    }
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    let digits = if value < 10.0 {
        2
    } else if value < 100.0 {
        1
    } else {
        0
    };
    let mut text = format!("{value:.digits$}");
    if text.contains('.') {
        text.truncate(text.trim_end_matches('0').trim_end_matches('.').len());
    }
    format!("{text} {}", UNITS[unit])
}

#[derive(Default)]
struct SlabAcc {
    count: usize,
    normalized: f64,
    raw: u64,
}

#[derive(Default)]
struct BigAcc {
    count: usize,
    total: u64,
}

/// Aggregate the current leak candidates into a ranked report.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn build(state: &AuditorState, big_buffer_cutoff: usize, now: Duration) -> LeakReport {
    let mut slab_acc: HashMap<CallSiteId, SlabAcc> = HashMap::new();
    let mut big_acc: HashMap<CallSiteId, BigAcc> = HashMap::new();

    for (site, bucket) in &state.candidates {
        for candidate in bucket {
            // Finalized since it was marked: its memory is gone.
            let Some(slab) = state.registry.get(candidate.slab) else {
                continue;
            };

            let overhead = slab.overhead();
            let retainers = slab.retainer_count().max(1);
            if overhead > 0 {
                let acc = slab_acc.entry(*site).or_default();
                acc.count += 1;
                acc.normalized += overhead as f64 / retainers as f64;
                acc.raw += overhead as u64;
            }

            if candidate.requested_len >= big_buffer_cutoff {
                let acc = big_acc.entry(*site).or_default();
                acc.count += 1;
                acc.total += candidate.requested_len as u64;
            }
        }
    }

    let site_text = |site: &CallSiteId| -> String {
        state
            .call_sites
            .get(site)
            .map(|entry| entry.signature.clone())
            .unwrap_or_else(|| UNKNOWN_CALL_SITE.to_owned())
    };

    let mut slab_leaks: Vec<SlabLeakEntry> = slab_acc
        .iter()
        .map(|(site, acc)| SlabLeakEntry {
            call_site: site_text(site),
            count: acc.count,
            average_leaked_bytes: acc.normalized / acc.count as f64,
            normalized_total: acc.normalized,
            raw_total: acc.raw,
        })
        .collect();
    slab_leaks.sort_by(|a, b| {
        b.normalized_total
            .total_cmp(&a.normalized_total)
            .then_with(|| a.call_site.cmp(&b.call_site))
    });

    let mut big_buffers: Vec<BigBufferEntry> = big_acc
        .iter()
        .map(|(site, acc)| BigBufferEntry {
            call_site: site_text(site),
            count: acc.count,
            average_bytes: acc.total as f64 / acc.count as f64,
            total_bytes: acc.total,
        })
        .collect();
    big_buffers.sort_by(|a, b| match b.total_bytes.cmp(&a.total_bytes) {
        Ordering::Equal => a.call_site.cmp(&b.call_site),
        other => other,
    });

    let slab_totals = slab_leaks
        .iter()
        .fold(SlabLeakTotals::default(), |mut totals, entry| {
            totals.count += entry.count;
            totals.normalized_total += entry.normalized_total;
            totals.raw_total += entry.raw_total;
            totals
        });
    let big_buffer_totals = big_buffers
        .iter()
        .fold(BigBufferTotals::default(), |mut totals, entry| {
            totals.count += entry.count;
            totals.total_bytes += entry.total_bytes;
            totals
        });

    LeakReport {
        generated_at: now,
        live_allocations: state.live.len(),
        live_slabs: state.registry.len(),
        slab_leaks,
        big_buffers,
        slab_totals,
        big_buffer_totals,
    }
}

/// A cloneable in-memory report sink.
///
/// Every clone appends to the same buffer, so one clone can be handed to the
/// auditor and another kept to read what was written.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
