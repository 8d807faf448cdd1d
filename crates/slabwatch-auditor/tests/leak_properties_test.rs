use std::sync::Arc;
use std::time::Duration;

use slabwatch_auditor::{
    AuditedAllocator, AuditorConfig, CallSiteMode, LeakAuditor, ManualClock, MemorySink,
    SharedBuffer, SlabBuf, SlabPool, SlabView, Tracked,
};

const THRESHOLD: Duration = Duration::from_secs(60);

struct Rig {
    auditor: LeakAuditor,
    clock: Arc<ManualClock>,
    events: Arc<MemorySink>,
    out: SharedBuffer,
}

fn rig(config: AuditorConfig) -> Rig {
    let clock = Arc::new(ManualClock::new());
    let events = Arc::new(MemorySink::new());
    let out = SharedBuffer::new();
    let auditor = LeakAuditor::new(config, clock.clone(), events.clone(), Box::new(out.clone()))
        .expect("valid config");
    Rig {
        auditor,
        clock,
        events,
        out,
    }
}

fn config_with_cutoff(cutoff: usize) -> AuditorConfig {
    AuditorConfig {
        big_buffer_cutoff: cutoff,
        ..AuditorConfig::default()
    }
}

/// One call site for every allocation made through it.
fn read_block(alloc: &AuditedAllocator<SlabPool>, len: usize) -> Tracked<SlabBuf> {
    alloc.allocate(len)
}

#[test]
fn proportionate_small_allocations_are_not_tracked() {
    let rig = rig(config_with_cutoff(4_000));
    let alloc = rig.auditor.install(SlabPool::with_pool_size(0)).unwrap();

    let buf = alloc.allocate(100);
    assert_eq!(buf.slab_len(), 100);
    assert!(!buf.is_tracked());
    assert_eq!(rig.auditor.tracked_slabs(), 0);
    assert_eq!(rig.auditor.live_allocations(), 0);

    let metrics = rig.auditor.metrics();
    assert_eq!(metrics.allocations_seen, 1);
    assert_eq!(metrics.allocations_tracked, 0);
}

#[test]
fn allocation_dropped_before_threshold_never_becomes_a_candidate() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();

    let buf = read_block(&alloc, 50);
    assert!(buf.is_tracked());
    assert_eq!(buf.slab_len(), 10_000);

    rig.clock.advance(Duration::from_secs(1));
    drop(buf);
    assert_eq!(rig.auditor.tracked_slabs(), 0);

    rig.clock.advance(THRESHOLD);
    let outcome = rig.auditor.poll();
    assert_eq!(outcome.leaks_marked, 0);
    assert!(rig.auditor.snapshot_report().is_empty());
    assert_eq!(rig.events.count("leak_candidate"), 0);

    let metrics = rig.auditor.metrics();
    assert_eq!(metrics.finalized, 1);
    assert_eq!(metrics.timers_cancelled, 1);
}

#[test]
fn leak_threshold_is_inclusive_and_exact() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
    let _buf = read_block(&alloc, 50);

    rig.clock.set(THRESHOLD - Duration::from_millis(1));
    assert_eq!(rig.auditor.poll().leaks_marked, 0);
    rig.clock.set(THRESHOLD);
    assert_eq!(rig.auditor.poll().leaks_marked, 1);
    assert_eq!(rig.auditor.pending_timers(), 0);
    assert_eq!(rig.auditor.live_allocations(), 1);
}

#[test]
fn shared_slab_overhead_is_attributed_once() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();

    let held: Vec<Tracked<SlabBuf>> = (0..3).map(|_| read_block(&alloc, 50)).collect();
    assert!(held.iter().all(|b| b.slab_id() == held[0].slab_id()));
    assert_eq!(rig.auditor.tracked_slabs(), 1);

    rig.clock.advance(THRESHOLD);
    assert_eq!(rig.auditor.poll().leaks_marked, 3);

    let report = rig.auditor.report_now();
    assert_eq!(report.slab_leaks.len(), 1);
    let entry = &report.slab_leaks[0];
    assert_eq!(entry.count, 3);
    assert!((entry.normalized_total - 9_850.0).abs() < 1e-6);
    // Raw is the full overhead per entry.
    assert_eq!(entry.raw_total, 3 * 9_850);
    assert!((entry.average_leaked_bytes - 9_850.0 / 3.0).abs() < 1e-6);
    assert_eq!(rig.auditor.leak_count(&entry.call_site), 3);
    assert!(report.big_buffers.is_empty());

    let text = rig.out.contents();
    assert!(text.contains(&entry.call_site));
    assert!(text.contains("count=3"));
}

#[test]
fn normalization_uses_live_retainer_count_at_report_time() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();

    let mut held: Vec<Tracked<SlabBuf>> = (0..3).map(|_| read_block(&alloc, 50)).collect();
    rig.clock.advance(THRESHOLD);
    assert_eq!(rig.auditor.poll().leaks_marked, 3);

    // Finalized between leak marking and the report tick.
    drop(held.pop());

    let report = rig.auditor.snapshot_report();
    let entry = &report.slab_leaks[0];
    assert_eq!(entry.count, 2);
    // 10_000 - 2 * 50 overhead, split across 2 live retainers.
    assert!((entry.normalized_total - 9_900.0).abs() < 1e-6);
    assert!((entry.average_leaked_bytes - 4_950.0).abs() < 1e-6);
    assert_eq!(entry.raw_total, 2 * 9_900);
    assert_eq!(report.live_allocations, 2);
}

#[test]
fn exact_big_buffer_counts_only_as_big_buffer() {
    let rig = rig(config_with_cutoff(4_000));
    let alloc = rig.auditor.install(SlabPool::with_pool_size(0)).unwrap();

    let buf = read_block(&alloc, 5_000);
    assert!(buf.is_tracked());
    assert_eq!(buf.slab_len(), 5_000);

    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    let report = rig.auditor.snapshot_report();
    assert!(report.slab_leaks.is_empty());
    assert_eq!(report.slab_totals.count, 0);
    assert_eq!(report.big_buffers.len(), 1);
    assert_eq!(report.big_buffers[0].count, 1);
    assert_eq!(report.big_buffer_totals.total_bytes, 5_000);
}

#[test]
fn big_slab_sharing_buffer_is_counted_in_both_lists() {
    let rig = rig(config_with_cutoff(4_000));
    let alloc = rig.auditor.install(SlabPool::with_pool_size(100_000)).unwrap();

    let _buf = read_block(&alloc, 5_000);
    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    let report = rig.auditor.snapshot_report();
    assert_eq!(report.slab_totals.count, 1);
    assert_eq!(report.slab_totals.raw_total, 95_000);
    assert_eq!(report.big_buffer_totals.count, 1);
    assert_eq!(report.big_buffer_totals.total_bytes, 5_000);
}

#[test]
fn repeated_cleanup_is_harmless() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();

    let a = read_block(&alloc, 50);
    let b = read_block(&alloc, 50);
    let slab = a.slab_id();

    // Finalize early, keep the bare view alive.
    let bare = a.into_inner();
    assert_eq!(rig.auditor.live_allocations(), 1);
    // A clone of the bare view is not a retainer.
    let copy = bare.clone();
    drop(bare);
    drop(copy);
    assert_eq!(rig.auditor.tracked_slabs(), 1);
    assert_eq!(b.slab_id(), slab);

    rig.auditor.stop();
    drop(b);
    let metrics = rig.auditor.metrics();
    assert_eq!(metrics.finalized, 1);
    assert_eq!(metrics.redundant_finalizations, 1);
    assert_eq!(rig.auditor.tracked_slabs(), 0);
}

#[test]
fn leak_candidate_events_name_the_call_site() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
    let buf = read_block(&alloc, 50);
    let id = buf.alloc_id().unwrap();

    rig.clock.advance(THRESHOLD + Duration::from_secs(5));
    rig.auditor.poll();

    let entries = rig.events.entries();
    let leak = entries
        .iter()
        .find(|e| e.event == "leak_candidate")
        .expect("leak_candidate event");
    assert_eq!(leak.alloc_id, Some(id.get()));
    let site = leak.call_site.as_deref().unwrap();
    assert!(site.contains("leak_properties_test.rs"), "site={site}");
    let details = leak.details.as_ref().unwrap();
    assert_eq!(details["requested_len"], 50);
    assert_eq!(details["slab_len"], 10_000);
    assert_eq!(details["age_ms"], 65_000);

    let line = serde_json::to_string(leak).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(parsed["level"], "debug");
    assert!(parsed["trace_id"].as_str().unwrap().starts_with("slabwatch::"));
}

#[test]
fn regular_cadence_reports_through_poll() {
    let rig = rig(AuditorConfig::default());
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
    let _held = read_block(&alloc, 50);

    rig.clock.advance(Duration::from_secs(90));
    let outcome = rig.auditor.poll();
    assert_eq!(outcome.leaks_marked, 1);
    // Timers fire before the report is built.
    let report = outcome.report.expect("report due at 90s");
    assert_eq!(report.slab_totals.count, 1);
    assert_eq!(rig.events.count("report_emitted"), 1);
}

#[test]
fn backtrace_call_sites_still_bucket() {
    let config = AuditorConfig {
        call_site: CallSiteMode::Backtrace,
        backtrace_depth: 3,
        ..AuditorConfig::default()
    };
    let rig = rig(config);
    let alloc = rig.auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
    let _a = read_block(&alloc, 50);
    let _b = read_block(&alloc, 50);

    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    let report = rig.auditor.snapshot_report();
    assert_eq!(report.slab_totals.count, 2);
    assert!(report.slab_leaks.iter().all(|e| !e.call_site.is_empty()));
}
