//! Named end-to-end scenarios for the leak auditor's core guarantees.
//!
//! Every scenario builds its own auditor on a manual clock, so runs are
//! deterministic and independent.

use std::sync::Arc;
use std::time::Duration;

use slabwatch_auditor::{
    AuditedAllocator, AuditorConfig, LeakAuditor, ManualClock, NullSink, SharedBuffer, SlabBuf,
    SlabPool, SlabView, Tracked,
};

use crate::verdict::{Outcome, ScenarioVerdict};

const THRESHOLD: Duration = Duration::from_secs(60);

macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err(format!($($msg)+));
        }
    };
}

type ScenarioResult = Result<String, String>;

/// A named check.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    run: fn() -> ScenarioResult,
}

impl Scenario {
    /// Run the scenario. `Ok` carries a short description of what held.
    pub fn run(&self) -> ScenarioResult {
        (self.run)()
    }
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "zero_overhead_path",
        run: zero_overhead_path,
    },
    Scenario {
        name: "early_drop_never_leaks",
        run: early_drop_never_leaks,
    },
    Scenario {
        name: "shared_slab_attribution",
        run: shared_slab_attribution,
    },
    Scenario {
        name: "retainer_count_at_report_time",
        run: retainer_count_at_report_time,
    },
    Scenario {
        name: "big_buffer_independence",
        run: big_buffer_independence,
    },
    Scenario {
        name: "idempotent_cleanup",
        run: idempotent_cleanup,
    },
    Scenario {
        name: "stop_clears_and_uninstalls",
        run: stop_clears_and_uninstalls,
    },
];

/// Run every scenario and return one verdict each, in order.
#[must_use]
pub fn run_all(run_id: &str) -> Vec<ScenarioVerdict> {
    SCENARIOS
        .iter()
        .enumerate()
        .map(|(seq, scenario)| {
            let trace_id = format!("harness::{run_id}::{:03}", seq + 1);
            match scenario.run() {
                Ok(detail) => ScenarioVerdict::new(trace_id, scenario.name, Outcome::Pass, detail),
                Err(detail) => ScenarioVerdict::new(trace_id, scenario.name, Outcome::Fail, detail),
            }
        })
        .collect()
}

struct Rig {
    auditor: LeakAuditor,
    clock: Arc<ManualClock>,
}

fn rig(big_buffer_cutoff: usize) -> Result<Rig, String> {
    let clock = Arc::new(ManualClock::new());
    let config = AuditorConfig {
        big_buffer_cutoff,
        ..AuditorConfig::default()
    };
    let auditor = LeakAuditor::new(
        config,
        clock.clone(),
        Arc::new(NullSink),
        Box::new(SharedBuffer::new()),
    )
    .map_err(|err| err.to_string())?;
    Ok(Rig { auditor, clock })
}

fn install(rig: &Rig, pool_size: usize) -> Result<AuditedAllocator<SlabPool>, String> {
    rig.auditor
        .install(SlabPool::with_pool_size(pool_size))
        .map_err(|err| err.to_string())
}

fn read_block(alloc: &AuditedAllocator<SlabPool>, len: usize) -> Tracked<SlabBuf> {
    alloc.allocate(len)
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn zero_overhead_path() -> ScenarioResult {
    let rig = rig(4_000)?;
    let alloc = install(&rig, 0)?;
    let buf = read_block(&alloc, 100);
    ensure!(buf.slab_len() == 100, "expected a 100-byte region, got {}", buf.slab_len());
    ensure!(!buf.is_tracked(), "100 of 100 bytes must not be tracked");
    ensure!(
        rig.auditor.tracked_slabs() == 0,
        "registry has {} slabs",
        rig.auditor.tracked_slabs()
    );
    Ok("100-byte allocation from a 100-byte region left no registry entry".into())
}

fn early_drop_never_leaks() -> ScenarioResult {
    let rig = rig(64 * 1024)?;
    let alloc = install(&rig, 10_000)?;
    let buf = read_block(&alloc, 50);
    ensure!(buf.is_tracked(), "50 of 10000 bytes must be tracked");
    rig.clock.advance(Duration::from_secs(1));
    drop(buf);
    rig.clock.advance(THRESHOLD);
    let outcome = rig.auditor.poll();
    ensure!(outcome.leaks_marked == 0, "{} leaks marked", outcome.leaks_marked);
    let report = rig.auditor.snapshot_report();
    ensure!(report.slab_totals.count == 0, "leak count {}", report.slab_totals.count);
    Ok("dropped at 1s, threshold 60s: leak count stayed 0".into())
}

fn shared_slab_attribution() -> ScenarioResult {
    let rig = rig(64 * 1024)?;
    let alloc = install(&rig, 10_000)?;
    let held: Vec<_> = (0..3).map(|_| read_block(&alloc, 50)).collect();
    ensure!(
        held.iter().all(|b| b.slab_id() == held[0].slab_id()),
        "views landed on different slabs"
    );
    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    let report = rig.auditor.snapshot_report();
    let entry = report.slab_leaks.first().ok_or("no slab-leak entry")?;
    ensure!(entry.count == 3, "count {}", entry.count);
    ensure!(
        close(entry.normalized_total, 9_850.0),
        "normalized total {}",
        entry.normalized_total
    );
    ensure!(entry.raw_total == 3 * 9_850, "raw total {}", entry.raw_total);
    Ok(format!(
        "count=3 normalized={:.0} raw={} at {}",
        entry.normalized_total, entry.raw_total, entry.call_site
    ))
}

fn retainer_count_at_report_time() -> ScenarioResult {
    let rig = rig(64 * 1024)?;
    let alloc = install(&rig, 10_000)?;
    let mut held: Vec<_> = (0..3).map(|_| read_block(&alloc, 50)).collect();
    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    drop(held.pop());
    let report = rig.auditor.snapshot_report();
    let entry = report.slab_leaks.first().ok_or("no slab-leak entry")?;
    ensure!(entry.count == 2, "count {}", entry.count);
    ensure!(
        close(entry.average_leaked_bytes, 9_900.0 / 2.0),
        "per-retainer share {} (expected overhead split 2 ways)",
        entry.average_leaked_bytes
    );
    Ok("remaining two leaks split the overhead by 2, not 3".into())
}

fn big_buffer_independence() -> ScenarioResult {
    let rig = rig(4_000)?;
    let alloc = install(&rig, 0)?;
    let _buf = read_block(&alloc, 5_000);
    rig.clock.advance(THRESHOLD);
    rig.auditor.poll();
    let report = rig.auditor.snapshot_report();
    ensure!(
        report.big_buffer_totals.total_bytes == 5_000,
        "big-buffer total {}",
        report.big_buffer_totals.total_bytes
    );
    ensure!(
        report.slab_totals.count == 0 && report.slab_totals.raw_total == 0,
        "slab-leak total {:?}",
        report.slab_totals
    );
    Ok("5000 of 5000 bytes: big-buffer only".into())
}

fn idempotent_cleanup() -> ScenarioResult {
    let rig = rig(64 * 1024)?;
    let alloc = install(&rig, 10_000)?;
    let a = read_block(&alloc, 50);
    let b = read_block(&alloc, 50);
    let bare = a.into_inner();
    drop(bare);
    ensure!(
        rig.auditor.tracked_slabs() == 1,
        "slab entry vanished with a retainer left"
    );
    rig.auditor.stop();
    drop(b);
    let metrics = rig.auditor.metrics();
    ensure!(
        metrics.finalized == 1 && metrics.redundant_finalizations == 1,
        "finalized={} redundant={}",
        metrics.finalized,
        metrics.redundant_finalizations
    );
    Ok("second cleanup was a counted no-op".into())
}

fn stop_clears_and_uninstalls() -> ScenarioResult {
    let rig = rig(64 * 1024)?;
    let alloc = install(&rig, 10_000)?;
    let _held = read_block(&alloc, 50);
    rig.auditor.stop();
    ensure!(rig.auditor.pending_timers() == 0, "timers left after stop");
    ensure!(!alloc.is_hooked(), "hook still live after stop");
    ensure!(
        !read_block(&alloc, 50).is_tracked(),
        "allocation tracked after stop"
    );
    let again = install(&rig, 10_000)?;
    ensure!(read_block(&again, 50).is_tracked(), "reinstall did not track");
    Ok("stop cleared timers, uninstalled, and allowed reinstall".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_passes() {
        for verdict in run_all("unit") {
            assert!(verdict.passed(), "{}: {}", verdict.scenario, verdict.detail);
        }
    }

    #[test]
    fn scenario_names_are_unique() {
        let mut names: Vec<&str> = SCENARIOS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
    }
}
