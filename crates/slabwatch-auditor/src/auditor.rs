//! The auditor instance: lifecycle, polling, reporting.
//!
//! All mutable bookkeeping sits behind one lock, so the three mutators
//! (allocation hook, leak-timer firing, finalization) and the report pass
//! never overlap. Nothing here runs on its own: a host either calls
//! [`LeakAuditor::poll`] from its own loop or starts an [`AuditorDriver`].

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::callsite::{CallSiteId, UNKNOWN_CALL_SITE};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{AuditorConfig, auditor_enabled};
use crate::error::AuditError;
use crate::hook::AuditedAllocator;
use crate::lifecycle::FinalizeOutcome;
use crate::log::{EventLog, EventSink, JsonlSink, LogEntry, LogLevel};
use crate::metrics::{AuditorMetrics, MetricsSnapshot};
use crate::registry::SlabRegistry;
use crate::report::{self, LeakReport};
use crate::slab::SlabAllocator;
use crate::state::{AllocId, AllocState, Allocation, LeakCandidate};
use crate::timer::LeakTimers;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// A tracked allocation and where it is in its lifecycle.
#[derive(Debug, Clone)]
pub(crate) struct LiveAllocation {
    pub(crate) alloc: Allocation,
    pub(crate) state: AllocState,
}

/// A call site's signature text, kept while it has live tracked allocations.
#[derive(Debug, Clone)]
pub(crate) struct SiteEntry {
    pub(crate) signature: String,
    pub(crate) live: usize,
}

impl SiteEntry {
    pub(crate) fn new(signature: String) -> Self {
        Self { signature, live: 0 }
    }
}

/// Everything the mutators touch.
#[derive(Debug, Default)]
pub(crate) struct AuditorState {
    /// Last id handed out. Survives `stop` so late drops never alias.
    pub(crate) next_id: u64,
    pub(crate) registry: SlabRegistry,
    pub(crate) live: HashMap<AllocId, LiveAllocation>,
    pub(crate) call_sites: HashMap<CallSiteId, SiteEntry>,
    pub(crate) timers: LeakTimers,
    pub(crate) candidates: HashMap<CallSiteId, Vec<LeakCandidate>>,
    pub(crate) next_report_at: Option<Duration>,
}

impl AuditorState {
    fn reset(&mut self) {
        self.registry.clear();
        self.live.clear();
        self.call_sites.clear();
        self.timers.clear();
        self.candidates.clear();
        self.next_report_at = None;
    }

    fn signature(&self, site: CallSiteId) -> String {
        self.call_sites
            .get(&site)
            .map(|entry| entry.signature.clone())
            .unwrap_or_else(|| UNKNOWN_CALL_SITE.to_owned())
    }
}

pub(crate) struct Shared {
    pub(crate) config: AuditorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: AuditorMetrics,
    pub(crate) state: Mutex<AuditorState>,
    log: EventLog,
    report_sink: Mutex<Box<dyn Write + Send>>,
    /// Generation of the installed hook, 0 when none is installed.
    hook_generation: AtomicU64,
    generations: AtomicU64,
}

impl Shared {
    pub(crate) fn is_generation_live(&self, generation: u64) -> bool {
        generation != 0 && self.hook_generation.load(Ordering::Acquire) == generation
    }

    pub(crate) fn finalize(&self, id: AllocId) {
        let outcome = self.state.lock().finalize(id);
        match outcome {
            FinalizeOutcome::Finalized { timer_cancelled } => {
                AuditorMetrics::inc(&self.metrics.finalized);
                if timer_cancelled {
                    AuditorMetrics::inc(&self.metrics.timers_cancelled);
                }
            }
            FinalizeOutcome::Redundant => {
                AuditorMetrics::inc(&self.metrics.redundant_finalizations);
            }
        }
    }
}

/// What one [`LeakAuditor::poll_at`] call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    /// Allocations promoted to leak candidates.
    pub leaks_marked: usize,
    /// The report emitted on this poll, if the report interval elapsed.
    pub report: Option<LeakReport>,
}

/// Slab-aware leak auditor.
///
/// Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct LeakAuditor {
    shared: Arc<Shared>,
}

impl LeakAuditor {
    /// Create an auditor. Nothing is tracked until [`install`](Self::install).
    pub fn new(
        config: AuditorConfig,
        clock: Arc<dyn Clock>,
        log: Arc<dyn EventSink>,
        report_sink: Box<dyn Write + Send>,
    ) -> Result<Self, AuditError> {
        config.validate()?;
        let run = NEXT_RUN.fetch_add(1, Ordering::Relaxed);
        let run_id = format!("{}-{run}", std::process::id());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                clock,
                metrics: AuditorMetrics::new(),
                state: Mutex::new(AuditorState::default()),
                log: EventLog::new(log, run_id),
                report_sink: Mutex::new(report_sink),
                hook_generation: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
        })
    }

    /// Monotonic clock, JSONL events and reports both on stderr.
    pub fn for_process(config: AuditorConfig) -> Result<Self, AuditError> {
        Self::new(
            config,
            Arc::new(MonotonicClock::new()),
            Arc::new(JsonlSink::stderr()),
            Box::new(std::io::stderr()),
        )
    }

    #[must_use]
    pub fn config(&self) -> &AuditorConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.shared.hook_generation.load(Ordering::Acquire) != 0
    }

    /// Tracked allocations not yet finalized.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Slabs with at least one live tracked retainer.
    #[must_use]
    pub fn tracked_slabs(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Leak timers still armed.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    /// Leak candidates currently recorded for `call_site`.
    #[must_use]
    pub fn leak_count(&self, call_site: &str) -> usize {
        let id = CallSiteId::of(call_site);
        self.shared
            .state
            .lock()
            .candidates
            .get(&id)
            .map_or(0, Vec::len)
    }

    /// When the next report is due, if a hook is installed.
    #[must_use]
    pub fn next_report_at(&self) -> Option<Duration> {
        self.shared.state.lock().next_report_at
    }

    /// Interpose the auditor in front of `primitive`.
    ///
    /// Only one hook may be live per auditor; [`stop`](Self::stop) releases
    /// it. A failed install is logged and leaves the auditor untouched.
    pub fn install<A: SlabAllocator>(
        &self,
        primitive: A,
    ) -> Result<AuditedAllocator<A>, AuditError> {
        self.try_install(primitive).map_err(|(err, _)| err)
    }

    fn try_install<A: SlabAllocator>(
        &self,
        primitive: A,
    ) -> Result<AuditedAllocator<A>, (AuditError, A)> {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            if shared.hook_generation.load(Ordering::Acquire) != 0 {
                None
            } else {
                let generation = shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
                shared.hook_generation.store(generation, Ordering::Release);
                state.next_report_at = Some(
                    shared
                        .clock
                        .now()
                        .saturating_add(shared.config.report_interval),
                );
                Some(generation)
            }
        };

        let Some(generation) = generation else {
            let err = AuditError::HookAlreadyInstalled;
            shared.log.emit(
                shared
                    .log
                    .entry(LogLevel::Error, "hook_install_failed")
                    .with_error(err.kind(), err.to_string()),
            );
            return Err((err, primitive));
        };

        let config = &shared.config;
        shared.log.emit(
            shared
                .log
                .entry(LogLevel::Info, "hook_installed")
                .with_details(json!({
                    "generation": generation,
                    "big_buffer_cutoff": config.big_buffer_cutoff,
                    "slab_ratio": config.slab_ratio,
                    "leak_threshold_ms": millis(config.leak_threshold),
                    "report_interval_ms": millis(config.report_interval),
                })),
        );
        Ok(AuditedAllocator::hooked(
            primitive,
            Arc::downgrade(&self.shared),
            generation,
        ))
    }

    /// [`poll_at`](Self::poll_at) the auditor clock's current time.
    pub fn poll(&self) -> PollOutcome {
        self.poll_at(self.shared.clock.now())
    }

    /// Fire every leak timer due at `now`, then emit a report if the report
    /// interval has elapsed.
    pub fn poll_at(&self, now: Duration) -> PollOutcome {
        let shared = &self.shared;
        let (marked, report) = {
            let mut state = shared.state.lock();
            let marked: Vec<(Allocation, String)> = state
                .mark_leaks(now)
                .into_iter()
                .map(|alloc| {
                    let signature = state.signature(alloc.call_site);
                    (alloc, signature)
                })
                .collect();

            let report = match state.next_report_at {
                Some(due) if now >= due => {
                    let interval = shared.config.report_interval;
                    let mut next = due.saturating_add(interval);
                    if next <= now {
                        next = now.saturating_add(interval);
                    }
                    state.next_report_at = Some(next);
                    Some(report::build(&state, shared.config.big_buffer_cutoff, now))
                }
                _ => None,
            };
            (marked, report)
        };

        for (alloc, signature) in &marked {
            AuditorMetrics::inc(&shared.metrics.leaks_marked);
            shared.log.emit(
                shared
                    .log
                    .entry(LogLevel::Debug, "leak_candidate")
                    .with_alloc(alloc.id.get())
                    .with_call_site(signature.as_str())
                    .with_details(json!({
                        "requested_len": alloc.requested_len,
                        "slab_len": alloc.slab_len,
                        "age_ms": millis(now.saturating_sub(alloc.created_at)),
                    })),
            );
        }
        if let Some(report) = &report {
            self.emit_report(report);
        }

        PollOutcome {
            leaks_marked: marked.len(),
            report,
        }
    }

    /// Build and emit a report now, outside the regular cadence.
    pub fn report_now(&self) -> LeakReport {
        let report = self.snapshot_report();
        self.emit_report(&report);
        report
    }

    /// Build a report without emitting it.
    #[must_use]
    pub fn snapshot_report(&self) -> LeakReport {
        let shared = &self.shared;
        let now = shared.clock.now();
        let state = shared.state.lock();
        report::build(&state, shared.config.big_buffer_cutoff, now)
    }

    fn emit_report(&self, report: &LeakReport) {
        let shared = &self.shared;
        let text = report.render();
        let written = {
            let mut sink = shared.report_sink.lock();
            sink.write_all(text.as_bytes()).and_then(|()| sink.flush())
        };
        match written {
            Ok(()) => {
                AuditorMetrics::inc(&shared.metrics.reports_emitted);
                shared.log.emit(
                    shared
                        .log
                        .entry(LogLevel::Info, "report_emitted")
                        .with_details(json!({
                            "live_allocations": report.live_allocations,
                            "live_slabs": report.live_slabs,
                            "slab_leak_sites": report.slab_leaks.len(),
                            "slab_leak_count": report.slab_totals.count,
                            "big_buffer_sites": report.big_buffers.len(),
                            "big_buffer_count": report.big_buffer_totals.count,
                        })),
                );
            }
            Err(io) => {
                AuditorMetrics::inc(&shared.metrics.report_write_failures);
                let err = AuditError::from(io);
                shared.log.emit(
                    shared
                        .log
                        .entry(LogLevel::Warn, "report_write_failed")
                        .with_error(err.kind(), err.to_string()),
                );
            }
        }
    }

    /// Uninstall the hook and drop every timer, candidate and registry
    /// entry. Allocators returned by [`install`](Self::install) become
    /// pass-through; handles still alive finalize as no-ops. A later
    /// `install` starts over.
    pub fn stop(&self) {
        let shared = &self.shared;
        let (generation, timers, live) = {
            let mut state = shared.state.lock();
            let generation = shared.hook_generation.swap(0, Ordering::AcqRel);
            let timers = state.timers.len();
            let live = state.live.len();
            state.reset();
            (generation, timers, live)
        };
        if generation == 0 {
            return;
        }
        shared.log.emit(
            shared
                .log
                .entry(LogLevel::Info, "hook_uninstalled")
                .with_details(json!({ "generation": generation })),
        );
        shared.log.emit(
            shared
                .log
                .entry(LogLevel::Info, "auditor_stopped")
                .with_details(json!({
                    "timers_cleared": timers,
                    "allocations_released": live,
                })),
        );
    }
}

impl std::fmt::Debug for LeakAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakAuditor")
            .field("config", &self.shared.config)
            .field("installed", &self.is_installed())
            .finish_non_exhaustive()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DriverSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Background thread that polls an auditor every `granularity`.
#[derive(Debug)]
pub struct AuditorDriver {
    signal: Arc<DriverSignal>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DriverSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSignal")
            .field("stopped", &*self.stopped.lock())
            .finish()
    }
}

impl AuditorDriver {
    pub fn spawn(auditor: LeakAuditor, granularity: Duration) -> std::io::Result<Self> {
        let signal = Arc::new(DriverSignal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("slabwatch-driver".into())
            .spawn(move || {
                loop {
                    auditor.poll();
                    let mut stopped = thread_signal.stopped.lock();
                    if !*stopped {
                        thread_signal.wake.wait_for(&mut stopped, granularity);
                    }
                    if *stopped {
                        break;
                    }
                }
            })?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop polling and join the thread.
    pub fn shutdown(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AuditorDriver {
    fn drop(&mut self) {
        self.halt();
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Result of process-start activation.
#[derive(Debug)]
pub struct Activation<A> {
    /// The running auditor, or `None` when disabled or activation failed.
    pub auditor: Option<LeakAuditor>,
    /// Audited when `auditor` is `Some`, pass-through otherwise.
    pub allocator: AuditedAllocator<A>,
}

/// Install the auditor in front of `primitive` if `enabled`.
///
/// Never fails: a rejected config or failed install is logged as
/// `hook_install_failed` and the host gets a pass-through allocator.
pub fn activate<A: SlabAllocator>(
    enabled: bool,
    config: AuditorConfig,
    primitive: A,
    log: Arc<dyn EventSink>,
    report_sink: Box<dyn Write + Send>,
) -> Activation<A> {
    if !enabled {
        return Activation {
            auditor: None,
            allocator: AuditedAllocator::passthrough(primitive),
        };
    }

    let auditor = match LeakAuditor::new(
        config,
        Arc::new(MonotonicClock::new()),
        Arc::clone(&log),
        report_sink,
    ) {
        Ok(auditor) => auditor,
        Err(err) => {
            log.emit(
                LogEntry::new("slabwatch::activate::000", LogLevel::Error, "hook_install_failed")
                    .with_error(err.kind(), err.to_string()),
            );
            return Activation {
                auditor: None,
                allocator: AuditedAllocator::passthrough(primitive),
            };
        }
    };

    match auditor.try_install(primitive) {
        Ok(allocator) => Activation {
            auditor: Some(auditor),
            allocator,
        },
        Err((_, primitive)) => Activation {
            auditor: None,
            allocator: AuditedAllocator::passthrough(primitive),
        },
    }
}

/// [`activate`] driven by `SLABWATCH_*` environment variables, with events
/// and reports on stderr.
pub fn activate_from_env<A: SlabAllocator>(primitive: A) -> Activation<A> {
    activate(
        auditor_enabled(),
        AuditorConfig::from_env(),
        primitive,
        Arc::new(JsonlSink::stderr()),
        Box::new(std::io::stderr()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::log::{MemorySink, NullSink};
    use crate::report::SharedBuffer;
    use crate::slab::SlabPool;

    fn manual() -> (LeakAuditor, Arc<ManualClock>, Arc<MemorySink>, SharedBuffer) {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(MemorySink::new());
        let out = SharedBuffer::new();
        let auditor = LeakAuditor::new(
            AuditorConfig::default(),
            clock.clone(),
            sink.clone(),
            Box::new(out.clone()),
        )
        .unwrap();
        (auditor, clock, sink, out)
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn second_install_is_rejected() {
        let (auditor, _clock, sink, _out) = manual();
        let _first = auditor.install(SlabPool::new()).unwrap();
        let err = auditor.install(SlabPool::new()).unwrap_err();
        assert!(matches!(err, AuditError::HookAlreadyInstalled));
        assert_eq!(sink.count("hook_installed"), 1);
        assert_eq!(sink.count("hook_install_failed"), 1);
    }

    #[test]
    fn report_is_emitted_on_interval() {
        let (auditor, clock, sink, out) = manual();
        let _alloc = auditor.install(SlabPool::new()).unwrap();
        assert_eq!(auditor.next_report_at(), Some(Duration::from_secs(90)));

        clock.advance(Duration::from_secs(89));
        assert!(auditor.poll().report.is_none());
        clock.advance(Duration::from_secs(1));
        assert!(auditor.poll().report.is_some());
        assert_eq!(auditor.next_report_at(), Some(Duration::from_secs(180)));
        assert!(out.contents().contains("slabwatch leak report"));
        assert_eq!(sink.count("report_emitted"), 1);
        assert_eq!(auditor.metrics().reports_emitted, 1);
    }

    #[test]
    fn late_poll_does_not_burst_reports() {
        let (auditor, clock, _sink, _out) = manual();
        let _alloc = auditor.install(SlabPool::new()).unwrap();
        clock.advance(Duration::from_secs(1000));
        assert!(auditor.poll().report.is_some());
        assert!(auditor.poll().report.is_none());
        assert_eq!(auditor.next_report_at(), Some(Duration::from_secs(1090)));
    }

    #[test]
    fn report_write_failure_is_counted_not_raised() {
        let clock = Arc::new(ManualClock::new());
        let sink = Arc::new(MemorySink::new());
        let auditor = LeakAuditor::new(
            AuditorConfig::default(),
            clock,
            sink.clone(),
            Box::new(FailingWriter),
        )
        .unwrap();
        let report = auditor.report_now();
        assert!(report.is_empty());
        assert_eq!(auditor.metrics().report_write_failures, 1);
        let failed = sink
            .entries()
            .into_iter()
            .find(|e| e.event == "report_write_failed")
            .unwrap();
        assert_eq!(failed.error_kind.as_deref(), Some("report_write"));
    }

    #[test]
    fn stop_uninstalls_and_clears() {
        let (auditor, _clock, sink, _out) = manual();
        let alloc = auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
        let held = alloc.allocate(50);
        assert!(held.is_tracked());
        assert_eq!(auditor.pending_timers(), 1);

        auditor.stop();
        assert!(!auditor.is_installed());
        assert!(!alloc.is_hooked());
        assert_eq!(auditor.live_allocations(), 0);
        assert_eq!(auditor.pending_timers(), 0);
        assert_eq!(auditor.next_report_at(), None);
        assert!(!alloc.allocate(50).is_tracked());

        drop(held);
        assert_eq!(auditor.metrics().redundant_finalizations, 1);
        assert_eq!(sink.count("hook_uninstalled"), 1);
        assert_eq!(sink.count("auditor_stopped"), 1);

        // Stopping again is quiet; installing again works.
        auditor.stop();
        assert_eq!(sink.count("auditor_stopped"), 1);
        let again = auditor.install(SlabPool::with_pool_size(10_000)).unwrap();
        assert!(again.allocate(50).is_tracked());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = AuditorConfig {
            slab_ratio: 0,
            ..AuditorConfig::default()
        };
        let err = LeakAuditor::new(
            config,
            Arc::new(ManualClock::new()),
            Arc::new(NullSink),
            Box::new(std::io::sink()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn disabled_activation_is_passthrough() {
        let sink = Arc::new(MemorySink::new());
        let activation = activate(
            false,
            AuditorConfig::default(),
            SlabPool::new(),
            sink.clone(),
            Box::new(std::io::sink()),
        );
        assert!(activation.auditor.is_none());
        assert!(!activation.allocator.allocate(10).is_tracked());
        assert!(sink.entries().is_empty());
    }

    #[test]
    fn failed_activation_is_logged_and_passthrough() {
        let sink = Arc::new(MemorySink::new());
        let config = AuditorConfig {
            report_interval: Duration::ZERO,
            ..AuditorConfig::default()
        };
        let activation = activate(true, config, SlabPool::new(), sink.clone(), Box::new(std::io::sink()));
        assert!(activation.auditor.is_none());
        assert!(!activation.allocator.is_hooked());
        assert_eq!(sink.count("hook_install_failed"), 1);
    }

    #[test]
    fn enabled_activation_tracks() {
        let activation = activate(
            true,
            AuditorConfig::default(),
            SlabPool::with_pool_size(10_000),
            Arc::new(NullSink),
            Box::new(std::io::sink()),
        );
        let auditor = activation.auditor.expect("auditor");
        let buf = activation.allocator.allocate(50);
        assert!(buf.is_tracked());
        assert_eq!(auditor.live_allocations(), 1);
        drop(buf);
        assert_eq!(auditor.live_allocations(), 0);
    }

    #[test]
    fn driver_polls_until_shutdown() {
        let (auditor, _clock, sink, _out) = manual();
        let _alloc = auditor.install(SlabPool::new()).unwrap();
        let driver = AuditorDriver::spawn(auditor.clone(), Duration::from_millis(1)).unwrap();
        driver.shutdown();
        // The clock never moved, so nothing fired.
        assert_eq!(sink.count("report_emitted"), 0);
        assert_eq!(auditor.metrics().leaks_marked, 0);
    }
}
