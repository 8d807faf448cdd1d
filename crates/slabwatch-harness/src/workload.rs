//! Deterministic replication-like workload for exercising the auditor.
//!
//! Blocks are read into small views carved from shared pool slabs and
//! released after a short while. A few call sites hold on to their buffers:
//! a header cache that never evicts, and bitfield pages that are sometimes
//! kept for good. Time runs on a manual clock, one tick per step.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use slabwatch_auditor::{
    AuditedAllocator, AuditorConfig, Clock, EventSink, LeakAuditor, LeakReport, ManualClock,
    MetricsSnapshot, SharedBuffer, SlabBuf, SlabPool, Tracked,
};

use crate::error::HarnessError;

/// xorshift64*
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point.
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        debug_assert!(low <= high_inclusive);
        let span = (high_inclusive - low) as u64 + 1;
        low + (self.next_u64() % span) as usize
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub seed: u64,
    pub steps: usize,
    pub pool_size: usize,
    /// Clock advance per step.
    pub tick: Duration,
    pub auditor: AuditorConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            steps: 600,
            pool_size: slabwatch_auditor::slab::DEFAULT_POOL_SIZE,
            tick: Duration::from_secs(1),
            auditor: AuditorConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationRun {
    /// Report taken after the last step.
    pub final_report: LeakReport,
    /// Reports emitted on the regular cadence during the run.
    pub periodic_reports: usize,
    /// Every rendered report, in order, final one included.
    pub report_text: String,
    pub metrics: MetricsSnapshot,
}

struct Replica {
    alloc: AuditedAllocator<SlabPool>,
    inflight: VecDeque<(Duration, Tracked<SlabBuf>)>,
    header_cache: Vec<Tracked<SlabBuf>>,
    bitfields: Vec<Tracked<SlabBuf>>,
}

impl Replica {
    fn read_block(&self, len: usize) -> Tracked<SlabBuf> {
        self.alloc.allocate(len)
    }

    fn cache_header(&self, len: usize) -> Tracked<SlabBuf> {
        self.alloc.allocate(len)
    }

    fn load_bitfield(&self, len: usize) -> Tracked<SlabBuf> {
        self.alloc.allocate(len)
    }
}

/// Run the workload and return the final report plus run statistics.
pub fn simulate(
    config: &SimulationConfig,
    events: Arc<dyn EventSink>,
) -> Result<SimulationRun, HarnessError> {
    let clock = Arc::new(ManualClock::new());
    let out = SharedBuffer::new();
    let auditor = LeakAuditor::new(
        config.auditor.clone(),
        clock.clone(),
        events,
        Box::new(out.clone()),
    )?;
    let mut replica = Replica {
        alloc: auditor.install(SlabPool::with_pool_size(config.pool_size))?,
        inflight: VecDeque::new(),
        header_cache: Vec::new(),
        bitfields: Vec::new(),
    };

    let mut rng = XorShift64::new(config.seed);
    let mut periodic_reports = 0;
    let big = config.auditor.big_buffer_cutoff;

    for _ in 0..config.steps {
        let now = clock.now();
        match rng.gen_range_usize(0, 99) {
            0..=69 => {
                let len = rng.gen_range_usize(64, 1024);
                let ttl = Duration::from_secs(rng.gen_range_usize(1, 30) as u64);
                let block = replica.read_block(len);
                replica.inflight.push_back((now + ttl, block));
            }
            70..=73 => {
                let len = rng.gen_range_usize(32, 128);
                let header = replica.cache_header(len);
                replica.header_cache.push(header);
            }
            74..=75 => {
                let len = rng.gen_range_usize(big, big.saturating_mul(2));
                let page = replica.load_bitfield(len);
                if rng.gen_range_usize(0, 1) == 0 {
                    replica.bitfields.push(page);
                }
            }
            _ => {}
        }

        clock.advance(config.tick);
        let now = clock.now();
        // Releases are due in arbitrary order; scan the whole queue.
        replica.inflight.retain(|(expires, _)| *expires > now);

        if auditor.poll().report.is_some() {
            periodic_reports += 1;
        }
    }

    let final_report = auditor.report_now();
    let metrics = auditor.metrics();
    auditor.stop();
    drop(replica);

    Ok(SimulationRun {
        final_report,
        periodic_reports,
        report_text: out.contents(),
        metrics,
    })
}
