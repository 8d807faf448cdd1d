#![no_main]
use std::sync::Arc;
use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use slabwatch_auditor::{
    AuditorConfig, Clock, LeakAuditor, ManualClock, NullSink, SlabPool, SlabView,
};

fuzz_target!(|data: &[u8]| {
    // Ops are 4-byte chunks: opcode, then a little-endian u16 argument.
    if data.len() < 4 {
        return;
    }

    let clock = Arc::new(ManualClock::new());
    let config = AuditorConfig {
        big_buffer_cutoff: 4096,
        leak_threshold: Duration::from_secs(10),
        report_interval: Duration::from_secs(15),
        ..AuditorConfig::default()
    };
    let Ok(auditor) = LeakAuditor::new(
        config,
        clock.clone(),
        Arc::new(NullSink),
        Box::new(std::io::sink()),
    ) else {
        return;
    };
    let pool_size = usize::from(data[0]) * 64;
    let Ok(mut alloc) = auditor.install(SlabPool::with_pool_size(pool_size)) else {
        return;
    };
    let mut held = Vec::new();

    for chunk in data[1..].chunks_exact(4) {
        let arg = u16::from_le_bytes([chunk[1], chunk[2]]);
        match chunk[0] % 6 {
            0 => {
                let buf = alloc.allocate(usize::from(arg) % 8192);
                assert!(buf.slab_len() >= buf.len());
                held.push(buf);
            }
            1 => {
                if !held.is_empty() {
                    let idx = usize::from(arg) % held.len();
                    drop(held.swap_remove(idx));
                }
            }
            2 => clock.advance(Duration::from_millis(u64::from(arg) * 10)),
            3 => {
                auditor.poll_at(clock.now());
            }
            4 => {
                let report = auditor.snapshot_report();
                assert!(report.slab_totals.count <= report.live_allocations);
                assert!(report.big_buffer_totals.count <= report.live_allocations);
            }
            _ => {
                if chunk[3] & 1 == 0 {
                    auditor.stop();
                    assert_eq!(auditor.pending_timers(), 0);
                    assert_eq!(auditor.live_allocations(), 0);
                    if let Ok(again) = auditor.install(SlabPool::with_pool_size(pool_size)) {
                        alloc = again;
                    }
                }
            }
        }

        let tracked = held.iter().filter(|b| b.is_tracked()).count();
        assert!(auditor.live_allocations() <= tracked);
        assert!(auditor.pending_timers() <= auditor.live_allocations());
    }

    auditor.stop();
    drop(held);
    assert_eq!(auditor.live_allocations(), 0);
});
