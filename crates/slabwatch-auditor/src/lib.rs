//! Slab-aware allocation leak auditor.
//!
//! Finds buffers whose backing region ("slab") outlives the data they hold:
//! a 50-byte view that keeps an 8 KiB pool slab alive for hours. The auditor
//! sits in front of an allocation primitive, tracks allocations that are large
//! or disproportionately small for their slab, marks the ones still alive past
//! a threshold, and periodically reports leaked bytes ranked by call site.
//!
//! # Architecture
//!
//! - **Allocation hook** (`hook`): [`AuditedAllocator`] wraps the real
//!   primitive and hands back [`Tracked`] handles
//! - **Slab registry** (`registry`): live tracked retainers per slab
//! - **Lifecycle** (`lifecycle`): drop-driven, exactly-once finalization
//! - **Leak timers** (`timer`): one-shot deadline per tracked allocation
//! - **Reports** (`report`): normalized and raw attribution, big buffers
//! - **Auditor** (`auditor`): instance lifecycle, polling, activation
//! - **Slabs** (`slab`): the pooled slab primitive and its views
//! - **Configuration** (`config`), **events** (`log`), **metrics** (`metrics`)
//!
//! Detections are leak *candidates*, not proofs. The auditor never frees or
//! otherwise manages memory.

#![deny(unsafe_code)]

pub mod auditor;
pub mod callsite;
pub mod clock;
pub mod config;
pub mod error;
pub mod hook;
mod lifecycle;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod slab;
pub mod state;
pub mod timer;

pub use auditor::{
    Activation, AuditorDriver, LeakAuditor, PollOutcome, activate, activate_from_env,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AuditorConfig, CallSiteMode, auditor_enabled};
pub use error::AuditError;
pub use hook::{AuditedAllocator, Tracked};
pub use log::{EventSink, JsonlSink, LogEntry, LogLevel, MemorySink, NullSink};
pub use metrics::{AuditorMetrics, MetricsSnapshot};
pub use report::{BigBufferEntry, LeakReport, SharedBuffer, SlabLeakEntry};
pub use slab::{SlabAllocator, SlabBuf, SlabId, SlabPool, SlabView};
