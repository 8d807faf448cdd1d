//! Structured JSONL event log for the auditor.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`EventSink`]: where the host wants records to go.
//! - [`JsonlSink`], [`MemorySink`], [`NullSink`]: stock sinks.
//!
//! This log is separate from the human-readable leak report, which goes to
//! its own report stream.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::AuditError;

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alloc_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_site: Option<String>,
    /// Stable error kind when the event reports a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only. An empty `trace_id`
    /// is filled in by the auditor when the entry is emitted.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            alloc_id: None,
            call_site: None,
            error_kind: None,
            message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_alloc(mut self, alloc_id: u64) -> Self {
        self.alloc_id = Some(alloc_id);
        self
    }

    #[must_use]
    pub fn with_call_site(mut self, call_site: impl Into<String>) -> Self {
        self.call_site = Some(call_site.into());
        self
    }

    /// Attach an error kind and its rendered message.
    #[must_use]
    pub fn with_error(mut self, kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind.into());
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, AuditError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for auditor events. Implementations must not panic and must
/// not block for long: they run on the auditor's single mutator context.
pub trait EventSink: Send + Sync {
    fn emit(&self, entry: LogEntry);
}

/// Writes one JSON object per line. Write failures are dropped; an entry
/// that fails to encode is replaced by a minimal line naming the failure.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
    min_level: LogLevel,
}

impl JsonlSink {
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>, min_level: LogLevel) -> Self {
        Self {
            writer: Mutex::new(writer),
            min_level,
        }
    }

    /// Info-and-above to stderr.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()), LogLevel::Info)
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, entry: LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        let line = entry
            .to_jsonl()
            .unwrap_or_else(|err| encode_failure_line(&entry, &err));
        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

fn encode_failure_line(entry: &LogEntry, err: &AuditError) -> String {
    serde_json::json!({
        "timestamp": entry.timestamp,
        "trace_id": entry.trace_id,
        "level": "error",
        "event": entry.event,
        "error_kind": err.kind(),
        "message": err.to_string(),
    })
    .to_string()
}

/// Keeps every entry in memory (for tests and the harness).
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Event names in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.event.clone()).collect()
    }

    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.event == event).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _entry: LogEntry) {}
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

/// Stamps trace ids (`slabwatch::<run>::<seq>`) and forwards to the sink.
pub(crate) struct EventLog {
    sink: Arc<dyn EventSink>,
    run_id: String,
    seq: AtomicU64,
}

impl EventLog {
    pub(crate) fn new(sink: Arc<dyn EventSink>, run_id: impl Into<String>) -> Self {
        Self {
            sink,
            run_id: run_id.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn entry(&self, level: LogLevel, event: &str) -> LogEntry {
        LogEntry::new(String::new(), level, event)
    }

    pub(crate) fn emit(&self, mut entry: LogEntry) {
        if entry.trace_id.is_empty() {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            entry.trace_id = format!("slabwatch::{}::{seq:03}", self.run_id);
        }
        self.sink.emit(entry);
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
#[must_use]
pub fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days(secs / 86_400);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}
