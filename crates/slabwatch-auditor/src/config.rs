//! Auditor configuration.
//!
//! The auditor is switched on by the `SLABWATCH_ENABLED` environment variable,
//! read once per process. Thresholds come from `SLABWATCH_*` variables and
//! fall back to defaults when absent or unparsable:
//! - `SLABWATCH_BIG_BUFFER_CUTOFF`: bytes at which one allocation is "big".
//! - `SLABWATCH_SLAB_RATIO`: K, track when `slab_len >= K * len`.
//! - `SLABWATCH_LEAK_THRESHOLD_SECS`: age at which a live allocation is a
//!   leak candidate.
//! - `SLABWATCH_REPORT_INTERVAL_SECS`: report cadence.
//! - `SLABWATCH_CALL_SITE`: `location` (default) or `backtrace`.
//! - `SLABWATCH_BACKTRACE_DEPTH`: frames kept in a backtrace signature.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::error::AuditError;

pub const DEFAULT_BIG_BUFFER_CUTOFF: usize = 64 * 1024;
pub const DEFAULT_SLAB_RATIO: usize = 10;
pub const DEFAULT_LEAK_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(90);
pub const DEFAULT_BACKTRACE_DEPTH: usize = 8;

/// How the call-site signature of a tracked allocation is captured.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSiteMode {
    /// `#[track_caller]` location of the `allocate` call. Cheap.
    #[default]
    Location,
    /// Symbolized stack trace. Expensive, paid only by tracked allocations.
    Backtrace,
}

impl CallSiteMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "backtrace" | "stack" | "full" => Self::Backtrace,
            _ => Self::Location,
        }
    }
}

/// Thresholds and cadence for one auditor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditorConfig {
    /// Allocations at least this long are tracked regardless of their slab.
    pub big_buffer_cutoff: usize,
    /// Allocations whose slab is at least `slab_ratio` times their length are tracked.
    pub slab_ratio: usize,
    /// Delay after which a still-live tracked allocation becomes a leak candidate.
    pub leak_threshold: Duration,
    /// Interval between two reports.
    pub report_interval: Duration,
    pub call_site: CallSiteMode,
    pub backtrace_depth: usize,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            big_buffer_cutoff: DEFAULT_BIG_BUFFER_CUTOFF,
            slab_ratio: DEFAULT_SLAB_RATIO,
            leak_threshold: DEFAULT_LEAK_THRESHOLD,
            report_interval: DEFAULT_REPORT_INTERVAL,
            call_site: CallSiteMode::default(),
            backtrace_depth: DEFAULT_BACKTRACE_DEPTH,
        }
    }
}

impl AuditorConfig {
    /// Build a config from `SLABWATCH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Missing or malformed
    /// values keep their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_usize = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let parse_secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        };

        Self {
            big_buffer_cutoff: parse_usize("SLABWATCH_BIG_BUFFER_CUTOFF")
                .unwrap_or(defaults.big_buffer_cutoff),
            slab_ratio: parse_usize("SLABWATCH_SLAB_RATIO").unwrap_or(defaults.slab_ratio),
            leak_threshold: parse_secs("SLABWATCH_LEAK_THRESHOLD_SECS")
                .unwrap_or(defaults.leak_threshold),
            report_interval: parse_secs("SLABWATCH_REPORT_INTERVAL_SECS")
                .unwrap_or(defaults.report_interval),
            call_site: lookup("SLABWATCH_CALL_SITE")
                .map(|v| CallSiteMode::from_str_loose(&v))
                .unwrap_or(defaults.call_site),
            backtrace_depth: parse_usize("SLABWATCH_BACKTRACE_DEPTH")
                .unwrap_or(defaults.backtrace_depth),
        }
    }

    /// Reject configurations the auditor cannot run with.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.big_buffer_cutoff == 0 {
            return Err(AuditError::InvalidConfig {
                field: "big_buffer_cutoff",
                reason: "must be non-zero",
            });
        }
        if self.slab_ratio == 0 {
            return Err(AuditError::InvalidConfig {
                field: "slab_ratio",
                reason: "must be non-zero",
            });
        }
        if self.leak_threshold.is_zero() {
            return Err(AuditError::InvalidConfig {
                field: "leak_threshold",
                reason: "must be non-zero",
            });
        }
        if self.report_interval.is_zero() {
            return Err(AuditError::InvalidConfig {
                field: "report_interval",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }

    /// Tracking predicate: individually large, or small relative to its slab.
    /// Empty views are never tracked.
    #[must_use]
    pub fn should_track(&self, len: usize, slab_len: usize) -> bool {
        if len == 0 {
            return false;
        }
        len >= self.big_buffer_cutoff || slab_len >= self.slab_ratio.saturating_mul(len)
    }
}

fn parse_enabled(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

// Atomic cache: 0=unresolved, 1=disabled, 2=enabled.
static CACHED_ENABLED: AtomicU8 = AtomicU8::new(0);

const FLAG_UNRESOLVED: u8 = 0;
const FLAG_DISABLED: u8 = 1;
const FLAG_ENABLED: u8 = 2;

/// Whether the auditor should be installed at all.
///
/// Reads `SLABWATCH_ENABLED` on first call and caches the answer for the rest
/// of the process. Two racing first calls read the same variable, so
/// whichever store wins carries the same value.
#[must_use]
pub fn auditor_enabled() -> bool {
    match CACHED_ENABLED.load(Ordering::Relaxed) {
        FLAG_ENABLED => true,
        FLAG_DISABLED => false,
        _ => {
            let enabled = std::env::var("SLABWATCH_ENABLED")
                .map(|v| parse_enabled(&v))
                .unwrap_or(false);
            let flag = if enabled { FLAG_ENABLED } else { FLAG_DISABLED };
            let _ = CACHED_ENABLED.compare_exchange(
                FLAG_UNRESOLVED,
                flag,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            enabled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AuditorConfig::default();
        assert_eq!(cfg.slab_ratio, 10);
        assert_eq!(cfg.leak_threshold, Duration::from_secs(60));
        assert_eq!(cfg.report_interval, Duration::from_secs(90));
        assert_eq!(cfg.call_site, CallSiteMode::Location);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn lookup_overrides_and_ignores_garbage() {
        let cfg = AuditorConfig::from_lookup(lookup_from(&[
            ("SLABWATCH_BIG_BUFFER_CUTOFF", "4000"),
            ("SLABWATCH_SLAB_RATIO", "not-a-number"),
            ("SLABWATCH_LEAK_THRESHOLD_SECS", " 5 "),
            ("SLABWATCH_CALL_SITE", "BACKTRACE"),
        ]));
        assert_eq!(cfg.big_buffer_cutoff, 4000);
        assert_eq!(cfg.slab_ratio, DEFAULT_SLAB_RATIO);
        assert_eq!(cfg.leak_threshold, Duration::from_secs(5));
        assert_eq!(cfg.report_interval, DEFAULT_REPORT_INTERVAL);
        assert_eq!(cfg.call_site, CallSiteMode::Backtrace);
    }

    #[test]
    fn call_site_mode_parsing() {
        assert_eq!(CallSiteMode::from_str_loose("location"), CallSiteMode::Location);
        assert_eq!(CallSiteMode::from_str_loose("stack"), CallSiteMode::Backtrace);
        assert_eq!(CallSiteMode::from_str_loose("bogus"), CallSiteMode::Location);
    }

    #[test]
    fn validate_rejects_zero_fields() {
        let cfg = AuditorConfig {
            slab_ratio: 0,
            ..AuditorConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(AuditError::InvalidConfig {
                field: "slab_ratio",
                ..
            })
        ));

        let cfg = AuditorConfig {
            report_interval: Duration::ZERO,
            ..AuditorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tracking_predicate() {
        let cfg = AuditorConfig {
            big_buffer_cutoff: 4000,
            ..AuditorConfig::default()
        };
        // 100 bytes out of a 100-byte region: neither big nor slab-sharing.
        assert!(!cfg.should_track(100, 100));
        // 50 bytes out of a 10_000-byte region: disproportionate.
        assert!(cfg.should_track(50, 10_000));
        // Exactly K times is tracked.
        assert!(cfg.should_track(100, 1000));
        assert!(!cfg.should_track(100, 999));
        // Big buffers are tracked even with no overhead.
        assert!(cfg.should_track(5000, 5000));
        assert!(!cfg.should_track(0, 8192));
    }

    #[test]
    fn enabled_flag_parsing() {
        assert!(parse_enabled("true"));
        assert!(parse_enabled(" TRUE\n"));
        assert!(parse_enabled("1"));
        assert!(!parse_enabled("false"));
        assert!(!parse_enabled(""));
        assert!(!parse_enabled("enabled-ish"));
    }

    #[test]
    fn enabled_flag_is_sticky_once_cached() {
        let previous = CACHED_ENABLED.swap(FLAG_ENABLED, Ordering::SeqCst);
        assert!(auditor_enabled());
        CACHED_ENABLED.store(FLAG_DISABLED, Ordering::SeqCst);
        assert!(!auditor_enabled());
        CACHED_ENABLED.store(previous, Ordering::SeqCst);
    }
}
