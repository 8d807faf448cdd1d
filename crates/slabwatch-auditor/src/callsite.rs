//! Call-site signatures for tracked allocations.
//!
//! A signature is captured synchronously when an allocation is tracked. Only
//! tracked allocations pay for it. Buckets key on a blake3 digest of the
//! signature so long backtrace text is stored once per site.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

use crate::config::CallSiteMode;

/// Signature used when no call site could be captured.
pub const UNKNOWN_CALL_SITE: &str = "<unknown call site>";

/// Symbol prefixes that never identify the host's call site.
const SKIPPED_FRAME_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "alloc::",
    "backtrace::",
    "__rust",
    "rust_begin_unwind",
    "slabwatch_auditor::",
    "<slabwatch_auditor::",
];

/// 128-bit digest of a call-site signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteId([u8; 16]);

impl CallSiteId {
    #[must_use]
    pub fn of(signature: &str) -> Self {
        let hash = blake3::hash(signature.as_bytes());
        let mut id = [0_u8; 16];
        id.copy_from_slice(&hash.as_bytes()[..16]);
        Self(id)
    }
}

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A captured signature and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub id: CallSiteId,
    pub signature: String,
    /// True when capture failed and the placeholder was used.
    pub fallback: bool,
}

impl CallSite {
    #[must_use]
    pub fn new(signature: impl Into<String>) -> Self {
        let signature = signature.into();
        Self {
            id: CallSiteId::of(&signature),
            signature,
            fallback: false,
        }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self {
            fallback: true,
            ..Self::new(UNKNOWN_CALL_SITE)
        }
    }

    /// Capture the call site of an allocation made at `caller`.
    #[must_use]
    pub fn capture(mode: CallSiteMode, depth: usize, caller: &Location<'_>) -> Self {
        match mode {
            CallSiteMode::Location => Self::new(format!(
                "{}:{}:{}",
                caller.file(),
                caller.line(),
                caller.column()
            )),
            CallSiteMode::Backtrace => {
                let backtrace = Backtrace::force_capture();
                if backtrace.status() != BacktraceStatus::Captured {
                    return Self::unknown();
                }
                signature_from_frames(&backtrace.to_string(), depth)
                    .map_or_else(Self::unknown, Self::new)
            }
        }
    }
}

/// Build a signature from a rendered backtrace: the first `depth` frames
/// that belong to neither the auditor nor the standard library, joined with
/// ` <- `. `None` when no such frame exists.
pub(crate) fn signature_from_frames(rendered: &str, depth: usize) -> Option<String> {
    let mut frames: Vec<String> = Vec::new();
    let mut lines = rendered.lines().peekable();

    while let Some(line) = lines.next() {
        let Some((index, symbol)) = line.trim_start().split_once(": ") else {
            continue;
        };
        if index.parse::<usize>().is_err() {
            continue;
        }
        let location = lines
            .peek()
            .and_then(|next| next.trim_start().strip_prefix("at "))
            .map(str::to_owned);
        if location.is_some() {
            lines.next();
        }

        let symbol = symbol.trim();
        if SKIPPED_FRAME_PREFIXES
            .iter()
            .any(|prefix| symbol.starts_with(prefix))
        {
            continue;
        }
        frames.push(match location {
            Some(at) => format!("{symbol} ({at})"),
            None => symbol.to_owned(),
        });
        if frames.len() >= depth.max(1) {
            break;
        }
    }

    (!frames.is_empty()).then(|| frames.join(" <- "))
}
