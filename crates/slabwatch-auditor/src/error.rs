//! Error types for the auditor.
//!
//! Only hook installation and configuration can fail in a way the host sees.
//! Call-site capture failures and registry anomalies are absorbed where they
//! happen and never become an `AuditError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("allocation hook is already installed on this auditor")]
    HookAlreadyInstalled,
    #[error("invalid auditor config: {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },
    #[error("report write failed: {0}")]
    ReportWrite(#[from] std::io::Error),
    #[error("event encode failed: {0}")]
    LogEncode(#[from] serde_json::Error),
}

impl AuditError {
    /// Stable short name used as the `error_kind` detail in log events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HookAlreadyInstalled => "hook_already_installed",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::ReportWrite(_) => "report_write",
            Self::LogEncode(_) => "log_encode",
        }
    }
}
