//! JSONL verdict records for scenario runs.

use serde::{Deserialize, Serialize};
use slabwatch_auditor::log::now_utc;

/// Scenario outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// One scenario result, one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioVerdict {
    pub timestamp: String,
    /// `harness::<run>::<seq>`
    pub trace_id: String,
    pub scenario: String,
    pub outcome: Outcome,
    /// What was checked, or why it failed.
    pub detail: String,
}

impl ScenarioVerdict {
    #[must_use]
    pub fn new(
        trace_id: impl Into<String>,
        scenario: impl Into<String>,
        outcome: Outcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            scenario: scenario.into(),
            outcome,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
