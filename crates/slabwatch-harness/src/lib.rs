//! Verification harness for the slabwatch leak auditor.
//!
//! - **Scenarios** (`scenarios`): the auditor's core guarantees as named,
//!   self-contained checks with JSONL verdicts
//! - **Workload** (`workload`): a deterministic replication-like simulator
//! - **Artifacts** (`artifact`): SHA-256 indexed run outputs

pub mod artifact;
pub mod error;
pub mod scenarios;
pub mod verdict;
pub mod workload;

pub use artifact::{ArtifactEntry, ArtifactIndex, sha256_hex};
pub use error::HarnessError;
pub use scenarios::{SCENARIOS, Scenario, run_all};
pub use verdict::{Outcome, ScenarioVerdict};
pub use workload::{SimulationConfig, SimulationRun, XorShift64, simulate};
