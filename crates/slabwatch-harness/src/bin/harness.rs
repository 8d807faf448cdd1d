//! CLI entrypoint for the slabwatch harness.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use slabwatch_auditor::{AuditorConfig, EventSink, JsonlSink, LogLevel, NullSink};
use slabwatch_harness::{ArtifactIndex, HarnessError, SimulationConfig, run_all, simulate};

/// Verification tooling for the slabwatch leak auditor.
#[derive(Debug, Parser)]
#[command(name = "slabwatch-harness")]
#[command(about = "Scenario runner and workload simulator for the slabwatch leak auditor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the named auditor scenarios and print one JSONL verdict each.
    Scenarios {
        /// Write verdicts here instead of stdout.
        #[arg(long)]
        jsonl: Option<PathBuf>,
    },
    /// Run the deterministic replication workload under the auditor.
    Simulate {
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long, default_value_t = 600)]
        steps: usize,
        /// Final leak report, as JSON.
        #[arg(long)]
        report_json: PathBuf,
        /// Artifact index path (defaults next to the report).
        #[arg(long)]
        artifact_index: Option<PathBuf>,
        /// Auditor event log (JSONL). Events are dropped when omitted.
        #[arg(long)]
        events: Option<PathBuf>,
        #[arg(long, default_value_t = 8 * 1024)]
        pool_size: usize,
        #[arg(long, default_value_t = 64 * 1024)]
        big_buffer_cutoff: usize,
        #[arg(long, default_value_t = 60)]
        leak_threshold_secs: u64,
        #[arg(long, default_value_t = 90)]
        report_interval_secs: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenarios { jsonl } => {
            let run_id = format!("scenarios-{}", std::process::id());
            let verdicts = run_all(&run_id);
            let mut body = String::new();
            for verdict in &verdicts {
                body.push_str(&verdict.to_jsonl()?);
                body.push('\n');
            }
            match &jsonl {
                Some(path) => {
                    std::fs::write(path, &body).map_err(|err| HarnessError::Write {
                        path: path.clone(),
                        source: err,
                    })?;
                    eprintln!("Wrote {} verdicts to {}", verdicts.len(), path.display());
                }
                None => std::io::stdout().write_all(body.as_bytes())?,
            }

            let failed = verdicts.iter().filter(|v| !v.passed()).count();
            eprintln!(
                "{} passed, {failed} failed",
                verdicts.len().saturating_sub(failed)
            );
            if failed > 0 {
                return Err(HarnessError::ScenariosFailed {
                    failed,
                    total: verdicts.len(),
                }
                .into());
            }
        }
        Command::Simulate {
            seed,
            steps,
            report_json,
            artifact_index,
            events,
            pool_size,
            big_buffer_cutoff,
            leak_threshold_secs,
            report_interval_secs,
        } => {
            let config = SimulationConfig {
                seed,
                steps,
                pool_size,
                auditor: AuditorConfig {
                    big_buffer_cutoff,
                    leak_threshold: Duration::from_secs(leak_threshold_secs),
                    report_interval: Duration::from_secs(report_interval_secs),
                    ..AuditorConfig::default()
                },
                ..SimulationConfig::default()
            };
            config.auditor.validate()?;

            let sink: Arc<dyn EventSink> = match &events {
                Some(path) => {
                    let file = std::fs::File::create(path).map_err(|err| HarnessError::Write {
                        path: path.clone(),
                        source: err,
                    })?;
                    Arc::new(JsonlSink::new(Box::new(file), LogLevel::Debug))
                }
                None => Arc::new(NullSink),
            };

            eprintln!("Simulating {steps} steps (seed={seed})");
            let run = simulate(&config, sink)?;
            eprint!("{}", run.report_text);

            let report = serde_json::to_string_pretty(&run.final_report)?;
            std::fs::write(&report_json, &report).map_err(|err| HarnessError::Write {
                path: report_json.clone(),
                source: err,
            })?;

            let mut index = ArtifactIndex::new(format!("simulate-{seed}-{steps}"));
            index.add(report_json.display().to_string(), "leak_report", report.as_bytes());
            let index_path =
                artifact_index.unwrap_or_else(|| report_json.with_extension("index.json"));
            index.write_to(&index_path)?;

            eprintln!(
                "{} periodic reports, {} slab leaks, {} big buffers; wrote {} and {}",
                run.periodic_reports,
                run.final_report.slab_totals.count,
                run.final_report.big_buffer_totals.count,
                report_json.display(),
                index_path.display()
            );
        }
    }

    Ok(())
}
