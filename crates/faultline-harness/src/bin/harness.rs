//! CLI entrypoint for the faultline scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use faultline_core::config::Disposition;
use faultline_harness::runner::failures;
use faultline_harness::scenarios::{self, Scenario};
use faultline_harness::structured_log::{ArtifactIndex, LogEmitter, validate_log_file};
use faultline_harness::{HarnessError, ScenarioRunner};

/// Fault-interception scenarios for faultline.
#[derive(Debug, Parser)]
#[command(name = "faultline-harness")]
#[command(about = "Run and validate faultline fault scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every known scenario.
    List,
    /// Run scenarios in-process and report results.
    Run {
        /// Scenario to run (repeatable). Runs all when omitted.
        #[arg(long)]
        scenario: Vec<String>,
        /// Disposition policy: `restore` or `armed`.
        #[arg(long, default_value = "restore")]
        disposition: String,
        /// Structured JSONL log output path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index JSON output path (requires `--log`).
        #[arg(long)]
        artifact_index: Option<PathBuf>,
        /// Run identifier embedded in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn parse_disposition(raw: &str) -> Result<Disposition, HarnessError> {
    match raw {
        "restore" => Ok(Disposition::RestoreDefault),
        "armed" => Ok(Disposition::StayArmed),
        other => Err(HarnessError::UnknownDisposition(other.to_string())),
    }
}

fn select(names: &[String]) -> Result<Vec<Scenario>, HarnessError> {
    if names.is_empty() {
        return Ok(scenarios::catalog());
    }
    names
        .iter()
        .map(|name| scenarios::find(name).ok_or_else(|| HarnessError::UnknownScenario(name.clone())))
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for scenario in scenarios::catalog() {
                println!("{:<24} {}", scenario.name, scenario.description);
            }
        }
        Command::Run {
            scenario,
            disposition,
            log,
            artifact_index,
            run_id,
        } => {
            let disposition = parse_disposition(&disposition)?;
            let selected = select(&scenario)?;
            let suite = "faultline-scenarios";
            let mut emitter = match &log {
                Some(path) => LogEmitter::to_file(path, suite, &run_id)?,
                None => LogEmitter::to_sink(suite, &run_id),
            };

            eprintln!(
                "Running {} scenario(s) with disposition '{}'",
                selected.len(),
                disposition.as_str()
            );
            let runner = ScenarioRunner::new(suite, disposition);
            let results = runner.run(&selected, &mut emitter)?;
            drop(emitter);

            for result in &results {
                let status = if result.passed { "PASS" } else { "FAIL" };
                println!(
                    "[{status}] {:<24} {:>8}us  {}",
                    result.name, result.duration_us, result.actual
                );
            }

            if let (Some(index_path), Some(log_path)) = (&artifact_index, &log) {
                let mut index = ArtifactIndex::new(&run_id, suite);
                index.add_file(log_path, "log")?;
                std::fs::write(index_path, index.to_json()?)?;
                eprintln!("Wrote artifact index to {}", index_path.display());
            }

            let failed = failures(&results);
            if failed > 0 {
                return Err(HarnessError::Failed {
                    failed,
                    total: results.len(),
                }
                .into());
            }
            eprintln!("All {} scenario(s) passed", results.len());
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog { path: log, errors }.into());
            }
            eprintln!("{} line(s) valid in {}", lines, log.display());
        }
    }

    Ok(())
}
