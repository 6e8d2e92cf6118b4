//! Scenario execution engine.

use std::time::Instant;

use faultline_core::config::{self, Disposition};
use faultline_core::{FaultKind, FaultReport, RuntimeError, Value};
use faultline_guard::signal;

use crate::error::HarnessError;
use crate::scenarios::Scenario;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

/// Outcome of one scenario under one disposition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    /// Short rendering of what the scenario actually produced.
    pub actual: String,
    pub fault: Option<FaultReport>,
    /// Whether the handler table was in the expected state afterwards.
    pub dispositions_ok: bool,
    pub duration_us: u64,
}

/// Runs scenarios under a fixed disposition and logs each result.
pub struct ScenarioRunner {
    /// Name of the run, used as the log suite.
    pub suite: String,
    pub disposition: Disposition,
}

impl ScenarioRunner {
    #[must_use]
    pub fn new(suite: impl Into<String>, disposition: Disposition) -> Self {
        Self {
            suite: suite.into(),
            disposition,
        }
    }

    /// Run `scenarios` in order. The process-wide disposition is switched
    /// for the run and put back afterwards.
    pub fn run(
        &self,
        scenarios: &[Scenario],
        log: &mut LogEmitter,
    ) -> Result<Vec<ScenarioResult>, HarnessError> {
        log.emit(LogLevel::Info, "run_start")?;
        let previous = config::set_disposition(self.disposition);
        let results = self.run_all(scenarios, log);
        config::set_disposition(previous);
        if !self.disposition.restores_between_calls() {
            signal::restore_all()?;
        }
        let results = results?;

        let failed = failures(&results);
        let level = if failed == 0 { LogLevel::Info } else { LogLevel::Error };
        log.emit_entry(
            LogEntry::new("", level, "run_summary")
                .with_disposition(self.disposition.as_str())
                .with_details(serde_json::json!({
                    "total": results.len(),
                    "failed": failed,
                })),
        )?;
        log.flush()?;
        Ok(results)
    }

    fn run_all(
        &self,
        scenarios: &[Scenario],
        log: &mut LogEmitter,
    ) -> Result<Vec<ScenarioResult>, HarnessError> {
        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let result = self.run_one(scenario)?;
            log.emit_entry(self.entry_for(&result))?;
            results.push(result);
        }
        Ok(results)
    }

    fn run_one(&self, scenario: &Scenario) -> Result<ScenarioResult, HarnessError> {
        let before = snapshot_actions()?;
        let start = Instant::now();
        let outcome = scenario.run();
        let duration_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let after = snapshot_actions()?;

        let dispositions_ok = if self.disposition.restores_between_calls() {
            before == after
        } else {
            FaultKind::ALL.iter().all(|kind| signal::owns(*kind))
        };

        Ok(ScenarioResult {
            name: scenario.name.to_string(),
            passed: scenario.matches(&outcome) && dispositions_ok,
            actual: render(&outcome),
            fault: outcome.as_ref().err().and_then(RuntimeError::as_fault).cloned(),
            dispositions_ok,
            duration_us,
        })
    }

    fn entry_for(&self, result: &ScenarioResult) -> LogEntry {
        let (level, outcome) = if result.passed {
            (LogLevel::Info, Outcome::Pass)
        } else {
            (LogLevel::Error, Outcome::Fail)
        };
        let mut entry = LogEntry::new("", level, "scenario_result")
            .with_suite(&self.suite)
            .with_scenario(&result.name)
            .with_disposition(self.disposition.as_str())
            .with_outcome(outcome)
            .with_duration_us(result.duration_us)
            .with_details(serde_json::json!({
                "actual": result.actual,
                "dispositions_ok": result.dispositions_ok,
            }));
        if let Some(report) = &result.fault {
            entry = entry.with_fault(report);
        }
        entry
    }
}

fn snapshot_actions() -> Result<Vec<usize>, HarnessError> {
    FaultKind::ALL
        .iter()
        .map(|kind| signal::current_action(*kind).map_err(HarnessError::from))
        .collect()
}

fn render(outcome: &Result<Value, RuntimeError>) -> String {
    match outcome {
        Ok(value) => format!("returned {value:?}"),
        Err(err) => format!("error: {err}"),
    }
}

/// Count of failed results.
#[must_use]
pub fn failures(results: &[ScenarioResult]) -> usize {
    results.iter().filter(|r| !r.passed).count()
}
