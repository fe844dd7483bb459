/// Function Invoker - Harnessed Per-Case Calls
///
/// Runs the language harness inside the submission's sandbox. The harness
/// loads the submission as a module, resolves the target function and calls
/// it once per case, reporting each call as a marker-prefixed JSON record on
/// stdout. The host only ever sees those records; submitted code never enters
/// this process.
///
/// The harness writes records through a private copy of stdout and points
/// fd 1 at stderr before loading the submission, so ordinary prints cannot
/// reach the record stream. Two different records for the same case are
/// treated as tampering and fail that case.
///
/// Expected values stay on the host side: the harness receives inputs only.

use crate::engine::{SandboxLease, SandboxLimits};
use crate::evaluator::{evaluate_case, CaseOutcome};
use crate::runner::LanguageRunner;
use anyhow::{Context, Result};
use proctor_common::types::{CaseResult, ExecutionResult, TestCaseSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// How the harnessed run went as a whole
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Every case has a result (possibly an error)
    Completed,
    /// Harness-level fault, no case attempted
    RuntimeFailure(String),
    /// The time limit ran out before the submission finished loading
    LoadTimedOut,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub case_results: Vec<CaseResult>,
    pub classification: Classification,
    pub execution: ExecutionResult,
}

#[derive(Debug, Serialize)]
struct HarnessPayload<'a> {
    marker: &'a str,
    function_name: &'a str,
    cases: Vec<HarnessCase<'a>>,
}

#[derive(Debug, Serialize)]
struct HarnessCase<'a> {
    input: &'a [Value],
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HarnessRecord {
    Ready {
        cases: usize,
    },
    LoadError {
        message: String,
    },
    MissingFunction {
        function: String,
    },
    Case {
        index: usize,
        ok: bool,
        #[serde(default)]
        actual: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

const CONFLICTING_RECORDS: &str = "Conflicting results reported for this case";

/// Call the target function for every case, inside the sandbox
pub async fn invoke(
    lease: &SandboxLease,
    runner: &dyn LanguageRunner,
    unit: &Path,
    set: &TestCaseSet,
    limits: &SandboxLimits,
) -> Result<Invocation> {
    let harness = runner.harness();
    let harness_path = lease
        .materialize(harness.file_name, harness.source.as_bytes())
        .await?;

    // Fresh per run so records cannot be predicted from outside the sandbox
    let marker = format!("@@proctor-{}@@ ", Uuid::new_v4().simple());
    let payload = HarnessPayload {
        marker: &marker,
        function_name: &set.function_name,
        cases: set
            .cases
            .iter()
            .map(|case| HarnessCase { input: &case.input })
            .collect(),
    };
    let payload = serde_json::to_vec(&payload).context("Failed to encode harness payload")?;

    let spec = runner.harness_command(&harness_path, unit).with_stdin(payload);
    let execution = lease.run(&spec, limits).await?;

    let (case_results, classification) = interpret(&execution, &marker, set, limits);
    Ok(Invocation {
        case_results,
        classification,
        execution,
    })
}

fn parse_records(stdout: &str, marker: &str) -> Vec<HarnessRecord> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix(marker))
        .filter_map(|record| match serde_json::from_str::<HarnessRecord>(record) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Discarding malformed harness record");
                None
            }
        })
        .collect()
}

/// Turn the harness output into one CaseResult per case, or a runtime failure
fn interpret(
    execution: &ExecutionResult,
    marker: &str,
    set: &TestCaseSet,
    limits: &SandboxLimits,
) -> (Vec<CaseResult>, Classification) {
    let records = parse_records(&execution.stdout, marker);

    let mut ready = false;
    let mut outcomes: HashMap<usize, CaseOutcome> = HashMap::new();
    for record in records {
        match record {
            HarnessRecord::LoadError { message } => {
                return (
                    Vec::new(),
                    Classification::RuntimeFailure(format!("Error loading your code: {}", message)),
                );
            }
            HarnessRecord::MissingFunction { function } => {
                return (
                    Vec::new(),
                    Classification::RuntimeFailure(format!(
                        "Function '{}' not found in your code",
                        function
                    )),
                );
            }
            HarnessRecord::Ready { cases } => {
                if cases != set.cases.len() {
                    warn!(reported = cases, expected = set.cases.len(), "Harness case count mismatch");
                }
                ready = true;
            }
            HarnessRecord::Case {
                index,
                ok,
                actual,
                error,
            } => {
                if index >= set.cases.len() {
                    warn!(index, "Harness reported a case that does not exist");
                    continue;
                }
                let outcome = if ok {
                    CaseOutcome::Returned(actual)
                } else {
                    CaseOutcome::Raised(error.unwrap_or_else(|| "Unknown error".to_string()))
                };
                match outcomes.get(&index) {
                    None => {
                        outcomes.insert(index, outcome);
                    }
                    Some(seen) if *seen == outcome => {}
                    Some(_) => {
                        warn!(index, "Conflicting records for one case");
                        outcomes.insert(index, CaseOutcome::Raised(CONFLICTING_RECORDS.to_string()));
                    }
                }
            }
        }
    }

    if !ready {
        if execution.timed_out {
            return (Vec::new(), Classification::LoadTimedOut);
        }
        warn!(
            exit_status = %execution.exit_status,
            stderr_tail = tail(&execution.stderr),
            "Harness produced no result"
        );
        let message = format!("Harness produced no result ({})", execution.exit_status);
        return (Vec::new(), Classification::RuntimeFailure(message));
    }

    let mut interrupted = false;
    let case_results = set
        .cases
        .iter()
        .enumerate()
        .map(|(index, case)| {
            let outcome = match outcomes.remove(&index) {
                Some(outcome) => outcome,
                None if !interrupted => {
                    interrupted = true;
                    CaseOutcome::Raised(interruption_message(execution, limits))
                }
                None => CaseOutcome::Raised(
                    "Not executed: sandbox terminated before this case ran".to_string(),
                ),
            };
            evaluate_case(index, case, outcome)
        })
        .collect::<Vec<_>>();

    debug!(
        cases = case_results.len(),
        interrupted,
        "Harness results interpreted"
    );

    (case_results, Classification::Completed)
}

fn interruption_message(execution: &ExecutionResult, limits: &SandboxLimits) -> String {
    if execution.timed_out {
        format!("Execution timed out after {}s", limits.timeout.as_secs())
    } else if execution.exit_status.success() {
        "No result reported for this case".to_string()
    } else {
        format!("Sandbox exited unexpectedly ({})", execution.exit_status)
    }
}

fn tail(text: &str) -> &str {
    let line = text.lines().rev().find(|l| !l.trim().is_empty());
    line.unwrap_or("")
}
