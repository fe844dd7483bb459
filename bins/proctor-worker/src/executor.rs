/// Evaluation Facade - High-Level Orchestration
///
/// **Responsibility:**
/// Single entry point: (language, source, question id) -> EvaluationReport.
///
/// **State machine:**
/// 1. Received: unknown or runner-less language -> UnsupportedLanguage
///    (no sandbox, no pool slot)
/// 2. LaunchCheck: bare run in a fresh sandbox; non-zero exit or timeout ->
///    LaunchFailure
/// 3. Lookup + invoke: unknown question or missing function -> RuntimeFailure,
///    a timeout before the submission finished loading -> LaunchFailure,
///    otherwise Evaluated
///
/// The bare run exists so a syntax or import error is reported separately
/// from "function missing" or "function wrong".
///
/// This module is the glue layer - it knows nothing about:
/// - How processes are sandboxed (engine's job)
/// - How a language is launched (runner's job)
/// - How values are compared (evaluator's job)

use crate::engine::{SandboxLimits, SandboxPool};
use crate::error::EvalError;
use crate::evaluator;
use crate::invoker::{self, Classification};
use crate::runner::{LanguageRunner, RunnerSet};
use proctor_common::config::EngineConfig;
use proctor_common::registry::{Lookup, TestCaseRegistry};
use proctor_common::types::{
    EvaluationReport, EvaluationRequest, Language, Outcome, Submission,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct Proctor {
    registry: Arc<TestCaseRegistry>,
    runners: RunnerSet,
    pool: SandboxPool,
    config: EngineConfig,
}

impl Proctor {
    pub fn new(registry: Arc<TestCaseRegistry>, runners: RunnerSet, config: EngineConfig) -> Self {
        let pool = SandboxPool::new(config.max_concurrent_sandboxes, config.queue_wait);
        Self {
            registry,
            runners,
            pool,
            config,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Evaluate a wire-level request
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationReport, EvalError> {
        let Ok(language) = request.language.parse::<Language>() else {
            info!(language = %request.language, "Unsupported language");
            return Ok(EvaluationReport::unsupported_language(request.language.clone()));
        };

        let submission = Submission {
            language,
            source: request.source.clone(),
            question_id: request.question_id,
        };
        self.evaluate_submission(&submission).await
    }

    /// Evaluate unless `cancelled` resolves first.
    ///
    /// On cancellation the in-flight sandbox is torn down and `Ok(None)` is
    /// returned; partial results are discarded.
    pub async fn evaluate_until<F>(
        &self,
        request: &EvaluationRequest,
        cancelled: F,
    ) -> Result<Option<EvaluationReport>, EvalError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            report = self.evaluate(request) => report.map(Some),
            _ = cancelled => {
                warn!(question_id = request.question_id, "Evaluation cancelled by caller");
                Ok(None)
            }
        }
    }

    #[instrument(
        skip(self, submission),
        fields(
            evaluation_id = %Uuid::new_v4(),
            language = %submission.language,
            question_id = submission.question_id,
            source_size = submission.source.len()
        )
    )]
    pub async fn evaluate_submission(&self, submission: &Submission) -> Result<EvaluationReport, EvalError> {
        let Some(runner) = self.runners.get(submission.language) else {
            info!("No runner for language; rejecting");
            return Ok(EvaluationReport::unsupported_language(submission.language.to_string()));
        };

        if submission.source.len() > self.config.max_source_bytes {
            return Err(EvalError::SourceTooLarge {
                size: submission.source.len(),
                limit: self.config.max_source_bytes,
            });
        }

        let start = Instant::now();
        let report = self.run_phases(submission, runner.as_ref()).await?;

        info!(
            outcome = outcome_name(&report.outcome),
            passed = report.passed_count,
            total = report.total_count,
            execution_ms = start.elapsed().as_millis() as u64,
            "Evaluation completed"
        );

        Ok(report)
    }

    async fn run_phases(
        &self,
        submission: &Submission,
        runner: &dyn LanguageRunner,
    ) -> Result<EvaluationReport, EvalError> {
        let lookup = self.registry.lookup(submission.question_id);
        let expected_total = match lookup {
            Lookup::Found(set) => set.cases.len(),
            Lookup::NotFound => 0,
        };

        let limits = SandboxLimits {
            timeout: self.config.timeout,
            memory_limit_mb: runner.memory_limit_mb(),
            max_output_bytes: self.config.max_output_bytes,
        };

        // The lease lives until this function returns, on every path
        let lease = self.pool.acquire().await?;
        debug!(sandbox_id = %lease.id(), "Running submission");

        let unit_name = format!("submission.{}", runner.file_extension());
        let unit = lease
            .materialize(&unit_name, submission.source.as_bytes())
            .await?;

        // Phase 1: bare run
        let bare = lease.run(&runner.bare_command(&unit), &limits).await?;
        if bare.timed_out || !bare.exit_status.success() {
            warn!(
                exit_status = %bare.exit_status,
                timed_out = bare.timed_out,
                "Submission failed to run standalone"
            );
            return Ok(EvaluationReport::launch_failure(bare, expected_total));
        }

        // Phase 2: harnessed run
        let set = match lookup {
            Lookup::Found(set) => set,
            Lookup::NotFound => {
                return Ok(EvaluationReport::runtime_failure(
                    format!("No test cases defined for question ID {}", submission.question_id),
                    Some(bare),
                    0,
                ));
            }
        };

        if set.is_empty() {
            return Ok(EvaluationReport {
                outcome: Outcome::Evaluated,
                execution: Some(bare),
                case_results: Vec::new(),
                passed_count: 0,
                total_count: 0,
            });
        }

        let invocation = invoker::invoke(&lease, runner, &unit, set, &limits).await?;

        match invocation.classification {
            Classification::LoadTimedOut => {
                warn!("Timed out loading the submission under the harness");
                Ok(EvaluationReport::launch_failure(invocation.execution, set.cases.len()))
            }
            Classification::RuntimeFailure(message) => {
                warn!(message = %message, "Harness-level failure");
                Ok(EvaluationReport::runtime_failure(
                    message,
                    Some(invocation.execution),
                    set.cases.len(),
                ))
            }
            Classification::Completed => {
                let (passed_count, _) = evaluator::aggregate(&invocation.case_results);
                Ok(EvaluationReport {
                    outcome: Outcome::Evaluated,
                    execution: Some(invocation.execution),
                    case_results: invocation.case_results,
                    passed_count,
                    total_count: set.cases.len(),
                })
            }
        }
    }
}

fn outcome_name(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::UnsupportedLanguage { .. } => "unsupported_language",
        Outcome::LaunchFailure => "launch_failure",
        Outcome::RuntimeFailure { .. } => "runtime_failure",
        Outcome::Evaluated => "evaluated",
    }
}
