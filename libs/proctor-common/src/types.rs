use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Languages the engine recognizes.
///
/// Recognizing a language does not mean it can be executed: only languages
/// with a registered runner are evaluated, the rest are reported as
/// unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Rust,
    JavaScript,
}

/// Case-insensitive, surrounding whitespace ignored
impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "rust" => Ok(Language::Rust),
            "javascript" | "js" => Ok(Language::JavaScript),
            _ => Err(anyhow!("Unknown language '{}'", name.trim())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Java => write!(f, "java"),
            Language::Rust => write!(f, "rust"),
            Language::JavaScript => write!(f, "javascript"),
        }
    }
}

/// Wire form of an evaluation request, as received from the request layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub language: String,
    pub source: String,
    pub question_id: u32,
}

/// A parsed evaluation request. Immutable once built.
#[derive(Debug, Clone)]
pub struct Submission {
    pub language: Language,
    pub source: String,
    pub question_id: u32,
}

/// One input/expected-output pair. Inputs are positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: Vec<Value>,
    pub expected: Value,
}

/// The cases registered for one question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCaseSet {
    pub function_name: String,
    pub cases: Vec<TestCase>,
}

impl TestCaseSet {
    /// The "run but do not score" set used for syntax-check-only requests
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.function_name.is_empty() && self.cases.is_empty()
    }
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ExitStatus {
    /// Exited normally with this code
    Code(i32),
    /// Terminated by this signal (not by us)
    Signal(i32),
    /// Killed by the runner after the wall-clock timeout
    Killed,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal(signal) => write!(f, "signal {}", signal),
            ExitStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Raw outcome of one sandboxed process run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Pass/fail/error outcome of one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub index: usize,
    pub input: Vec<Value>,
    pub expected: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    UnsupportedLanguage { language: String },
    LaunchFailure,
    RuntimeFailure { message: String },
    Evaluated,
}

/// Terminal artifact of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub outcome: Outcome,
    pub execution: Option<ExecutionResult>,
    pub case_results: Vec<CaseResult>,
    pub passed_count: usize,
    pub total_count: usize,
}

impl EvaluationReport {
    pub fn unsupported_language(language: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::UnsupportedLanguage {
                language: language.into(),
            },
            execution: None,
            case_results: Vec::new(),
            passed_count: 0,
            total_count: 0,
        }
    }

    pub fn launch_failure(execution: ExecutionResult, total_count: usize) -> Self {
        Self {
            outcome: Outcome::LaunchFailure,
            execution: Some(execution),
            case_results: Vec::new(),
            passed_count: 0,
            total_count,
        }
    }

    pub fn runtime_failure(
        message: impl Into<String>,
        execution: Option<ExecutionResult>,
        total_count: usize,
    ) -> Self {
        Self {
            outcome: Outcome::RuntimeFailure {
                message: message.into(),
            },
            execution,
            case_results: Vec::new(),
            passed_count: 0,
            total_count,
        }
    }

    /// Convert into the caller-facing envelope
    pub fn envelope(&self) -> Envelope {
        match &self.outcome {
            Outcome::UnsupportedLanguage { .. } => Envelope::UnsupportedLanguage,
            Outcome::LaunchFailure => {
                let execution = self.execution.as_ref();
                Envelope::LaunchFailure {
                    stdout: execution.map(|e| e.stdout.clone()).unwrap_or_default(),
                    stderr: execution.map(|e| e.stderr.clone()).unwrap_or_default(),
                    timed_out: execution.map(|e| e.timed_out).unwrap_or(false),
                }
            }
            Outcome::RuntimeFailure { message } => Envelope::RuntimeFailure {
                message: message.clone(),
            },
            Outcome::Evaluated => Envelope::Evaluated {
                passed: self.passed_count,
                total: self.total_count,
                results: self.case_results.clone(),
            },
        }
    }
}

/// Language-agnostic response contract of the evaluation facade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Envelope {
    Evaluated {
        passed: usize,
        total: usize,
        results: Vec<CaseResult>,
    },
    LaunchFailure {
        stdout: String,
        stderr: String,
        timed_out: bool,
    },
    RuntimeFailure {
        message: String,
    },
    UnsupportedLanguage,
}
