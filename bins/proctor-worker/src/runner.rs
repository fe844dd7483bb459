/// Language Runners - Pluggable Per-Language Commands
///
/// A runner knows how to turn a materialized submission into process
/// invocations for one language: the bare standalone run, and the harnessed
/// run that calls the target function per test case. It knows nothing about
/// sandboxing (engine's job) or scoring (evaluator's job).

use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::engine::ProcessSpec;
use proctor_common::types::Language;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Harness program shipped with a runner
#[derive(Debug, Clone, Copy)]
pub struct HarnessProgram {
    pub file_name: &'static str,
    pub source: &'static str,
}

pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> Language;

    /// Extension used when materializing the submission
    fn file_extension(&self) -> &str;

    fn memory_limit_mb(&self) -> u32;

    /// Run the submission standalone, with no harness
    fn bare_command(&self, unit: &Path) -> ProcessSpec;

    fn harness(&self) -> HarnessProgram;

    /// Run the harness against the submission. The harness payload is fed on stdin.
    fn harness_command(&self, harness: &Path, unit: &Path) -> ProcessSpec;
}

const PYTHON_HARNESS: HarnessProgram = HarnessProgram {
    file_name: "proctor_harness.py",
    source: include_str!("../harness/python_harness.py"),
};

#[derive(Debug, Clone)]
pub struct PythonRunner {
    interpreter: String,
    args: Vec<String>,
    file_extension: String,
    memory_limit_mb: u32,
}

impl PythonRunner {
    pub fn from_config(config: &LanguageConfig) -> Self {
        Self {
            interpreter: config.execution.command.clone(),
            args: config.execution.args.clone(),
            file_extension: config.execution.file_extension.clone(),
            memory_limit_mb: config.memory_limit_mb,
        }
    }

    fn command(&self, script: &Path, extra: &[&Path]) -> ProcessSpec {
        let mut args = self.args.clone();
        args.push(script.display().to_string());
        args.extend(extra.iter().map(|p| p.display().to_string()));
        ProcessSpec::new(&self.interpreter, args)
            .with_env("PYTHONDONTWRITEBYTECODE", "1")
            .with_env("PYTHONIOENCODING", "utf-8")
    }
}

impl LanguageRunner for PythonRunner {
    fn language(&self) -> Language {
        Language::Python
    }

    fn file_extension(&self) -> &str {
        &self.file_extension
    }

    fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    fn bare_command(&self, unit: &Path) -> ProcessSpec {
        self.command(unit, &[])
    }

    fn harness(&self) -> HarnessProgram {
        PYTHON_HARNESS
    }

    fn harness_command(&self, harness: &Path, unit: &Path) -> ProcessSpec {
        self.command(harness, &[unit])
    }
}

/// Runners available to the facade, keyed by language
#[derive(Clone, Default)]
pub struct RunnerSet {
    runners: HashMap<Language, Arc<dyn LanguageRunner>>,
}

impl RunnerSet {
    /// Build runners for every enabled language that has an implementation
    pub fn from_config(config_manager: &LanguageConfigManager) -> Self {
        let mut set = Self::default();
        for language in config_manager.enabled_languages() {
            let Ok(config) = config_manager.get_config(&language) else {
                continue;
            };
            match language {
                Language::Python => {
                    info!(
                        language = %language,
                        version = %config.version,
                        command = %config.execution.command,
                        "Runner registered"
                    );
                    set.register(Arc::new(PythonRunner::from_config(config)));
                }
                other => {
                    warn!(language = %other, "Language is configured but has no runner; submissions will be rejected");
                }
            }
        }
        set
    }

    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.insert(runner.language(), runner);
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageRunner>> {
        self.runners.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.runners.keys().copied().collect();
        languages.sort_by_key(|l| l.to_string());
        languages
    }
}
