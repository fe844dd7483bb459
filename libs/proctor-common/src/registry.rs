use crate::types::{TestCase, TestCaseSet};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Question id reserved for "run the code, score nothing"
pub const SYNTAX_CHECK_QUESTION_ID: u32 = 0;

#[derive(Debug, Serialize, Deserialize)]
struct QuestionsJson {
    questions: Vec<QuestionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuestionEntry {
    id: u32,
    function_name: String,
    cases: Vec<CaseEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CaseEntry {
    input: Value,
    expected: Value,
}

/// Result of a registry lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a TestCaseSet),
    NotFound,
}

/// Read-only mapping from question id to the cases a submission is scored on.
///
/// Populated once at startup; there is no runtime registration.
#[derive(Debug, Clone)]
pub struct TestCaseRegistry {
    sets: HashMap<u32, TestCaseSet>,
    syntax_check: TestCaseSet,
}

impl TestCaseRegistry {
    /// Load questions from a questions.json file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Questions file not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid questions file {}", path.display()))
    }

    /// Load from `<dir>/questions.json`, or fall back to the built-in set
    pub fn load_or_builtin(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("questions.json");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: QuestionsJson =
            serde_json::from_str(content).context("Failed to parse questions JSON")?;

        let mut sets = HashMap::new();
        for question in parsed.questions {
            if question.id == SYNTAX_CHECK_QUESTION_ID {
                bail!("Question id {} is reserved for syntax checks", SYNTAX_CHECK_QUESTION_ID);
            }
            if !is_identifier(&question.function_name) {
                bail!(
                    "Question {}: '{}' is not a valid function name",
                    question.id,
                    question.function_name
                );
            }

            let mut cases = Vec::with_capacity(question.cases.len());
            for (idx, case) in question.cases.into_iter().enumerate() {
                let input = match case.input {
                    Value::Array(args) => args,
                    other => bail!(
                        "Question {} case {}: input must be an array of arguments, got {}",
                        question.id,
                        idx,
                        other
                    ),
                };
                cases.push(TestCase {
                    input,
                    expected: case.expected,
                });
            }

            let set = TestCaseSet {
                function_name: question.function_name,
                cases,
            };
            if sets.insert(question.id, set).is_some() {
                bail!("Duplicate question id {}", question.id);
            }
        }

        Ok(Self {
            sets,
            syntax_check: TestCaseSet::empty(),
        })
    }

    /// Registry shipped with the engine
    pub fn builtin() -> Self {
        let max_subarray_sum = TestCaseSet {
            function_name: "max_subarray_sum".to_string(),
            cases: vec![
                case(json!([[1, 2, 3, 4, 5]]), json!(15)),
                case(json!([[-2, 1, -3, 4, -1, 2, 1, -5, 4]]), json!(6)),
                case(json!([[-1, -2, -3, -4]]), json!(-1)),
                case(json!([[5]]), json!(5)),
            ],
        };

        let mut sets = HashMap::new();
        sets.insert(1, max_subarray_sum);

        Self {
            sets,
            syntax_check: TestCaseSet::empty(),
        }
    }

    pub fn lookup(&self, question_id: u32) -> Lookup<'_> {
        if question_id == SYNTAX_CHECK_QUESTION_ID {
            return Lookup::Found(&self.syntax_check);
        }
        match self.sets.get(&question_id) {
            Some(set) => Lookup::Found(set),
            None => Lookup::NotFound,
        }
    }

    /// Registered question ids, sorted
    pub fn question_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.sets.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn case(input: Value, expected: Value) -> TestCase {
    let input = match input {
        Value::Array(args) => args,
        other => vec![other],
    };
    TestCase { input, expected }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_has_max_subarray_sum() {
        let registry = TestCaseRegistry::builtin();
        match registry.lookup(1) {
            Lookup::Found(set) => {
                assert_eq!(set.function_name, "max_subarray_sum");
                assert_eq!(set.cases.len(), 4);
                assert_eq!(set.cases[1].input, vec![json!([-2, 1, -3, 4, -1, 2, 1, -5, 4])]);
                assert_eq!(set.cases[2].expected, json!(-1));
            }
            Lookup::NotFound => panic!("question 1 should be registered"),
        }
    }

    #[test]
    fn test_sentinel_maps_to_empty_set() {
        let registry = TestCaseRegistry::builtin();
        match registry.lookup(SYNTAX_CHECK_QUESTION_ID) {
            Lookup::Found(set) => assert!(set.is_empty()),
            Lookup::NotFound => panic!("sentinel must resolve"),
        }
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let registry = TestCaseRegistry::builtin();
        assert_eq!(registry.lookup(42), Lookup::NotFound);
    }

    #[test]
    fn test_from_json() {
        let registry = TestCaseRegistry::from_json(
            r#"{"questions": [
                {"id": 7, "function_name": "add", "cases": [
                    {"input": [1, 2], "expected": 3},
                    {"input": ["a", "b"], "expected": "ab"}
                ]},
                {"id": 3, "function_name": "noop", "cases": []}
            ]}"#,
        )
        .unwrap();

        assert_eq!(registry.question_ids(), vec![3, 7]);
        let Lookup::Found(set) = registry.lookup(7) else {
            panic!("question 7 missing");
        };
        assert_eq!(set.cases[0].input, vec![json!(1), json!(2)]);
        assert_eq!(set.cases[1].expected, json!("ab"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let err = TestCaseRegistry::from_json(
            r#"{"questions": [
                {"id": 2, "function_name": "a", "cases": []},
                {"id": 2, "function_name": "b", "cases": []}
            ]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Duplicate question id 2"));
    }

    #[test]
    fn test_rejects_reserved_id_and_bad_names() {
        assert!(TestCaseRegistry::from_json(
            r#"{"questions": [{"id": 0, "function_name": "a", "cases": []}]}"#
        )
        .is_err());
        assert!(TestCaseRegistry::from_json(
            r#"{"questions": [{"id": 1, "function_name": "1abc", "cases": []}]}"#
        )
        .is_err());
        assert!(TestCaseRegistry::from_json(
            r#"{"questions": [{"id": 1, "function_name": "f", "cases": [{"input": 5, "expected": 5}]}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_identifier_check() {
        assert!(is_identifier("max_subarray_sum"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("has-dash"));
        assert!(!is_identifier("two words"));
    }
}
