/// Test Evaluator - Language-Agnostic Scoring Logic
///
/// **Core Responsibility:**
/// Compare values returned by the submission against expected values and
/// tally the results.
///
/// **Critical Properties:**
/// - Knows nothing about processes or sandboxes
/// - Knows nothing about language runtimes
/// - Pure functions: (case, outcome) -> CaseResult, results -> counts
///
/// **Equality Rules (Applied to All Languages):**
/// - Scalars: equal when the same value
/// - Sequences: equal length and pairwise-equal elements, recursively
/// - Objects: same keys, equal values
/// - Numbers: compared by exact mathematical value, so `3 == 3.0`
/// - Integers: exact within 64 bits; the harness rejects wider ones
/// - Floating-point tolerance: NO (`0.1 + 0.2 != 0.3`)
/// - Booleans are not numbers: `true != 1`

use proctor_common::types::{CaseResult, TestCase};
use serde_json::{Number, Value};

/// What one call of the target function produced
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Returned(Value),
    Raised(String),
}

/// Structural equality between an actual and an expected value
pub fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => actual == expected,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (integer_value(a), integer_value(b)) {
        (Some(x), Some(y)) => x == y,
        (Some(x), None) => float_equals_integer(b.as_f64(), x),
        (None, Some(y)) => float_equals_integer(a.as_f64(), y),
        (None, None) => a.as_f64() == b.as_f64(),
    }
}

fn integer_value(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Exact comparison without routing the integer through f64
fn float_equals_integer(float: Option<f64>, integer: i128) -> bool {
    match float {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e20 => f as i128 == integer,
        _ => false,
    }
}

/// Evaluate a single test case outcome
pub fn evaluate_case(index: usize, case: &TestCase, outcome: CaseOutcome) -> CaseResult {
    match outcome {
        CaseOutcome::Returned(actual) => {
            let passed = values_equal(&actual, &case.expected);
            CaseResult {
                index,
                input: case.input.clone(),
                expected: case.expected.clone(),
                actual: Some(actual),
                error: None,
                passed,
            }
        }
        CaseOutcome::Raised(error) => CaseResult {
            index,
            input: case.input.clone(),
            expected: case.expected.clone(),
            actual: None,
            error: Some(error),
            passed: false,
        },
    }
}

/// Tally results into (passed_count, total_count)
pub fn aggregate(case_results: &[CaseResult]) -> (usize, usize) {
    let passed = case_results.iter().filter(|r| r.passed).count();
    (passed, case_results.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_case(input: Value, expected: Value) -> TestCase {
        TestCase {
            input: vec![input],
            expected,
        }
    }

    #[test]
    fn test_sequences_equal() {
        assert!(values_equal(&json!([1, 2, 3]), &json!([1, 2, 3])));
        assert!(!values_equal(&json!([1, 2, 3]), &json!([1, 2])));
        assert!(!values_equal(&json!([1, 2, 3]), &json!([3, 2, 1])));
        assert!(values_equal(&json!([[1, [2]], []]), &json!([[1, [2]], []])));
    }

    #[test]
    fn test_mixed_integer_float_is_equal() {
        // Pinned: numbers compare by value across int/float representations
        assert!(values_equal(&json!([1, 2, 3]), &json!([1, 2, 3.0])));
        assert!(values_equal(&json!(3.0), &json!(3)));
        assert!(!values_equal(&json!(3.5), &json!(3)));
    }

    #[test]
    fn test_no_float_tolerance() {
        assert!(!values_equal(&json!(0.1 + 0.2), &json!(0.3)));
        assert!(values_equal(&json!(0.25), &json!(0.25)));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = 9_007_199_254_740_993_i64; // 2^53 + 1
        assert!(!values_equal(&json!(big), &json!(9_007_199_254_740_992.0_f64)));
        assert!(values_equal(&json!(u64::MAX), &json!(u64::MAX)));
        assert!(!values_equal(&json!(-1), &json!(u64::MAX)));
    }

    #[test]
    fn test_scalars_and_types() {
        assert!(values_equal(&json!("abc"), &json!("abc")));
        assert!(!values_equal(&json!("1"), &json!(1)));
        assert!(!values_equal(&json!(true), &json!(1)));
        assert!(values_equal(&json!(null), &json!(null)));
        assert!(!values_equal(&json!(null), &json!(0)));
    }

    #[test]
    fn test_objects() {
        assert!(values_equal(&json!({"a": 1, "b": [2]}), &json!({"b": [2.0], "a": 1})));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_evaluate_case_pass_and_fail() {
        let case = make_case(json!([1, 2, 3, 4, 5]), json!(15));

        let pass = evaluate_case(0, &case, CaseOutcome::Returned(json!(15)));
        assert!(pass.passed);
        assert_eq!(pass.actual, Some(json!(15)));
        assert!(pass.error.is_none());

        let fail = evaluate_case(1, &case, CaseOutcome::Returned(json!(14)));
        assert!(!fail.passed);
        assert_eq!(fail.index, 1);
        assert_eq!(fail.input, vec![json!([1, 2, 3, 4, 5])]);
    }

    #[test]
    fn test_evaluate_case_error() {
        let case = make_case(json!([]), json!(0));
        let result = evaluate_case(2, &case, CaseOutcome::Raised("ValueError: empty".to_string()));

        assert!(!result.passed);
        assert!(result.actual.is_none());
        assert_eq!(result.error.as_deref(), Some("ValueError: empty"));
    }

    #[test]
    fn test_aggregate() {
        let case = make_case(json!([5]), json!(5));
        let results = vec![
            evaluate_case(0, &case, CaseOutcome::Returned(json!(5))),
            evaluate_case(1, &case, CaseOutcome::Returned(json!(4))),
            evaluate_case(2, &case, CaseOutcome::Raised("boom".into())),
        ];
        assert_eq!(aggregate(&results), (1, 3));
        assert_eq!(aggregate(&[]), (0, 0));
    }
}
