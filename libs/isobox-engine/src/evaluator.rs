//! Testcase scoring. Pure: a RunResult plus the testcase in, a verdict out.
//!
//! Normalization trims trailing whitespace only. Leading and internal
//! whitespace, blank lines between content and case are all significant.

use isobox_common::types::{ExpectedOutput, RunOutcome, RunResult, TestStatus, Testcase, TestcaseResult};

pub fn normalize_output(output: &str) -> &str {
    output.trim_end()
}

/// True when `actual` equals any acceptable output after normalization.
pub fn matches_expected(actual: &str, expected: &ExpectedOutput) -> bool {
    let actual = normalize_output(actual);
    expected
        .candidates()
        .iter()
        .any(|candidate| normalize_output(candidate) == actual)
}

/// Score one run against its testcase. Without an expected output the run
/// passes when it finished cleanly.
pub fn evaluate_testcase(testcase: &Testcase, run: RunResult) -> TestcaseResult {
    let passed = match &testcase.expected_output {
        Some(expected) => matches_expected(&run.stdout, expected),
        None => run.outcome == RunOutcome::Success,
    };

    TestcaseResult {
        id: testcase.id.clone(),
        input: testcase.input.clone(),
        expected_output: testcase.expected_output.clone(),
        actual_output: run.stdout.clone(),
        passed,
        status: if passed { TestStatus::Passed } else { TestStatus::Failed },
        run: Some(run),
    }
}

/// The compile stage failed, so this testcase never ran.
pub fn compile_failed(testcase: &Testcase) -> TestcaseResult {
    not_run(testcase, TestStatus::CompileError)
}

/// The job was cancelled or aborted before this testcase started.
pub fn skipped(testcase: &Testcase) -> TestcaseResult {
    not_run(testcase, TestStatus::Skipped)
}

fn not_run(testcase: &Testcase, status: TestStatus) -> TestcaseResult {
    TestcaseResult {
        id: testcase.id.clone(),
        input: testcase.input.clone(),
        expected_output: testcase.expected_output.clone(),
        actual_output: String::new(),
        passed: false,
        status,
        run: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_result;

    fn make_testcase(id: &str, expected: Option<ExpectedOutput>) -> Testcase {
        Testcase {
            id: id.to_string(),
            input: "input".to_string(),
            expected_output: expected,
        }
    }

    fn one(s: &str) -> Option<ExpectedOutput> {
        Some(ExpectedOutput::One(s.to_string()))
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello \r\n\t"), "hello");
        assert_eq!(normalize_output("  hello"), "  hello");
        assert_eq!(normalize_output("a  b\n\nc\n"), "a  b\n\nc");
        assert_eq!(normalize_output("   "), "");
    }

    #[test]
    fn test_exact_match() {
        let tc = make_testcase("1", one("120"));
        let result = evaluate_testcase(&tc, run_result("120\n", RunOutcome::Success));
        assert!(result.passed);
        assert_eq!(result.status, TestStatus::Passed);
        assert_eq!(result.actual_output, "120\n");
        assert_eq!(result.run.unwrap().exit_code, Some(0));
    }

    #[test]
    fn test_leading_whitespace_is_significant() {
        let tc = make_testcase("1", one("hello"));
        let result = evaluate_testcase(&tc, run_result("  hello", RunOutcome::Success));
        assert!(!result.passed);
        assert_eq!(result.status, TestStatus::Failed);
    }

    #[test]
    fn test_case_sensitive() {
        let tc = make_testcase("1", one("Hello"));
        assert!(!evaluate_testcase(&tc, run_result("hello", RunOutcome::Success)).passed);
    }

    #[test]
    fn test_any_of_expected() {
        let expected = Some(ExpectedOutput::AnyOf(vec!["YES".to_string(), "yes".to_string()]));
        let tc = make_testcase("1", expected);
        assert!(evaluate_testcase(&tc, run_result("yes\n", RunOutcome::Success)).passed);
        assert!(!evaluate_testcase(&tc, run_result("Yes\n", RunOutcome::Success)).passed);
    }

    #[test]
    fn test_expected_trailing_whitespace_ignored() {
        let tc = make_testcase("1", one("World\n\n"));
        assert!(evaluate_testcase(&tc, run_result("World", RunOutcome::Success)).passed);
    }

    #[test]
    fn test_output_compared_even_after_runtime_error() {
        // A program may print the right answer and then crash; the outcome
        // is reported alongside, the comparison is on stdout alone.
        let tc = make_testcase("1", one("42"));
        let result = evaluate_testcase(&tc, run_result("42", RunOutcome::RuntimeError));
        assert!(result.passed);
        assert_eq!(result.run.unwrap().outcome, RunOutcome::RuntimeError);
    }

    #[test]
    fn test_no_expected_output_uses_outcome() {
        let tc = make_testcase("1", None);
        assert!(evaluate_testcase(&tc, run_result("anything", RunOutcome::Success)).passed);
        assert!(!evaluate_testcase(&tc, run_result("", RunOutcome::Timeout)).passed);
        assert!(!evaluate_testcase(&tc, run_result("x", RunOutcome::OutputTruncated)).passed);
    }

    #[test]
    fn test_not_run_results() {
        let tc = make_testcase("7", one("x"));
        let compile = compile_failed(&tc);
        assert_eq!(compile.status, TestStatus::CompileError);
        assert!(!compile.passed);
        assert!(compile.run.is_none());

        let skipped = skipped(&tc);
        assert_eq!(skipped.status, TestStatus::Skipped);
        assert_eq!(skipped.id, "7");
    }
}
