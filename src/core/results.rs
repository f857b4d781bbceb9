//! # Result Interpretation Module / 结果解释模块
//!
//! Turns a finished process (exit code and captured output) into a terminal
//! status for the test: exit code checks, error markers, expected and absent
//! output patterns, memory-checker summaries and gold-file comparison.
//!
//! 将已结束的进程（退出码与捕获的输出）转换为测试的最终状态。

use regex::Regex;
use std::fs;
use std::path::Path;

use crate::core::options::RunOptions;
use crate::core::spec::{GoldFile, TestSpec};
use crate::core::status::TestStatus;
use crate::infra::command::ProcessExit;

/// A terminal status with its short reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    pub status: TestStatus,
    pub reason: String,
}

impl Interpretation {
    fn pass() -> Self {
        Self {
            status: TestStatus::Pass,
            reason: String::new(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Fail,
            reason: reason.into(),
        }
    }

    fn diff(reason: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Diff,
            reason: reason.into(),
        }
    }
}

const VALGRIND_CLEAN: &str = "ERROR SUMMARY: 0 errors";

/// Decides the terminal status of a test from how its process ended.
pub fn interpret(
    spec: &TestSpec,
    options: &RunOptions,
    exit: &ProcessExit,
    output: &str,
) -> Interpretation {
    let code = match exit {
        ProcessExit::Exited(code) => *code,
        ProcessExit::Signaled(signal) => return Interpretation::fail(format!("CRASH (SIGNAL {signal})")),
        ProcessExit::TimedOut => return Interpretation::fail("TIMEOUT"),
        ProcessExit::Cancelled => return Interpretation::fail("CANCELLED"),
        ProcessExit::LaunchFailed(_) => return Interpretation::fail("LAUNCH FAILED"),
    };

    if code != spec.expect_exit_code {
        return Interpretation::fail(format!(
            "EXIT CODE {code} != {}",
            spec.expect_exit_code
        ));
    }

    if let Some(pattern) = &spec.expect_out {
        if !output_matches(pattern, spec.match_literal, output) {
            return Interpretation::fail("EXPECTED OUTPUT MISSING");
        }
    }
    if let Some(pattern) = &spec.absent_out {
        if output_matches(pattern, spec.match_literal, output) {
            return Interpretation::fail("OUTPUT NOT ABSENT");
        }
    }

    if options.valgrind.is_some() {
        if !output.contains(VALGRIND_CLEAN) {
            return Interpretation::fail("MEMORY ERROR");
        }
    } else if spec
        .errors
        .iter()
        .any(|marker| !marker.is_empty() && output.contains(marker.as_str()))
    {
        return Interpretation::fail("ERRMSG");
    }

    for gold in &spec.gold {
        if let Some(result) = compare_gold(spec, gold) {
            return result;
        }
    }

    Interpretation::pass()
}

fn output_matches(pattern: &str, literal: bool, output: &str) -> bool {
    if literal {
        return output.contains(pattern);
    }
    match Regex::new(&format!("(?m){pattern}")) {
        Ok(re) => re.is_match(output),
        Err(e) => {
            tracing::warn!("invalid output pattern '{pattern}': {e}");
            output.contains(pattern)
        }
    }
}

/// Returns a failing interpretation when the output differs from its gold copy.
fn compare_gold(spec: &TestSpec, gold: &GoldFile) -> Option<Interpretation> {
    let output_path = spec.resolve(&gold.output);
    let gold_path = spec.resolve(&gold.gold);
    let Ok(actual) = fs::read_to_string(&output_path) else {
        return Some(Interpretation::fail(format!(
            "MISSING OUTPUT {}",
            display_name(&output_path)
        )));
    };
    let Ok(expected) = fs::read_to_string(&gold_path) else {
        return Some(Interpretation::fail(format!(
            "MISSING GOLD {}",
            display_name(&gold_path)
        )));
    };
    match first_difference(&expected, &actual, gold.rel_tol, gold.abs_zero) {
        Some(line) => {
            tracing::debug!(
                test = %spec.name,
                file = %output_path.display(),
                line,
                "output differs from gold"
            );
            Some(Interpretation::diff(format!(
                "{}:{line}",
                display_name(&output_path)
            )))
        }
        None => None,
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Compares two texts field by field and returns the first differing line (1-based).
///
/// Fields are separated by whitespace or commas. Numeric fields match when their
/// relative difference is within `rel_tol`, or when both are below `abs_zero`.
pub fn first_difference(expected: &str, actual: &str, rel_tol: f64, abs_zero: f64) -> Option<usize> {
    let mut expected_lines = expected.lines();
    let mut actual_lines = actual.lines();
    let mut line = 0;
    loop {
        line += 1;
        match (expected_lines.next(), actual_lines.next()) {
            (None, None) => return None,
            (Some(e), Some(a)) => {
                if !lines_match(e, a, rel_tol, abs_zero) {
                    return Some(line);
                }
            }
            _ => return Some(line),
        }
    }
}

fn lines_match(expected: &str, actual: &str, rel_tol: f64, abs_zero: f64) -> bool {
    let split = |s: &str| -> Vec<String> {
        s.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    };
    let expected = split(expected);
    let actual = split(actual);
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(&actual)
            .all(|(e, a)| fields_match(e, a, rel_tol, abs_zero))
}

fn fields_match(expected: &str, actual: &str, rel_tol: f64, abs_zero: f64) -> bool {
    match (expected.parse::<f64>(), actual.parse::<f64>()) {
        (Ok(e), Ok(a)) => {
            if e.abs() < abs_zero && a.abs() < abs_zero {
                return true;
            }
            let scale = e.abs().max(a.abs());
            scale == 0.0 || (e - a).abs() / scale <= rel_tol
        }
        _ => expected == actual,
    }
}
