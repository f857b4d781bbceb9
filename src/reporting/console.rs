//! # Console Reporting Module / 控制台报告模块
//!
//! This module prints one line per finished test as results arrive, notices for
//! tests that run unusually long, and the closing summary: failing tests, the
//! longest jobs, the final counts and, optionally, the captured output of every
//! failure.
//!
//! 此模块在结果到达时为每个完成的测试打印一行，为运行时间过长的测试打印提示，
//! 并在最后打印摘要：失败的测试、最耗时的任务、最终计数，以及（可选）每个失败的输出。

use anyhow::Result;
use colored::*;
use std::time::Duration;

use crate::core::scheduler::{ResultSink, RunSummary, Tally};
use crate::core::status::{TestStatus, Tester};
use crate::infra::t;

/// Settings for the console reporter.
#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub locale: String,
    pub term_cols: usize,
    /// Print captured output as soon as a test fails.
    pub verbose: bool,
    /// Replay the output of every failure at the end of the run.
    pub report_failures: bool,
    /// How many of the slowest tests to list at the end.
    pub longest_jobs: usize,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            term_cols: 110,
            verbose: false,
            report_failures: true,
            longest_jobs: 0,
        }
    }
}

/// Prints results to stdout.
#[derive(Debug, Clone, Default)]
pub struct ConsoleReporter {
    options: ConsoleOptions,
}

impl ConsoleReporter {
    pub fn new(options: ConsoleOptions) -> Self {
        Self { options }
    }
}

/// The status word shown at the end of a result line.
fn status_text(tester: &Tester) -> String {
    match tester.status() {
        TestStatus::Fail | TestStatus::Diff if !tester.reason().is_empty() => {
            format!("{} ({})", tester.status(), tester.reason())
        }
        status => status.to_string(),
    }
}

fn colorize(tester: &Tester, text: String) -> ColoredString {
    match tester.status() {
        TestStatus::Pass => text.green(),
        TestStatus::Fail => text.red(),
        TestStatus::Diff => text.yellow(),
        TestStatus::Skip | TestStatus::Deleted => text.dimmed(),
        _ => text.normal(),
    }
}

/// Formats a finished test as `name .......... [caveats] STATUS [1.23s]`.
///
/// Skip and delete reasons take the place of caveats. The dots stretch the
/// line to `width` columns when there is room.
///
/// 将完成的测试格式化为 `name .......... [caveats] STATUS [1.23s]`。
pub fn format_result_line(tester: &Tester, width: usize) -> String {
    let (bracket, status, timing) = result_parts(tester);
    let right = format!("{bracket}{status}{timing}");
    let dots = width
        .saturating_sub(tester.name().chars().count() + right.chars().count() + 2)
        .max(1);
    format!("{} {} {}", tester.name(), ".".repeat(dots), right)
}

fn result_parts(tester: &Tester) -> (String, String, String) {
    let notes: Vec<&str> = match tester.status() {
        TestStatus::Skip | TestStatus::Deleted => vec![tester.reason()],
        _ => tester.caveats().collect(),
    };
    let bracket = if notes.is_empty() || notes.iter().all(|n| n.is_empty()) {
        String::new()
    } else {
        format!("[{}] ", notes.join(", "))
    };
    let timing = if tester.started_at().is_some() && tester.finished_at().is_some() {
        format!(" [{:.2}s]", tester.duration().as_secs_f64())
    } else {
        String::new()
    };
    (bracket, status_text(tester), timing)
}

fn print_result_line(tester: &Tester, width: usize) {
    let (bracket, status, timing) = result_parts(tester);
    let right_len = bracket.chars().count() + status.chars().count() + timing.chars().count();
    let dots = width
        .saturating_sub(tester.name().chars().count() + right_len + 2)
        .max(1);
    println!(
        "{} {} {}{}{}",
        tester.name(),
        ".".repeat(dots),
        bracket.cyan(),
        colorize(tester, status).bold(),
        timing
    );
}

fn print_output(tester: &Tester, locale: &str) {
    let separator = "#".repeat(80);
    println!("{}", separator.dimmed());
    println!(
        "{} {}",
        t!("console.output_for", locale = locale).yellow(),
        tester.name().cyan()
    );
    if let Some(command) = tester.launch() {
        println!(
            "{} {}",
            t!("console.command", locale = locale).yellow(),
            command.display()
        );
    }
    println!("{}", separator.dimmed());
    if tester.output().is_empty() {
        println!("{}", t!("console.no_output", locale = locale).dimmed());
    } else {
        print!("{}", tester.output());
    }
    println!("{}", separator.dimmed());
}

fn format_tally(tally: &Tally, locale: &str) -> String {
    let mut parts = vec![
        t!("console.passed", count = tally.passed, locale = locale)
            .green()
            .to_string(),
        t!("console.skipped", count = tally.skipped, locale = locale)
            .cyan()
            .to_string(),
    ];
    if tally.deleted > 0 {
        parts.push(
            t!("console.deleted", count = tally.deleted, locale = locale)
                .dimmed()
                .to_string(),
        );
    }
    let failed = t!("console.failed", count = tally.failures(), locale = locale);
    parts.push(if tally.failures() > 0 {
        failed.red().bold().to_string()
    } else {
        failed.to_string()
    });
    if tally.not_run > 0 {
        parts.push(
            t!("console.not_run", count = tally.not_run, locale = locale)
                .yellow()
                .to_string(),
        );
    }
    parts.join(", ")
}

impl ResultSink for ConsoleReporter {
    fn on_long_running(&mut self, tester: &Tester, elapsed: Duration) -> Result<()> {
        let status = format!("RUNNING... [{:.1}s]", elapsed.as_secs_f64());
        let dots = self
            .options
            .term_cols
            .saturating_sub(tester.name().chars().count() + status.chars().count() + 2)
            .max(1);
        println!("{} {} {}", tester.name(), ".".repeat(dots), status.yellow());
        Ok(())
    }

    fn on_finished(&mut self, tester: &Tester, _tally: &Tally) -> Result<()> {
        if tester.status() == TestStatus::Silent {
            return Ok(());
        }
        if tester.ever_failed() && self.options.verbose {
            print_output(tester, &self.options.locale);
        }
        print_result_line(tester, self.options.term_cols);
        Ok(())
    }

    fn on_run_complete(&mut self, summary: &RunSummary) -> Result<()> {
        let locale = self.options.locale.as_str();
        let failures: Vec<&Tester> = summary.failures().collect();

        if self.options.report_failures && !failures.is_empty() && !self.options.verbose {
            println!("\n{}", t!("console.failure_replay_banner", locale = locale).red().bold());
            for tester in &failures {
                print_output(tester, locale);
            }
        }

        if self.options.longest_jobs > 0 {
            let longest = summary.longest(self.options.longest_jobs);
            if !longest.is_empty() {
                println!(
                    "\n{}",
                    t!("console.longest_banner", count = longest.len(), locale = locale).bold()
                );
                for tester in longest {
                    println!(
                        "  {:<60} {:>10.2}s",
                        tester.name(),
                        tester.duration().as_secs_f64()
                    );
                }
            }
        }

        if !failures.is_empty() {
            println!("\n{}", t!("console.final_results_banner", locale = locale).bold());
            for tester in &failures {
                print_result_line(tester, self.options.term_cols);
            }
        }

        println!("\n{}", "-".repeat(self.options.term_cols.min(80)));
        println!(
            "{} {}",
            t!(
                "console.ran_in",
                count = summary.tally.reported(),
                seconds = format!("{:.1}", summary.elapsed.as_secs_f64()),
                locale = locale
            ),
            format_tally(&summary.tally, locale)
        );
        if summary.max_fails_reached {
            println!("{}", t!("console.max_fails_reached", locale = locale).red());
        }
        if summary.interrupted {
            println!("{}", t!("console.interrupted", locale = locale).yellow().bold());
        }
        Ok(())
    }
}
