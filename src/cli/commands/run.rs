//! # Run Command Module / 运行命令模块
//!
//! This module implements the `run` command: it loads the suite, plans the run,
//! wires up the console and results sinks, and drives the scheduler until every
//! test has finished or the user interrupts the run.
//!
//! 此模块实现 `run` 命令：加载套件、制定运行计划、连接控制台与结果输出，
//! 并驱动调度器直到所有测试完成或用户中断运行。

use anyhow::{Result, bail};
use clap::ArgMatches;
use colored::*;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::cli::commands::{load_suite_and_env, selection_options};
use crate::cli::explicit_language;
use crate::core::evaluator::{CapabilityCache, ExecutableCapabilities};
use crate::core::options::{RunOptions, UpstreamFailurePolicy};
use crate::core::planner::plan_run;
use crate::core::scheduler::{ResultSink, Scheduler};
use crate::infra::fs::find_executable;
use crate::infra::t;
use crate::reporting::{ConsoleOptions, ConsoleReporter, ResultsFileWriter};

/// Exit code used when the run was interrupted, as shells report for SIGINT.
const INTERRUPTED_EXIT_CODE: u8 = 130;

fn run_options(matches: &ArgMatches) -> Result<RunOptions> {
    let mut options = selection_options(matches)?;
    options.jobs = matches
        .get_one::<usize>("jobs")
        .copied()
        .unwrap_or_else(|| num_cpus::get() / 2 + 1)
        .max(1);
    options.max_load = matches.get_one::<f64>("max-load").copied();
    options.dry_run = matches.get_flag("dry-run");
    options.timeout_multiplier = matches
        .get_one::<f64>("timeout-multiplier")
        .copied()
        .unwrap_or(1.0);
    options.max_fails = matches.get_one::<usize>("max-fails").copied().unwrap_or(50);
    options.upstream_failure = matches
        .get_one::<String>("upstream-failure")
        .map(|p| p.parse::<UpstreamFailurePolicy>())
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();
    Ok(options)
}

/// Executes the run command.
///
/// # Returns
/// The process exit code: success when nothing failed, failure when any test
/// failed, and 130 when the run was interrupted.
pub async fn execute(matches: &ArgMatches, cli_locale: &str) -> Result<ExitCode> {
    let (suite_path, suite, env) = load_suite_and_env(matches, cli_locale)?;
    let locale = match explicit_language(matches) {
        Some(lang) => lang,
        None => suite.language.clone(),
    };
    rust_i18n::set_locale(&locale);

    let options = run_options(matches)?;

    println!(
        "{}",
        t!("run.loading_suite", locale = locale, path = suite_path.display(), count = suite.tests.len())
    );

    let default_executable = suite.executable.clone();
    if let Some(exe) = &default_executable {
        if !options.dry_run && find_executable(exe).is_none() {
            bail!(t!("run.executable_not_found", locale = locale, path = exe).to_string());
        }
    }

    let capabilities = CapabilityCache::new(ExecutableCapabilities);
    let plan = plan_run(
        suite.tests,
        &env,
        &options,
        &capabilities,
        default_executable.as_deref(),
    )?;

    for conflict in &plan.conflicts {
        println!("{} {}", t!("run.output_conflict", locale = locale).yellow(), conflict);
    }
    println!(
        "{}",
        t!(
            "run.starting",
            locale = locale,
            count = plan.runnable_count(),
            jobs = options.jobs
        )
        .bold()
    );

    let stop_token = setup_signal_handler(&locale);

    let console = ConsoleReporter::new(ConsoleOptions {
        locale: locale.clone(),
        term_cols: options.term_cols,
        verbose: matches.get_flag("verbose"),
        report_failures: !matches.get_flag("no-report-failures"),
        longest_jobs: matches.get_one::<usize>("longest-jobs").copied().unwrap_or(0),
    });
    let mut sinks: Vec<Box<dyn ResultSink>> = vec![Box::new(console)];
    let results = ResultsFileWriter::new(
        matches.get_one::<PathBuf>("results").cloned(),
        matches.get_one::<PathBuf>("sep-files").cloned(),
    );
    if results.is_enabled() {
        sinks.push(Box::new(results));
    }

    let summary = Scheduler::new(options)
        .with_cancellation(stop_token)
        .with_sinks(sinks)
        .run(plan)
        .join()
        .await?;

    if summary.interrupted {
        eprintln!("{}", t!("run.interrupted_exit", locale = locale).yellow().bold());
        return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
    }
    if summary.success() {
        println!("\n{}", t!("run.all_passed", locale = locale).green().bold());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Sets up a signal handler for graceful shutdown.
fn setup_signal_handler(locale: &str) -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();
    let locale = locale.to_string();

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                println!("\n{}", t!("run.shutdown_signal", locale = &locale).yellow());
                token_clone.cancel();
            }
            Err(e) => tracing::warn!("failed to listen for Ctrl-C: {e}"),
        }
    });

    token
}
