//! # Command-Line Interface / 命令行接口
//!
//! Builds the localized `clap` command tree and dispatches to the `run` and
//! `plan` subcommands.
//!
//! 构建本地化的 `clap` 命令树，并分发到 `run` 与 `plan` 子命令。

pub mod commands;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::{env, path::PathBuf, process::ExitCode};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, prelude::*};

use crate::infra::t;

/// Environment variable that overrides the log filter, e.g. `sim_harness=trace`.
pub const LOG_ENV: &str = "SIM_HARNESS_LOG";

/// Pre-parses the command line arguments to find the language setting.
/// This allows i18n to be initialized before the full CLI is built.
/// It looks for a `--lang <VALUE>` argument.
fn pre_parse_language() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|arg| arg == "--lang")
        .and_then(|pos| args.get(pos + 1).cloned())
        .or_else(|| {
            args.iter()
                .find_map(|arg| arg.strip_prefix("--lang=").map(str::to_string))
        })
}

/// Installs the stderr log layer. `SIM_HARNESS_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let targets = match env::var(LOG_ENV) {
        Ok(spec) if !spec.trim().is_empty() => spec.parse::<Targets>().unwrap_or_else(|e| {
            eprintln!("ignoring invalid {LOG_ENV}: {e}");
            Targets::new().with_default(default)
        }),
        _ => Targets::new().with_default(default),
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(targets);
    // A subscriber may already be installed when embedded in another binary.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

/// Accepts finite numbers greater than zero.
fn parse_positive_factor(value: &str) -> Result<f64, String> {
    let factor: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("'{value}' is not a number: {e}"))?;
    if factor.is_finite() && factor > 0.0 {
        Ok(factor)
    } else {
        Err(format!("'{value}' must be a finite number greater than zero"))
    }
}

fn suite_arg(locale: &str) -> Arg {
    Arg::new("suite")
        .short('s')
        .long("suite")
        .help(t!("cli.arg_suite", locale = locale).to_string())
        .value_name("SUITE")
        .default_value("tests.toml")
        .value_parser(clap::value_parser!(PathBuf))
        .action(ArgAction::Set)
}

/// Arguments that decide which tests are eligible; shared by `run` and `plan`.
fn with_selection_args(cmd: Command, locale: &str) -> Command {
    cmd.arg(suite_arg(locale))
        .arg(
            Arg::new("re")
                .long("re")
                .help(t!("cli.arg_re", locale = locale).to_string())
                .value_name("REGEX")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("group")
                .short('g')
                .long("group")
                .help(t!("cli.arg_group", locale = locale).to_string())
                .value_name("GROUP")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("not-group")
                .long("not-group")
                .help(t!("cli.arg_not_group", locale = locale).to_string())
                .value_name("GROUP")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("heavy")
                .long("heavy")
                .help(t!("cli.arg_heavy", locale = locale).to_string())
                .action(ArgAction::SetTrue)
                .conflicts_with("all-tests"),
        )
        .arg(
            Arg::new("all-tests")
                .long("all-tests")
                .help(t!("cli.arg_all_tests", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("ignore")
                .short('i')
                .long("ignore")
                .help(t!("cli.arg_ignore", locale = locale).to_string())
                .value_name("CAVEAT")
                .num_args(0..)
                .default_missing_value("all")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("valgrind")
                .long("valgrind")
                .help(t!("cli.arg_valgrind", locale = locale).to_string())
                .value_name("MODE")
                .num_args(0..=1)
                .default_missing_value("NORMAL")
                .value_parser(["NORMAL", "HEAVY", "normal", "heavy"])
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("parallel")
                .short('p')
                .long("parallel")
                .help(t!("cli.arg_parallel", locale = locale).to_string())
                .value_name("PROCS")
                .value_parser(clap::value_parser!(u32).range(1..))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("n-threads")
                .long("n-threads")
                .help(t!("cli.arg_threads", locale = locale).to_string())
                .value_name("THREADS")
                .value_parser(clap::value_parser!(u32).range(1..))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("check-input")
                .long("check-input")
                .help(t!("cli.arg_check_input", locale = locale).to_string())
                .action(ArgAction::SetTrue)
                .conflicts_with("no-check-input"),
        )
        .arg(
            Arg::new("no-check-input")
                .long("no-check-input")
                .help(t!("cli.arg_no_check_input", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scaling")
                .long("scaling")
                .help(t!("cli.arg_scaling", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("conflict-policy")
                .long("conflict-policy")
                .help(t!("cli.arg_conflict_policy", locale = locale).to_string())
                .value_name("POLICY")
                .value_parser(["fail", "serialize"])
                .default_value("fail")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("term-cols")
                .long("term-cols")
                .help(t!("cli.arg_term_cols", locale = locale).to_string())
                .value_name("COLUMNS")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
}

fn build_cli(locale: &str) -> Command {
    let run = Command::new("run")
        .about(t!("cli.cmd_run_about", locale = locale).to_string())
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .help(t!("cli.arg_jobs", locale = locale).to_string())
                .value_name("JOBS")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("max-load")
                .short('l')
                .long("max-load")
                .help(t!("cli.arg_max_load", locale = locale).to_string())
                .value_name("LOAD")
                .value_parser(clap::value_parser!(f64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help(t!("cli.arg_dry_run", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout-multiplier")
                .long("timeout-multiplier")
                .help(t!("cli.arg_timeout_multiplier", locale = locale).to_string())
                .value_name("FACTOR")
                .value_parser(parse_positive_factor)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("max-fails")
                .long("max-fails")
                .help(t!("cli.arg_max_fails", locale = locale).to_string())
                .value_name("COUNT")
                .value_parser(clap::value_parser!(usize))
                .default_value("50")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("upstream-failure")
                .long("upstream-failure")
                .help(t!("cli.arg_upstream_failure", locale = locale).to_string())
                .value_name("POLICY")
                .value_parser(["block", "flag"])
                .default_value("block")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("results")
                .long("results")
                .help(t!("cli.arg_results", locale = locale).to_string())
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("sep-files")
                .long("sep-files")
                .help(t!("cli.arg_sep_files", locale = locale).to_string())
                .value_name("DIR")
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("longest-jobs")
                .long("longest-jobs")
                .help(t!("cli.arg_longest_jobs", locale = locale).to_string())
                .value_name("COUNT")
                .value_parser(clap::value_parser!(usize))
                .default_value("0")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("no-report-failures")
                .long("no-report-failures")
                .help(t!("cli.arg_no_report_failures", locale = locale).to_string())
                .action(ArgAction::SetTrue),
        );

    let plan = Command::new("plan").about(t!("cli.cmd_plan_about", locale = locale).to_string());

    Command::new("sim-harness")
        .version(env!("CARGO_PKG_VERSION"))
        .about(t!("cli.about", locale = locale).to_string())
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("lang")
                .long("lang")
                .help(t!("cli.arg_lang", locale = locale).to_string())
                .value_name("LANGUAGE")
                .global(true)
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help(t!("cli.arg_verbose", locale = locale).to_string())
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(with_selection_args(run, locale))
        .subcommand(with_selection_args(plan, locale))
}

/// Language given on the command line, if any.
pub(crate) fn explicit_language(matches: &ArgMatches) -> Option<String> {
    matches.get_one::<String>("lang").cloned()
}

/// Parses the command line and runs the selected subcommand.
pub async fn run() -> Result<ExitCode> {
    // Pre-parse language and initialize i18n first.
    let language = match pre_parse_language() {
        Some(language) => {
            rust_i18n::set_locale(&language);
            language
        }
        None => crate::init(),
    };

    let matches = build_cli(&language).get_matches();

    match matches.subcommand() {
        Some(("run", run_matches)) => {
            init_logging(run_matches.get_flag("verbose"));
            commands::run::execute(run_matches, &language).await
        }
        Some(("plan", plan_matches)) => {
            init_logging(plan_matches.get_flag("verbose"));
            commands::plan::execute(plan_matches, &language)
        }
        _ => Ok(ExitCode::FAILURE),
    }
}
