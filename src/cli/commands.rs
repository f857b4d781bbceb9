//! Subcommand implementations and the option parsing they share.

pub mod plan;
pub mod run;

use anyhow::{Context, Result};
use clap::ArgMatches;
use regex::Regex;
use std::path::PathBuf;

use crate::core::config::{SuiteConfig, load_suite};
use crate::core::options::{ConflictPolicy, HeavyMode, IgnoredCaveats, RunOptions};
use crate::core::spec::{RunEnvironment, ValgrindMode};
use crate::infra::t;

/// Terminal width from `--term-cols`, then `COLUMNS`, then a fixed default.
fn term_cols(matches: &ArgMatches) -> usize {
    matches
        .get_one::<usize>("term-cols")
        .copied()
        .or_else(|| {
            std::env::var("COLUMNS")
                .ok()
                .and_then(|c| c.trim().parse().ok())
        })
        .unwrap_or(110)
}

/// Builds run options from the selection arguments shared by `run` and `plan`.
pub(crate) fn selection_options(matches: &ArgMatches) -> Result<RunOptions> {
    let name_filter = matches
        .get_one::<String>("re")
        .map(|re| Regex::new(re).with_context(|| format!("invalid --re pattern '{re}'")))
        .transpose()?;

    let heavy = if matches.get_flag("heavy") {
        HeavyMode::Only
    } else if matches.get_flag("all-tests") {
        HeavyMode::Include
    } else {
        HeavyMode::Exclude
    };

    let ignored_caveats = matches
        .get_many::<String>("ignore")
        .map(IgnoredCaveats::from_words)
        .unwrap_or_default();

    let valgrind = matches
        .get_one::<String>("valgrind")
        .map(|mode| mode.parse::<ValgrindMode>())
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let conflict_policy = matches
        .get_one::<String>("conflict-policy")
        .map(|p| p.parse::<ConflictPolicy>())
        .transpose()
        .map_err(anyhow::Error::msg)?
        .unwrap_or_default();

    Ok(RunOptions {
        name_filter,
        group: matches.get_one::<String>("group").cloned(),
        not_group: matches.get_one::<String>("not-group").cloned(),
        heavy,
        ignored_caveats,
        valgrind,
        parallel: matches.get_one::<u32>("parallel").copied().unwrap_or(1),
        threads: matches.get_one::<u32>("n-threads").copied().unwrap_or(1),
        check_input: matches.get_flag("check-input"),
        no_check_input: matches.get_flag("no-check-input"),
        scaling: matches.get_flag("scaling"),
        conflict_policy,
        term_cols: term_cols(matches),
        ..RunOptions::default()
    })
}

/// Loads the suite named by `--suite` and the environment it runs in.
pub(crate) fn load_suite_and_env(
    matches: &ArgMatches,
    locale: &str,
) -> Result<(PathBuf, SuiteConfig, RunEnvironment)> {
    let path = matches
        .get_one::<PathBuf>("suite")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("tests.toml"));
    let suite = load_suite(&path).with_context(|| {
        t!("run.suite_load_failed", locale = locale, path = path.display()).to_string()
    })?;
    let env = RunEnvironment::detect().with_overrides(&suite.environment);
    tracing::debug!(?env, "detected environment");
    Ok((path, suite, env))
}
