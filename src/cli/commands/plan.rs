//! The `plan` command: shows generations, verdicts and output conflicts
//! without running anything.

use anyhow::Result;
use clap::ArgMatches;
use colored::*;
use std::process::ExitCode;

use crate::cli::commands::{load_suite_and_env, selection_options};
use crate::cli::explicit_language;
use crate::core::evaluator::{CapabilityCache, ExecutableCapabilities, Verdict};
use crate::core::options::ConflictPolicy;
use crate::core::planner::{RunPlan, plan_run};
use crate::core::status::TestStatus;
use crate::infra::t;

pub fn execute(matches: &ArgMatches, cli_locale: &str) -> Result<ExitCode> {
    let (_, suite, env) = load_suite_and_env(matches, cli_locale)?;
    let locale = explicit_language(matches).unwrap_or_else(|| suite.language.clone());
    rust_i18n::set_locale(&locale);

    let options = selection_options(matches)?;
    let capabilities = CapabilityCache::new(ExecutableCapabilities);
    let plan = plan_run(
        suite.tests,
        &env,
        &options,
        &capabilities,
        suite.executable.as_deref(),
    )?;

    print_plan(&plan, &locale);

    let broken = !plan.rejected.is_empty()
        || (options.conflict_policy == ConflictPolicy::Fail && !plan.conflicts.is_empty());
    Ok(if broken {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_plan(plan: &RunPlan, locale: &str) {
    let by_name = |name: &str| plan.testers.iter().position(|t| t.name() == name);

    for generation in &plan.generations {
        println!(
            "{}",
            t!("plan.generation", locale = locale, index = generation.index).bold()
        );
        for name in &generation.members {
            let Some(idx) = by_name(name) else { continue };
            let tester = &plan.testers[idx];
            let line = match (&plan.verdicts[idx], tester.status()) {
                (Verdict::Silent, _) => continue,
                (_, TestStatus::Initialized) => match tester.launch() {
                    Some(command) => format!("{} {}", "RUN".green(), command.display().dimmed()),
                    None => "RUN".green().to_string(),
                },
                (_, status) => format!("{} {}", status.to_string().yellow(), tester.reason()),
            };
            println!("  {name:<50} {line}");
        }
    }

    if !plan.rejected.is_empty() {
        println!("{}", t!("plan.rejected", locale = locale).red().bold());
        for (name, error) in &plan.rejected {
            println!("  {name:<50} {error}");
        }
    }
    if !plan.conflicts.is_empty() {
        println!("{}", t!("plan.conflicts", locale = locale).red().bold());
        for conflict in &plan.conflicts {
            println!("  {conflict}");
        }
    }
}
