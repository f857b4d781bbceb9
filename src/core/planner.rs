//! # Run Planner Module / 运行计划模块
//!
//! This module turns the discovered test specs into a `RunPlan` the scheduler can
//! execute: it evaluates every test, partitions the suite into generations,
//! fails tests with broken prerequisites, resolves command lines and slot counts,
//! and applies the output-conflict policy.
//!
//! 此模块将发现的测试规格转换为调度器可以执行的 `RunPlan`：
//! 评估每个测试、将套件划分为若干代、标记前置条件损坏的测试为失败、
//! 解析命令行与槽位数，并应用输出冲突策略。

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::evaluator::{CapabilityCache, RunnabilityEvaluator, Verdict};
use crate::core::graph::{DependencyError, DependencyGraph, Generation};
use crate::core::options::{ConflictPolicy, RunOptions};
use crate::core::race::{RaceConditionChecker, RaceConflict};
use crate::core::spec::{RunEnvironment, TestSpec};
use crate::core::status::{TestStatus, Tester};
use crate::infra::command::LaunchCommand;

/// A complete, ordered plan for one run.
/// 一次运行的完整有序计划。
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// One record per test, in discovery order.
    /// 每个测试一条记录，按发现顺序排列。
    pub testers: Vec<Tester>,
    /// The verdict each test received, parallel to `testers`.
    pub verdicts: Vec<Verdict>,
    /// Indices of each test's known prerequisites.
    pub prerequisites: Vec<Vec<usize>>,
    /// Indices of tests that must never run at the same time as each test.
    pub exclusions: Vec<Vec<usize>>,
    /// Admission order: by generation, then discovery order.
    pub order: Vec<usize>,
    pub generations: Vec<Generation>,
    pub rejected: Vec<(String, DependencyError)>,
    pub conflicts: Vec<RaceConflict>,
}

impl RunPlan {
    /// Number of tests that will actually be handed to the scheduler.
    pub fn runnable_count(&self) -> usize {
        self.testers
            .iter()
            .filter(|t| t.status() == TestStatus::Initialized)
            .count()
    }
}

/// A resolved command line plus the resources it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub command: LaunchCommand,
    pub procs: u32,
    pub threads: u32,
    /// Notes such as `min_cpus=4` when the request was clamped.
    pub caveats: Vec<String>,
}

impl ResolvedLaunch {
    pub fn slots(&self) -> usize {
        (self.procs as usize).saturating_mul(self.threads as usize).max(1)
    }
}

/// Clamps `requested` into `[min, max]`, noting which bound applied.
fn clamp_request(requested: u32, min: u32, max: u32, label: &str) -> (u32, Option<String>) {
    let value = requested.max(min).min(max).max(1);
    let caveat = if value > requested {
        Some(format!("min_{label}={value}"))
    } else if value < requested {
        Some(format!("max_{label}={value}"))
    } else {
        None
    };
    (value, caveat)
}

/// Works out the command line, process count and thread count for a test.
pub fn resolve_launch(
    spec: &TestSpec,
    options: &RunOptions,
    default_executable: Option<&str>,
) -> Result<ResolvedLaunch, String> {
    let (procs, procs_caveat) =
        clamp_request(options.parallel, spec.min_parallel, spec.max_parallel, "cpus");
    let (threads, threads_caveat) =
        clamp_request(options.threads, spec.min_threads, spec.max_threads, "threads");
    let caveats: Vec<String> = procs_caveat.into_iter().chain(threads_caveat).collect();
    let cwd = spec.run_dir();

    if let Some(line) = &spec.command {
        // Unknown variables leave the line as written rather than failing the test.
        let expanded = shellexpand::full(line)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| shellexpand::tilde(line).into_owned());
        let mut words = shlex::split(&expanded)
            .ok_or_else(|| "INVALID COMMAND".to_string())?
            .into_iter();
        let program = words.next().ok_or_else(|| "EMPTY COMMAND".to_string())?;
        return Ok(ResolvedLaunch {
            command: LaunchCommand::new(program, cwd)
                .args(words)
                .args(spec.cli_args.iter().cloned()),
            procs,
            threads,
            caveats,
        });
    }

    let executable = spec
        .executable
        .as_deref()
        .or(default_executable)
        .ok_or_else(|| "NO EXECUTABLE".to_string())?;

    let mut args: Vec<String> = vec![];
    if let Some(input) = &spec.input {
        args.push(spec.input_switch.clone());
        args.push(input.clone());
    }
    if spec.check_input || options.check_input {
        args.push("--check-input".to_string());
    }
    if threads > 1 {
        args.push(format!("--n-threads={threads}"));
    }
    args.extend(spec.cli_args.iter().cloned());

    let mut words: Vec<String> = vec![];
    if procs > 1 {
        words.extend(["mpiexec".to_string(), "-n".to_string(), procs.to_string()]);
    }
    if options.valgrind.is_some() {
        words.extend([
            "valgrind".to_string(),
            "--tool=memcheck".to_string(),
            "--leak-check=full".to_string(),
        ]);
    }
    words.push(executable.to_string());
    words.extend(args);

    let mut words = words.into_iter();
    let program = words.next().ok_or_else(|| "EMPTY COMMAND".to_string())?;
    Ok(ResolvedLaunch {
        command: LaunchCommand::new(program, cwd).args(words),
        procs,
        threads,
        caveats,
    })
}

fn dependency_reason(error: &DependencyError) -> String {
    match error {
        DependencyError::Cycle { .. } => "CYCLIC DEPENDENCY".to_string(),
        DependencyError::MissingPrerequisite { prerequisite } => {
            format!("MISSING PREREQ {prerequisite}")
        }
        DependencyError::BlockedBy { prerequisite } => format!("PREREQ BLOCKED {prerequisite}"),
    }
}

/// Builds the run plan for `specs`.
///
/// Fails only when the suite itself is unusable (duplicate names). Per-test
/// problems end up as terminal statuses on the affected testers.
///
/// 为 `specs` 构建运行计划。仅在套件本身不可用（名称重复）时失败，
/// 单个测试的问题会体现为该测试的最终状态。
pub fn plan_run(
    specs: Vec<TestSpec>,
    env: &RunEnvironment,
    options: &RunOptions,
    capabilities: &CapabilityCache,
    default_executable: Option<&str>,
) -> Result<RunPlan> {
    let graph = DependencyGraph::build(&specs)?;
    let resolution = graph.resolve();
    let evaluator = RunnabilityEvaluator::new(env, options, capabilities)
        .with_default_executable(default_executable);

    let rejected: HashMap<&str, &DependencyError> = resolution
        .rejected
        .iter()
        .map(|(name, error)| (name.as_str(), error))
        .collect();

    let mut testers = Vec::with_capacity(specs.len());
    let mut verdicts = Vec::with_capacity(specs.len());
    for spec in &specs {
        let verdict = evaluator.evaluate(spec);
        let mut tester = Tester::new(Arc::new(spec.clone()));

        if verdict == Verdict::Silent {
            tester.apply_verdict(&verdict)?;
        } else if let Some(error) = rejected.get(spec.name.as_str()) {
            tracing::debug!(test = %spec.name, "rejected: {error}");
            tester.set_status(TestStatus::Fail, dependency_reason(error))?;
        } else if verdict.is_runnable() {
            match resolve_launch(spec, options, default_executable) {
                Ok(launch) => {
                    let slots = launch.slots();
                    for caveat in launch.caveats {
                        tester.add_caveat(caveat);
                    }
                    tester.set_launch(launch.command, slots);
                }
                Err(reason) => tester.set_status(TestStatus::Fail, reason)?,
            }
        } else {
            tester.apply_verdict(&verdict)?;
        }

        testers.push(tester);
        verdicts.push(verdict);
    }

    let index: HashMap<&str, usize> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let prerequisites: Vec<Vec<usize>> = specs
        .iter()
        .map(|spec| {
            let mut found: Vec<usize> = spec
                .prereqs
                .iter()
                .filter_map(|p| index.get(p.as_str()).copied())
                .collect();
            found.sort_unstable();
            found.dedup();
            found
        })
        .collect();

    // Output collisions among tests that will actually run.
    let candidates: Vec<&str> = testers
        .iter()
        .filter(|t| t.status() == TestStatus::Initialized)
        .map(Tester::name)
        .collect();
    let finished: HashSet<String> = testers
        .iter()
        .filter(|t| t.is_finished())
        .map(|t| t.name().to_string())
        .collect();
    let outputs: BTreeMap<String, BTreeSet<PathBuf>> = specs
        .iter()
        .map(|s| (s.name.clone(), s.output_paths()))
        .collect();
    let conflicts =
        RaceConditionChecker::with_graph(&graph).conflicts(&candidates, &outputs, &finished);

    let mut exclusions: Vec<Vec<usize>> = vec![vec![]; specs.len()];
    for conflict in &conflicts {
        let (Some(&a), Some(&b)) = (
            index.get(conflict.first.as_str()),
            index.get(conflict.second.as_str()),
        ) else {
            continue;
        };
        tracing::warn!("{conflict}");
        match options.conflict_policy {
            ConflictPolicy::Fail => {
                for (me, other) in [(a, &conflict.second), (b, &conflict.first)] {
                    if testers[me].status() == TestStatus::Initialized {
                        testers[me]
                            .set_status(TestStatus::Fail, format!("OUTPUT CONFLICT WITH {other}"))?;
                    }
                }
            }
            ConflictPolicy::Serialize => {
                exclusions[a].push(b);
                exclusions[b].push(a);
                testers[a].add_caveat(format!("serialized with {}", conflict.second));
                testers[b].add_caveat(format!("serialized with {}", conflict.first));
            }
        }
    }

    let mut order: Vec<usize> = resolution
        .generations
        .iter()
        .flat_map(|g| g.members.iter())
        .filter_map(|name| index.get(name.as_str()).copied())
        .collect();
    let placed: HashSet<usize> = order.iter().copied().collect();
    order.extend((0..specs.len()).filter(|i| !placed.contains(i)));

    Ok(RunPlan {
        testers,
        verdicts,
        prerequisites,
        exclusions,
        order,
        generations: resolution.generations,
        rejected: resolution.rejected,
        conflicts,
    })
}
