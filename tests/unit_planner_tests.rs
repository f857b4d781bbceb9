//! # Run Planner Unit Tests / 运行计划单元测试
//!
//! This module tests command-line resolution and how the planner combines
//! verdicts, the dependency graph and the output-conflict policy.
//!
//! 此模块测试命令行解析，以及计划器如何结合评估结论、依赖图与输出冲突策略。

mod common;

use common::{plan, status_of, tester};
use sim_harness::core::evaluator::Verdict;
use sim_harness::core::options::{ConflictPolicy, RunOptions};
use sim_harness::core::planner::resolve_launch;
use sim_harness::core::spec::{TestSpec, ValgrindMode};
use sim_harness::core::status::TestStatus;
use std::path::PathBuf;

fn sim_spec(name: &str) -> TestSpec {
    TestSpec {
        test_dir: PathBuf::from("/suite/kernels"),
        input: Some("diffusion.i".to_string()),
        ..TestSpec::new(name)
    }
}

#[cfg(test)]
mod launch_tests {
    use super::*;

    #[test]
    fn test_serial_command_line() {
        let launch = resolve_launch(&sim_spec("a"), &RunOptions::default(), Some("sim-opt")).unwrap();
        assert_eq!(launch.command.program, "sim-opt");
        assert_eq!(launch.command.args, vec!["-i", "diffusion.i"]);
        assert_eq!(launch.command.cwd, PathBuf::from("/suite/kernels"));
        assert_eq!(launch.slots(), 1);
        assert!(launch.caveats.is_empty());
    }

    #[test]
    fn test_parallel_threaded_command_line() {
        let spec = TestSpec {
            cli_args: vec!["Executioner/num_steps=2".to_string()],
            ..sim_spec("a")
        };
        let options = RunOptions {
            parallel: 4,
            threads: 2,
            ..RunOptions::default()
        };
        let launch = resolve_launch(&spec, &options, Some("sim-opt")).unwrap();
        assert_eq!(launch.command.program, "mpiexec");
        assert_eq!(
            launch.command.args,
            vec![
                "-n",
                "4",
                "sim-opt",
                "-i",
                "diffusion.i",
                "--n-threads=2",
                "Executioner/num_steps=2"
            ]
        );
        assert_eq!(launch.slots(), 8);
    }

    #[test]
    fn test_requests_are_clamped_with_caveats() {
        let spec = TestSpec {
            min_parallel: 2,
            max_threads: 2,
            ..sim_spec("a")
        };
        let options = RunOptions {
            threads: 8,
            ..RunOptions::default()
        };
        let launch = resolve_launch(&spec, &options, Some("sim-opt")).unwrap();
        assert_eq!(launch.procs, 2);
        assert_eq!(launch.threads, 2);
        assert_eq!(launch.caveats, vec!["min_cpus=2", "max_threads=2"]);
    }

    #[test]
    fn test_memory_checker_and_check_input() {
        let spec = TestSpec {
            check_input: true,
            executable: Some("sim-dbg".to_string()),
            ..sim_spec("a")
        };
        let options = RunOptions {
            valgrind: Some(ValgrindMode::Normal),
            ..RunOptions::default()
        };
        let launch = resolve_launch(&spec, &options, Some("sim-opt")).unwrap();
        assert_eq!(launch.command.program, "valgrind");
        assert_eq!(
            launch.command.args,
            vec![
                "--tool=memcheck",
                "--leak-check=full",
                "sim-dbg",
                "-i",
                "diffusion.i",
                "--check-input"
            ]
        );
    }

    #[test]
    fn test_literal_command() {
        let spec = TestSpec {
            command: Some("python3 check.py --tol '1e-6 abs'".to_string()),
            cli_args: vec!["--verbose".to_string()],
            ..sim_spec("a")
        };
        let launch = resolve_launch(&spec, &RunOptions::default(), Some("sim-opt")).unwrap();
        assert_eq!(launch.command.program, "python3");
        assert_eq!(launch.command.args, vec!["check.py", "--tol", "1e-6 abs", "--verbose"]);
    }

    #[test]
    fn test_bad_commands() {
        let unterminated = TestSpec {
            command: Some("sh -c 'oops".to_string()),
            ..sim_spec("a")
        };
        let empty = TestSpec {
            command: Some("   ".to_string()),
            ..sim_spec("b")
        };
        assert_eq!(
            resolve_launch(&unterminated, &RunOptions::default(), None).unwrap_err(),
            "INVALID COMMAND"
        );
        assert_eq!(
            resolve_launch(&empty, &RunOptions::default(), None).unwrap_err(),
            "EMPTY COMMAND"
        );
        assert_eq!(
            resolve_launch(&sim_spec("c"), &RunOptions::default(), None).unwrap_err(),
            "NO EXECUTABLE"
        );
    }
}

#[cfg(test)]
mod plan_tests {
    use super::*;

    fn named(name: &str) -> TestSpec {
        TestSpec {
            executable: Some("sim-opt".to_string()),
            test_dir: PathBuf::from("/suite"),
            ..TestSpec::new(name)
        }
    }

    #[test]
    fn test_statuses_after_planning() {
        let specs = vec![
            named("ok"),
            TestSpec {
                skip: Some("unsupported platform".to_string()),
                ..named("skipped")
            },
            TestSpec {
                prereqs: vec!["ghost".to_string()],
                ..named("orphan")
            },
            TestSpec {
                prereqs: vec!["orphan".to_string()],
                ..named("downstream")
            },
            TestSpec {
                prereqs: vec!["loop".to_string()],
                ..named("loop")
            },
        ];
        let plan = plan(specs, &RunOptions::default()).unwrap();

        assert_eq!(status_of(&plan.testers, "ok"), TestStatus::Initialized);
        assert_eq!(status_of(&plan.testers, "skipped"), TestStatus::Skip);
        assert_eq!(tester(&plan.testers, "orphan").reason(), "MISSING PREREQ ghost");
        assert_eq!(tester(&plan.testers, "downstream").reason(), "PREREQ BLOCKED orphan");
        assert_eq!(tester(&plan.testers, "loop").reason(), "CYCLIC DEPENDENCY");
        assert_eq!(plan.runnable_count(), 1);
        assert_eq!(plan.rejected.len(), 3);
        assert!(tester(&plan.testers, "ok").launch().is_some());
    }

    #[test]
    fn test_silent_wins_over_dependency_errors() {
        let specs = vec![TestSpec {
            prereqs: vec!["ghost".to_string()],
            group: vec!["nightly".to_string()],
            ..named("orphan")
        }];
        let options = RunOptions {
            not_group: Some("nightly".to_string()),
            ..RunOptions::default()
        };
        let plan = plan(specs, &options).unwrap();
        assert_eq!(status_of(&plan.testers, "orphan"), TestStatus::Silent);
        assert_eq!(plan.verdicts[0], Verdict::Silent);
    }

    #[test]
    fn test_order_follows_generations() {
        let specs = vec![
            TestSpec {
                prereqs: vec!["b".to_string()],
                ..named("a")
            },
            named("b"),
            named("c"),
        ];
        let plan = plan(specs, &RunOptions::default()).unwrap();
        assert_eq!(plan.order, vec![1, 2, 0]);
        assert_eq!(plan.prerequisites[0], vec![1]);
    }

    #[test]
    fn test_duplicate_names_fail_planning() {
        assert!(plan(vec![named("a"), named("a")], &RunOptions::default()).is_err());
    }

    fn writers() -> Vec<TestSpec> {
        let writes = |name: &str| TestSpec {
            output_files: vec!["out.e".into()],
            ..named(name)
        };
        vec![
            writes("d"),
            writes("e"),
            TestSpec {
                prereqs: vec!["d".to_string()],
                ..writes("after_d")
            },
            TestSpec {
                skip: Some("not today".to_string()),
                ..writes("skipped")
            },
        ]
    }

    #[test]
    fn test_output_conflicts_fail_both_tests() {
        let plan = plan(writers(), &RunOptions::default()).unwrap();
        assert_eq!(tester(&plan.testers, "d").reason(), "OUTPUT CONFLICT WITH e");
        assert_eq!(tester(&plan.testers, "e").reason(), "OUTPUT CONFLICT WITH d");
        // `after_d` is ordered after `d` but may overlap with `e`.
        assert_eq!(tester(&plan.testers, "after_d").reason(), "OUTPUT CONFLICT WITH e");
        assert_eq!(status_of(&plan.testers, "skipped"), TestStatus::Skip);
        assert!(plan.conflicts.iter().all(|c| c.first != "skipped" && c.second != "skipped"));
        assert!(
            !plan
                .conflicts
                .iter()
                .any(|c| c.first == "d" && c.second == "after_d")
        );
    }

    #[test]
    fn test_serialize_policy_adds_exclusions() {
        let options = RunOptions {
            conflict_policy: ConflictPolicy::Serialize,
            ..RunOptions::default()
        };
        let plan = plan(writers(), &options).unwrap();
        assert_eq!(plan.runnable_count(), 3);
        assert!(plan.exclusions[0].contains(&1));
        assert!(plan.exclusions[1].contains(&0));
        assert!(plan.exclusions[1].contains(&2));
        assert!(!plan.exclusions[0].contains(&2));
        let caveats: Vec<&str> = tester(&plan.testers, "d").caveats().collect();
        assert_eq!(caveats, vec!["serialized with e"]);
    }
}

#[cfg(test)]
mod time_limit_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_valgrind_and_user_multipliers_combine() {
        let spec = TestSpec {
            max_time: 10.0,
            ..sim_spec("a")
        };
        let opts = RunOptions {
            valgrind: Some(ValgrindMode::Heavy),
            timeout_multiplier: 1.5,
            ..RunOptions::default()
        };
        assert_eq!(opts.effective_max_time(&spec), Duration::from_secs(90));
    }

    #[test]
    fn test_huge_limits_saturate() {
        let spec = TestSpec {
            max_time: 1e30,
            min_reported_time: f64::INFINITY,
            ..sim_spec("a")
        };
        assert_eq!(spec.max_time(), Duration::MAX);
        assert_eq!(spec.min_reported_time(), Duration::MAX);
        assert_eq!(RunOptions::default().effective_max_time(&spec), Duration::MAX);

        let opts = RunOptions {
            timeout_multiplier: f64::INFINITY,
            ..RunOptions::default()
        };
        assert_eq!(opts.effective_max_time(&sim_spec("b")), Duration::MAX);
    }

    #[test]
    fn test_unusable_multiplier_leaves_limit_unscaled() {
        let spec = TestSpec {
            max_time: 20.0,
            ..sim_spec("a")
        };
        for multiplier in [f64::NAN, 0.0, -3.0] {
            let opts = RunOptions {
                timeout_multiplier: multiplier,
                ..RunOptions::default()
            };
            assert_eq!(opts.effective_max_time(&spec), Duration::from_secs(20));
        }
    }

    #[test]
    fn test_negative_and_nan_limits_are_zero() {
        let spec = TestSpec {
            max_time: f64::NAN,
            min_reported_time: -1.0,
            ..sim_spec("a")
        };
        assert_eq!(spec.max_time(), Duration::ZERO);
        assert_eq!(spec.min_reported_time(), Duration::ZERO);
    }
}
