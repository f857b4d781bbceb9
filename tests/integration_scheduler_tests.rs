//! # Scheduler Integration Tests / 调度器集成测试
//!
//! This module runs real subprocesses through the scheduler, testing the
//! concurrency ceiling, prerequisite ordering, output-conflict policies,
//! timeouts, cancellation and the upstream-failure policies.
//!
//! 此模块通过调度器运行真实的子进程，测试并发上限、前置顺序、
//! 输出冲突策略、超时、取消以及上游失败策略。

#![cfg(unix)]

mod common;

use common::{Event, RecordingSink, plan, shell_spec, status_of, tester};
use sim_harness::core::options::{ConflictPolicy, RunOptions, UpstreamFailurePolicy};
use sim_harness::core::scheduler::Scheduler;
use sim_harness::core::spec::{GoldFile, TestSpec};
use sim_harness::core::status::TestStatus;
use sim_harness::infra::load::{FixedLoad, LoadSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn options(jobs: usize) -> RunOptions {
    RunOptions {
        jobs,
        ..RunOptions::default()
    }
}

/// The five-test scenario: a passing root, a failing dependent, a skipped
/// test and two tests writing the same file.
fn scenario(dir: &Path) -> Vec<TestSpec> {
    let writer = |name: &str| TestSpec {
        output_files: vec!["out.e".into()],
        ..shell_spec(name, dir, &format!("sleep 0.3; echo {name} > out.e"))
    };
    vec![
        shell_spec("a", dir, "sleep 0.2"),
        TestSpec {
            prereqs: vec!["a".to_string()],
            ..shell_spec("b", dir, "exit 1")
        },
        TestSpec {
            skip: Some("unsupported platform".to_string()),
            ..shell_spec("c", dir, "touch c_ran")
        },
        writer("d"),
        writer("e"),
    ]
}

#[cfg(test)]
mod admission_tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrency_never_exceeds_jobs() {
        let dir = TempDir::new().unwrap();
        let specs = (0..10)
            .map(|i| shell_spec(&format!("t{i}"), dir.path(), "sleep 0.3"))
            .collect();
        let opts = options(3);
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert_eq!(sink.max_in_flight(), 3);
        assert_eq!(summary.tally.passed, 10);
        assert!(summary.success());
        assert!(summary.testers.iter().all(|t| t.status() == TestStatus::Pass));
    }

    #[tokio::test]
    async fn test_slots_count_procs_times_threads() {
        let dir = TempDir::new().unwrap();
        let wide = |name: &str| TestSpec {
            command: Some("sh -c 'sleep 0.2'".to_string()),
            min_threads: 2,
            ..common::spec_in(name, dir.path())
        };
        let opts = options(3);
        let plan = plan(vec![wide("w1"), wide("w2"), wide("w3")], &opts).unwrap();
        assert!(plan.testers.iter().all(|t| t.slots() == 2));
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert_eq!(sink.max_in_flight(), 1);
        assert_eq!(summary.tally.passed, 3);
    }

    #[tokio::test]
    async fn test_test_wider_than_pool_runs_alone() {
        let dir = TempDir::new().unwrap();
        let huge = TestSpec {
            command: Some("sh -c 'sleep 0.2'".to_string()),
            min_threads: 8,
            ..common::spec_in("huge", dir.path())
        };
        let small = shell_spec("small", dir.path(), "sleep 0.2");
        let opts = options(2);
        let plan = plan(vec![huge, small], &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert_eq!(summary.tally.passed, 2);
        assert!(!sink.overlapped("huge", "small"));
    }

    /// Reports an idle host for the first `idle_samples` readings, then a busy one.
    struct RisingLoad {
        samples: AtomicUsize,
        idle_samples: usize,
    }

    impl LoadSource for RisingLoad {
        fn load_average(&self) -> Option<f64> {
            let seen = self.samples.fetch_add(1, Ordering::SeqCst);
            Some(if seen < self.idle_samples { 0.0 } else { 64.0 })
        }
    }

    #[tokio::test]
    async fn test_load_is_rechecked_before_each_admission() {
        let dir = TempDir::new().unwrap();
        let specs = (0..3)
            .map(|i| shell_spec(&format!("t{i}"), dir.path(), "sleep 0.3"))
            .collect();
        let opts = RunOptions {
            max_load: Some(1.0),
            ..options(4)
        };
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_load_source(RisingLoad {
                samples: AtomicUsize::new(0),
                idle_samples: 1,
            })
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        // The first test starts on an idle pool, the second on the one idle
        // reading, and the third must wait for the pool to drain.
        assert_eq!(sink.max_in_flight(), 2);
        assert_eq!(summary.tally.passed, 3);
    }

    #[tokio::test]
    async fn test_high_load_admits_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let specs = (0..3)
            .map(|i| shell_spec(&format!("t{i}"), dir.path(), "sleep 0.2"))
            .collect();
        let opts = RunOptions {
            max_load: Some(1.0),
            ..options(4)
        };
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_load_source(FixedLoad(64.0))
            .with_tick(Duration::from_millis(50))
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert_eq!(sink.max_in_flight(), 1);
        assert_eq!(summary.tally.passed, 3);
    }
}

#[cfg(test)]
mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_mixed_suite_with_conflicts_failing() {
        let dir = TempDir::new().unwrap();
        let opts = options(4);
        let plan = plan(scenario(dir.path()), &opts).unwrap();
        assert_eq!(plan.conflicts.len(), 1);
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;
        let testers = &summary.testers;

        assert_eq!(status_of(testers, "a"), TestStatus::Pass);

        assert_eq!(status_of(testers, "b"), TestStatus::Fail);
        assert_eq!(tester(testers, "b").reason(), "EXIT CODE 1 != 0");
        let a_done = sink
            .position(&Event::Finished("a".to_string(), TestStatus::Pass))
            .unwrap();
        let b_started = sink.position(&Event::Started("b".to_string())).unwrap();
        assert!(a_done < b_started);

        assert_eq!(status_of(testers, "c"), TestStatus::Skip);
        assert_eq!(tester(testers, "c").reason(), "unsupported platform");
        assert!(sink.position(&Event::Started("c".to_string())).is_none());
        assert!(!dir.path().join("c_ran").exists());

        assert_eq!(tester(testers, "d").reason(), "OUTPUT CONFLICT WITH e");
        assert_eq!(tester(testers, "e").reason(), "OUTPUT CONFLICT WITH d");
        assert!(sink.position(&Event::Started("d".to_string())).is_none());

        assert_eq!(summary.tally.passed, 1);
        assert_eq!(summary.tally.failed, 3);
        assert_eq!(summary.tally.skipped, 1);
        assert!(!summary.success());
    }

    #[tokio::test]
    async fn test_mixed_suite_with_conflicts_serialized() {
        let dir = TempDir::new().unwrap();
        let opts = RunOptions {
            conflict_policy: ConflictPolicy::Serialize,
            ..options(4)
        };
        let plan = plan(scenario(dir.path()), &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;
        let testers = &summary.testers;

        assert_eq!(status_of(testers, "d"), TestStatus::Pass);
        assert_eq!(status_of(testers, "e"), TestStatus::Pass);
        assert!(!sink.overlapped("d", "e"));
        assert!(tester(testers, "d").caveats().any(|c| c == "serialized with e"));
        assert_eq!(summary.tally.passed, 3);
        assert_eq!(summary.tally.failed, 1);
        assert_eq!(summary.tally.skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_prerequisite_blocks_dependent() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            shell_spec("root", dir.path(), "exit 2"),
            TestSpec {
                prereqs: vec!["root".to_string()],
                ..shell_spec("child", dir.path(), "touch child_ran")
            },
        ];
        let opts = options(2);
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert_eq!(tester(&summary.testers, "child").reason(), "PREREQ FAILED: root");
        assert!(sink.position(&Event::Started("child".to_string())).is_none());
        assert!(!dir.path().join("child_ran").exists());
        assert_eq!(summary.tally.failed, 2);
    }

    #[tokio::test]
    async fn test_flag_policy_runs_dependent_with_caveat() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            shell_spec("root", dir.path(), "exit 2"),
            TestSpec {
                prereqs: vec!["root".to_string()],
                ..shell_spec("child", dir.path(), "true")
            },
        ];
        let opts = RunOptions {
            upstream_failure: UpstreamFailurePolicy::Flag,
            ..options(2)
        };
        let plan = plan(specs, &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let child = tester(&summary.testers, "child");

        assert_eq!(child.status(), TestStatus::Pass);
        assert!(child.caveats().any(|c| c == "prereq root failed"));
    }

    #[tokio::test]
    async fn test_skipped_prerequisite_unblocks_dependent() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            TestSpec {
                skip: Some("no mesh".to_string()),
                ..shell_spec("root", dir.path(), "true")
            },
            TestSpec {
                prereqs: vec!["root".to_string()],
                ..shell_spec("child", dir.path(), "true")
            },
        ];
        let opts = options(2);
        let plan = plan(specs, &opts).unwrap();
        let summary = Scheduler::new(opts).execute(plan).await;
        assert_eq!(status_of(&summary.testers, "child"), TestStatus::Pass);
    }
}

#[cfg(test)]
mod limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_fails_test() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec {
            max_time: 0.5,
            ..shell_spec("slow", dir.path(), "sleep 5")
        };
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let slow = tester(&summary.testers, "slow");

        assert_eq!(slow.status(), TestStatus::Fail);
        assert_eq!(slow.reason(), "TIMEOUT");
        assert!(summary.elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_timeout_multiplier_extends_limit() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec {
            max_time: 0.2,
            ..shell_spec("slow", dir.path(), "sleep 0.5")
        };
        let opts = RunOptions {
            timeout_multiplier: 10.0,
            ..options(1)
        };
        let plan = plan(vec![spec], &opts).unwrap();
        let summary = Scheduler::new(opts).execute(plan).await;
        assert_eq!(status_of(&summary.testers, "slow"), TestStatus::Pass);
    }

    #[tokio::test]
    async fn test_huge_time_limits_do_not_abort_the_run() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            TestSpec {
                max_time: 1e30,
                ..shell_spec("big", dir.path(), "exit 0")
            },
            TestSpec {
                max_time: f64::INFINITY,
                min_reported_time: f64::INFINITY,
                ..shell_spec("endless", dir.path(), "exit 0")
            },
        ];
        let opts = RunOptions {
            timeout_multiplier: 1e300,
            ..options(2)
        };
        let plan = plan(specs, &opts).unwrap();

        let summary = Scheduler::new(opts).run(plan).join().await.unwrap();
        assert_eq!(status_of(&summary.testers, "big"), TestStatus::Pass);
        assert_eq!(status_of(&summary.testers, "endless"), TestStatus::Pass);
        assert_eq!(summary.tally.passed, 2);
    }

    #[tokio::test]
    async fn test_max_fails_stops_further_work() {
        let dir = TempDir::new().unwrap();
        let specs = (0..5)
            .map(|i| shell_spec(&format!("t{i}"), dir.path(), "exit 1"))
            .collect();
        let opts = RunOptions {
            max_fails: 2,
            ..options(1)
        };
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let summary = Scheduler::new(opts)
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        assert!(summary.max_fails_reached);
        assert_eq!(sink.started_count(), 2);
        assert_eq!(summary.tally.failed, 5);
        for name in ["t2", "t3", "t4"] {
            assert_eq!(tester(&summary.testers, name).reason(), "MAX FAILURES");
        }
    }

    #[tokio::test]
    async fn test_long_running_notice() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec {
            min_reported_time: 0.1,
            ..shell_spec("slow", dir.path(), "sleep 0.6")
        };
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();
        let sink = RecordingSink::default();

        Scheduler::new(opts)
            .with_tick(Duration::from_millis(50))
            .with_sink(sink.clone())
            .execute(plan)
            .await;

        let notices = sink
            .events()
            .iter()
            .filter(|e| matches!(e, Event::LongRunning(_)))
            .count();
        assert_eq!(notices, 1);
    }
}

#[cfg(test)]
mod execution_mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_passes_without_running() {
        let dir = TempDir::new().unwrap();
        let opts = RunOptions {
            dry_run: true,
            ..options(2)
        };
        let plan = plan(
            vec![shell_spec("a", dir.path(), "touch ran; exit 1")],
            &opts,
        )
        .unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let a = tester(&summary.testers, "a");

        assert_eq!(a.status(), TestStatus::Pass);
        assert!(a.caveats().any(|c| c == "DRY RUN"));
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_should_execute_false_checks_outputs_only() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec {
            should_execute: false,
            ..shell_spec("a", dir.path(), "touch ran")
        };
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;

        assert_eq!(status_of(&summary.testers, "a"), TestStatus::Pass);
        assert!(!dir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_stale_outputs_are_removed_before_running() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("out.csv"), "old").unwrap();
        let spec = TestSpec {
            output_files: vec!["out.csv".into()],
            ..shell_spec("a", dir.path(), "test ! -e out.csv")
        };
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        assert_eq!(status_of(&summary.testers, "a"), TestStatus::Pass);
    }

    #[tokio::test]
    async fn test_missing_working_directory_fails_launch() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("a", &dir.path().join("nowhere"), "true");
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let a = tester(&summary.testers, "a");
        assert_eq!(a.status(), TestStatus::Fail);
        assert_eq!(a.reason(), "LAUNCH FAILED");
    }

    #[tokio::test]
    async fn test_output_and_timing_are_recorded() {
        let dir = TempDir::new().unwrap();
        let opts = options(1);
        let plan = plan(vec![shell_spec("a", dir.path(), "echo hello")], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let a = tester(&summary.testers, "a");
        assert_eq!(a.output(), "hello\n");
        assert_eq!(a.exit_code(), Some(0));
        assert!(a.started_at().is_some());
        assert!(a.finished_at().is_some());
        assert_eq!(summary.longest(5).len(), 1);
    }

    #[tokio::test]
    async fn test_gold_mismatch_is_a_diff() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("gold")).unwrap();
        std::fs::write(dir.path().join("gold/out.csv"), "t,u\n0,1.0\n1,2.0\n").unwrap();
        let gold = |output: &str| GoldFile {
            output: output.into(),
            gold: "gold/out.csv".into(),
            rel_tol: 1e-6,
            abs_zero: 1e-10,
        };
        let specs = vec![
            TestSpec {
                gold: vec![gold("same.csv")],
                ..shell_spec("same", dir.path(), "printf 't,u\\n0,1.0\\n1,2.0\\n' > same.csv")
            },
            TestSpec {
                gold: vec![gold("drift.csv")],
                ..shell_spec("drift", dir.path(), "printf 't,u\\n0,1.0\\n1,2.5\\n' > drift.csv")
            },
        ];
        let opts = options(2);
        let plan = plan(specs, &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        assert_eq!(status_of(&summary.testers, "same"), TestStatus::Pass);
        let drift = tester(&summary.testers, "drift");
        assert_eq!(drift.status(), TestStatus::Diff);
        assert_eq!(drift.reason(), "drift.csv:3");
        assert_eq!(summary.tally.diffed, 1);
    }

    /// Output that is not valid UTF-8 is kept and the pipes keep draining, so a
    /// chatty test that prints stray bytes still passes.
    #[tokio::test]
    async fn test_invalid_utf8_output_is_captured() {
        let dir = TempDir::new().unwrap();
        let spec = TestSpec {
            expect_out: Some("DONE".to_string()),
            ..shell_spec(
                "binary",
                dir.path(),
                "printf 'x\\377y\\n'; i=0; while [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done; echo DONE",
            )
        };
        let opts = options(1);
        let plan = plan(vec![spec], &opts).unwrap();

        let summary = Scheduler::new(opts).execute(plan).await;
        let binary = tester(&summary.testers, "binary");
        assert_eq!(binary.status(), TestStatus::Pass, "{}", binary.reason());
        assert_eq!(binary.exit_code(), Some(0));
        assert!(binary.output().starts_with("x\u{FFFD}y\n"));
        assert!(binary.output().contains("line 1999\n"));
        assert!(binary.output().ends_with("DONE\n"));
    }
}

#[cfg(test)]
mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_terminates_in_flight_tests() {
        let dir = TempDir::new().unwrap();
        let mut specs: Vec<TestSpec> = (0..5)
            .map(|i| shell_spec(&format!("t{i}"), dir.path(), "sleep 30"))
            .collect();
        specs.push(shell_spec("queued", dir.path(), "true"));
        let opts = options(5);
        let plan = plan(specs, &opts).unwrap();
        let sink = RecordingSink::default();

        let handle = Scheduler::new(opts).with_sink(sink.clone()).run(plan);
        assert!(sink.wait_for_started(5, Duration::from_secs(10)).await);
        handle.cancel();
        let summary = handle.join().await.unwrap();

        assert!(summary.interrupted);
        assert!(!summary.success());
        for i in 0..5 {
            let t = tester(&summary.testers, &format!("t{i}"));
            assert_eq!(t.status(), TestStatus::Fail);
            assert_eq!(t.reason(), "CANCELLED");
        }
        assert_eq!(status_of(&summary.testers, "queued"), TestStatus::Initialized);
        assert_eq!(summary.tally.not_run, 1);
        assert_eq!(sink.started_count(), 5);
        assert!(summary.elapsed < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let opts = options(2);
        let plan = plan(vec![shell_spec("a", dir.path(), "touch ran")], &opts).unwrap();
        let scheduler = Scheduler::new(opts);
        scheduler.cancellation_token().cancel();

        let summary = scheduler.execute(plan).await;

        assert!(summary.interrupted);
        assert_eq!(summary.tally.not_run, 1);
        assert!(!dir.path().join("ran").exists());
    }
}
