//! # Scheduler Module / 调度器模块
//!
//! Runs a `RunPlan` on a bounded pool of workers. A single control loop owns
//! every `Tester` and the run counters; workers only run processes and hand
//! their raw outcome back. Completions are therefore applied one at a time,
//! which keeps status updates, counters and reporting consistent without locks.
//!
//! Admission is slot based: a test occupies `procs × threads` slots and the sum
//! across running tests never exceeds `jobs`. A test wider than `jobs` runs
//! alone. When a load ceiling is set and the host is at or above it, nothing new
//! starts while work is in flight; an idle pool still admits one test.
//!
//! 在有界的工作池上执行 `RunPlan`。单一的控制循环拥有所有 `Tester` 与计数器，
//! 工作任务只负责运行进程并返回原始结果，因此完成事件被逐个处理，
//! 无需加锁即可保持状态、计数与报告的一致性。

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::options::{RunOptions, UpstreamFailurePolicy};
use crate::core::planner::RunPlan;
use crate::core::results::{Interpretation, interpret};
use crate::core::spec::TestSpec;
use crate::core::status::{TestStatus, Tester};
use crate::infra::command::{LaunchCommand, ProcessExit, run_supervised};
use crate::infra::fs::remove_stale_outputs;
use crate::infra::load::{LoadSource, SystemLoad};

/// Receives results as the run progresses. Calls are serialized by the scheduler.
/// 随运行推进接收结果。调度器保证调用是串行的。
pub trait ResultSink: Send {
    /// A test was admitted and is about to start.
    fn on_started(&mut self, _tester: &Tester) -> Result<()> {
        Ok(())
    }

    /// A test has been running longer than its reporting threshold.
    fn on_long_running(&mut self, _tester: &Tester, _elapsed: Duration) -> Result<()> {
        Ok(())
    }

    /// A test reached a terminal status. `tally` already includes it.
    fn on_finished(&mut self, tester: &Tester, tally: &Tally) -> Result<()>;

    /// The run is over; no more calls follow.
    fn on_run_complete(&mut self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

/// Running counts of terminal statuses.
/// 各最终状态的累计计数。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
    pub diffed: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub silent: usize,
    /// Tests that never left `INITIALIZED`, e.g. after cancellation.
    pub not_run: usize,
}

impl Tally {
    fn record(&mut self, status: TestStatus) {
        match status {
            TestStatus::Pass => self.passed += 1,
            TestStatus::Fail => self.failed += 1,
            TestStatus::Diff => self.diffed += 1,
            TestStatus::Skip => self.skipped += 1,
            TestStatus::Deleted => self.deleted += 1,
            TestStatus::Silent => self.silent += 1,
            TestStatus::Initialized | TestStatus::Pending => {}
        }
    }

    pub fn failures(&self) -> usize {
        self.failed + self.diffed
    }

    /// Everything that reached a reportable terminal status.
    pub fn reported(&self) -> usize {
        self.passed + self.failures() + self.skipped + self.deleted
    }
}

/// The final state of a run.
/// 一次运行的最终状态。
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub testers: Vec<Tester>,
    pub tally: Tally,
    pub interrupted: bool,
    pub max_fails_reached: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        !self.interrupted && self.tally.failures() == 0
    }

    /// The `n` tests that took the longest, longest first.
    pub fn longest(&self, n: usize) -> Vec<&Tester> {
        let mut ran: Vec<&Tester> = self
            .testers
            .iter()
            .filter(|t| t.started_at().is_some() && t.finished_at().is_some())
            .collect();
        ran.sort_by(|a, b| b.duration().cmp(&a.duration()));
        ran.truncate(n);
        ran
    }

    pub fn failures(&self) -> impl Iterator<Item = &Tester> {
        self.testers.iter().filter(|t| t.ever_failed())
    }
}

/// Handle to a run started with [`Scheduler::run`].
pub struct RunHandle {
    handle: JoinHandle<RunSummary>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// Stops admitting work and kills everything in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the run to finish.
    pub async fn join(self) -> Result<RunSummary> {
        self.handle.await.context("scheduler task failed")
    }
}

/// Bounded worker pool with prerequisite ordering, timeouts and cancellation.
pub struct Scheduler {
    options: RunOptions,
    cancel: CancellationToken,
    sinks: Vec<Box<dyn ResultSink>>,
    load: Arc<dyn LoadSource>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
            sinks: vec![],
            load: Arc::new(SystemLoad),
            tick: Duration::from_millis(250),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<Box<dyn ResultSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn with_load_source(mut self, load: impl LoadSource + 'static) -> Self {
        self.load = Arc::new(load);
        self
    }

    /// How often long-running notices and load re-checks happen.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the run on the current tokio runtime.
    pub fn run(self, plan: RunPlan) -> RunHandle {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(self.execute(plan));
        RunHandle { handle, cancel }
    }

    /// Runs the plan to completion on the current task.
    pub async fn execute(self, plan: RunPlan) -> RunSummary {
        Dispatcher::new(self, plan).run().await
    }
}

/// What a worker hands back to the control loop.
struct JobOutcome {
    exit: ProcessExit,
    output: String,
    duration: Duration,
    interpretation: Interpretation,
}

impl JobOutcome {
    fn worker_failed(message: String) -> Self {
        Self {
            exit: ProcessExit::LaunchFailed(message.clone()),
            interpretation: Interpretation {
                status: TestStatus::Fail,
                reason: "LAUNCH FAILED".to_string(),
            },
            output: message,
            duration: Duration::ZERO,
        }
    }
}

/// A process result before interpretation.
struct RawOutcome {
    exit: ProcessExit,
    output: String,
    duration: Duration,
}

struct Job {
    spec: Arc<TestSpec>,
    options: Arc<RunOptions>,
    launch: LaunchCommand,
    max_time: Duration,
    cancel: CancellationToken,
}

impl Job {
    /// Runs the process, then interprets it on the blocking pool since gold
    /// comparison reads whole files.
    async fn run(self) -> JobOutcome {
        let raw = self.execute().await;
        let spec = self.spec;
        let options = self.options;
        let judged = tokio::task::spawn_blocking(move || {
            let interpretation = interpret(&spec, &options, &raw.exit, &raw.output);
            (raw, interpretation)
        })
        .await;
        match judged {
            Ok((raw, interpretation)) => JobOutcome {
                exit: raw.exit,
                output: raw.output,
                duration: raw.duration,
                interpretation,
            },
            Err(e) => JobOutcome::worker_failed(format!("result check failed: {e}")),
        }
    }

    async fn execute(&self) -> RawOutcome {
        let spec = &self.spec;
        if !self.launch.cwd.is_dir() {
            let message = format!(
                "working directory {} does not exist",
                self.launch.cwd.display()
            );
            return RawOutcome {
                exit: ProcessExit::LaunchFailed(message.clone()),
                output: message,
                duration: Duration::ZERO,
            };
        }
        if spec.delete_output_before_running {
            let outputs: Vec<PathBuf> = spec.output_files.iter().map(|f| spec.resolve(f)).collect();
            if let Err(e) = remove_stale_outputs(&outputs).await {
                let message = format!("{e:#}");
                return RawOutcome {
                    exit: ProcessExit::LaunchFailed(message.clone()),
                    output: message,
                    duration: Duration::ZERO,
                };
            }
        }
        if !spec.should_execute {
            return RawOutcome {
                exit: ProcessExit::Exited(0),
                output: String::new(),
                duration: Duration::ZERO,
            };
        }
        let outcome = run_supervised(&self.launch, self.max_time, &self.cancel).await;
        let output = match &outcome.exit {
            ProcessExit::LaunchFailed(message) if outcome.output.is_empty() => message.clone(),
            _ => outcome.output,
        };
        RawOutcome {
            exit: outcome.exit,
            output,
            duration: outcome.duration,
        }
    }
}

struct Running {
    slots: usize,
    started: Instant,
    reported: bool,
}

enum Readiness {
    Waiting,
    Ready,
    Blocked(String),
}

/// The control loop's state. Lives on a single task.
struct Dispatcher {
    options: Arc<RunOptions>,
    cancel: CancellationToken,
    sinks: Vec<Box<dyn ResultSink>>,
    load: Arc<dyn LoadSource>,
    tick: Duration,
    testers: Vec<Tester>,
    prerequisites: Vec<Vec<usize>>,
    exclusions: Vec<Vec<usize>>,
    waiting: Vec<usize>,
    running: HashMap<usize, Running>,
    slots_in_use: usize,
    tally: Tally,
    failures: usize,
    max_fails_reached: bool,
}

impl Dispatcher {
    fn new(scheduler: Scheduler, plan: RunPlan) -> Self {
        let Scheduler {
            options,
            cancel,
            sinks,
            load,
            tick,
        } = scheduler;
        let waiting = plan
            .order
            .iter()
            .copied()
            .filter(|&i| plan.testers[i].status() == TestStatus::Initialized)
            .collect();
        Self {
            options: Arc::new(options),
            cancel,
            sinks,
            load,
            tick,
            testers: plan.testers,
            prerequisites: plan.prerequisites,
            exclusions: plan.exclusions,
            waiting,
            running: HashMap::new(),
            slots_in_use: 0,
            tally: Tally::default(),
            failures: 0,
            max_fails_reached: false,
        }
    }

    async fn run(mut self) -> RunSummary {
        let started = Instant::now();
        let jobs_limit = self.options.jobs.max(1);
        tracing::info!(
            tests = self.testers.len(),
            queued = self.waiting.len(),
            jobs = jobs_limit,
            "starting run"
        );

        // Tests that finished during planning are reported up front.
        for idx in 0..self.testers.len() {
            if self.testers[idx].is_finished() {
                self.record(idx);
            }
        }

        let mut workers: JoinSet<(usize, JobOutcome)> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cancel_seen = false;

        loop {
            if !self.cancel.is_cancelled() {
                self.admit(&mut workers);
            }

            if workers.is_empty() {
                if self.cancel.is_cancelled() || self.waiting.is_empty() {
                    break;
                }
                // Nothing is running and nothing could start: the remaining
                // tests wait on something that will never finish.
                for idx in std::mem::take(&mut self.waiting) {
                    self.fail(idx, "NOT SCHEDULABLE");
                }
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    tracing::info!(in_flight = self.running.len(), "run cancelled");
                }
                joined = workers.join_next() => match joined {
                    Some(Ok((idx, outcome))) => self.complete(idx, outcome),
                    Some(Err(e)) => tracing::error!("worker task failed: {e}"),
                    None => {}
                },
                _ = ticker.tick() => self.report_long_running(),
            }
        }

        let interrupted = self.cancel.is_cancelled();
        self.tally.not_run = self
            .testers
            .iter()
            .filter(|t| t.status() == TestStatus::Initialized)
            .count();

        let mut sinks = std::mem::take(&mut self.sinks);
        let summary = RunSummary {
            testers: self.testers,
            tally: self.tally,
            interrupted,
            max_fails_reached: self.max_fails_reached,
            elapsed: started.elapsed(),
        };
        for sink in &mut sinks {
            if let Err(e) = sink.on_run_complete(&summary) {
                tracing::warn!("result sink failed: {e:#}");
            }
        }
        tracing::info!(
            passed = summary.tally.passed,
            failed = summary.tally.failures(),
            not_run = summary.tally.not_run,
            interrupted,
            "run finished"
        );
        summary
    }

    fn readiness(&self, idx: usize) -> Readiness {
        let mut failed = None;
        for &p in &self.prerequisites[idx] {
            let prereq = &self.testers[p];
            if !prereq.is_finished() {
                return Readiness::Waiting;
            }
            if !prereq.status().unblocks_dependents() && failed.is_none() {
                failed = Some(prereq.name().to_string());
            }
        }
        match failed {
            None => Readiness::Ready,
            Some(name) => match self.options.upstream_failure {
                UpstreamFailurePolicy::Block => Readiness::Blocked(name),
                UpstreamFailurePolicy::Flag => Readiness::Ready,
            },
        }
    }

    fn has_capacity(&self, slots: usize) -> bool {
        let limit = self.options.jobs.max(1);
        if self.running.is_empty() {
            return true;
        }
        self.slots_in_use + slots.min(limit) <= limit
    }

    fn load_too_high(&self) -> bool {
        let Some(ceiling) = self.options.max_load else {
            return false;
        };
        self.load
            .load_average()
            .is_some_and(|load| load >= ceiling)
    }

    fn admit(&mut self, workers: &mut JoinSet<(usize, JobOutcome)>) {
        let mut progressed = true;
        while progressed && !self.waiting.is_empty() {
            progressed = false;
            let mut still_waiting = Vec::with_capacity(self.waiting.len());
            for idx in std::mem::take(&mut self.waiting) {
                match self.readiness(idx) {
                    Readiness::Waiting => still_waiting.push(idx),
                    Readiness::Blocked(prereq) => {
                        self.fail(idx, format!("PREREQ FAILED: {prereq}"));
                        progressed = true;
                    }
                    Readiness::Ready => {
                        if self.max_fails_reached {
                            self.fail(idx, "MAX FAILURES");
                            progressed = true;
                            continue;
                        }
                        let slots = self.testers[idx].slots();
                        let excluded = self.exclusions[idx]
                            .iter()
                            .any(|other| self.running.contains_key(other));
                        if excluded || !self.has_capacity(slots) {
                            still_waiting.push(idx);
                            continue;
                        }
                        // Load is sampled right before each admission.
                        if !self.running.is_empty() && self.load_too_high() {
                            tracing::trace!(test = self.testers[idx].name(), "load too high");
                            still_waiting.push(idx);
                            continue;
                        }
                        self.start(idx, workers);
                        progressed = true;
                    }
                }
            }
            self.waiting = still_waiting;
        }
    }

    fn start(&mut self, idx: usize, workers: &mut JoinSet<(usize, JobOutcome)>) {
        let failed_prereqs: Vec<String> = self.prerequisites[idx]
            .iter()
            .filter(|&&p| self.testers[p].ever_failed())
            .map(|&p| self.testers[p].name().to_string())
            .collect();

        let tester = &mut self.testers[idx];
        for name in failed_prereqs {
            tester.add_caveat(format!("prereq {name} failed"));
        }
        if let Err(e) = tester.set_status(TestStatus::Pending, "") {
            tracing::error!("{e}");
            return;
        }
        tester.mark_started(Utc::now());
        tracing::debug!(test = tester.name(), slots = tester.slots(), "admitted");

        for sink in &mut self.sinks {
            if let Err(e) = sink.on_started(&self.testers[idx]) {
                tracing::warn!("result sink failed: {e:#}");
            }
        }

        if self.options.dry_run {
            let tester = &mut self.testers[idx];
            tester.add_caveat("DRY RUN");
            tester.mark_finished(Utc::now(), Duration::ZERO);
            if let Err(e) = tester.set_status(TestStatus::Pass, "") {
                tracing::error!("{e}");
            }
            self.record(idx);
            return;
        }

        let tester = &self.testers[idx];
        let Some(launch) = tester.launch().cloned() else {
            self.finish_with(idx, TestStatus::Fail, "NO COMMAND".to_string());
            return;
        };
        let job = Job {
            spec: tester.shared_spec(),
            options: Arc::clone(&self.options),
            launch,
            max_time: self.options.effective_max_time(tester.spec()),
            cancel: self.cancel.clone(),
        };
        let slots = tester.slots().min(self.options.jobs.max(1));

        workers.spawn(async move {
            // The inner task contains panics to the one test that caused them.
            match tokio::spawn(job.run()).await {
                Ok(outcome) => (idx, outcome),
                Err(e) => (idx, JobOutcome::worker_failed(format!("worker failed: {e}"))),
            }
        });
        self.running.insert(
            idx,
            Running {
                slots,
                started: Instant::now(),
                reported: false,
            },
        );
        self.slots_in_use += slots;
    }

    fn complete(&mut self, idx: usize, outcome: JobOutcome) {
        if let Some(running) = self.running.remove(&idx) {
            self.slots_in_use = self.slots_in_use.saturating_sub(running.slots);
        }
        let interpretation = outcome.interpretation;
        let exit_code = match outcome.exit {
            ProcessExit::Exited(code) => Some(code),
            _ => None,
        };
        let tester = &mut self.testers[idx];
        tester.mark_finished(Utc::now(), outcome.duration);
        tester.record_output(exit_code, outcome.output);
        self.finish_with(idx, interpretation.status, interpretation.reason);
    }

    /// Fails a test that never started.
    fn fail(&mut self, idx: usize, reason: impl Into<String>) {
        match self.testers[idx].set_status(TestStatus::Fail, reason) {
            Ok(()) => self.record(idx),
            Err(e) => tracing::error!("{e}"),
        }
    }

    fn finish_with(&mut self, idx: usize, status: TestStatus, reason: String) {
        match self.testers[idx].set_status(status, reason) {
            Ok(()) => self.record(idx),
            Err(e) => tracing::error!("{e}"),
        }
    }

    /// Counts a terminal status and hands it to the sinks.
    fn record(&mut self, idx: usize) {
        let status = self.testers[idx].status();
        self.tally.record(status);
        if status.is_failure() {
            self.failures += 1;
            if self.options.max_fails > 0 && self.failures >= self.options.max_fails {
                if !self.max_fails_reached {
                    tracing::warn!(failures = self.failures, "maximum failures reached");
                }
                self.max_fails_reached = true;
            }
        }
        tracing::debug!(test = self.testers[idx].name(), %status, "finished");
        for sink in &mut self.sinks {
            if let Err(e) = sink.on_finished(&self.testers[idx], &self.tally) {
                tracing::warn!("result sink failed: {e:#}");
            }
        }
    }

    fn report_long_running(&mut self) {
        for (&idx, running) in self.running.iter_mut() {
            let elapsed = running.started.elapsed();
            let tester = &self.testers[idx];
            if running.reported || elapsed < tester.spec().min_reported_time() {
                continue;
            }
            running.reported = true;
            for sink in &mut self.sinks {
                if let Err(e) = sink.on_long_running(tester, elapsed) {
                    tracing::warn!("result sink failed: {e:#}");
                }
            }
        }
    }
}
