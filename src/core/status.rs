//! # Test Status Module / 测试状态模块
//!
//! `TestStatus` is the per-test state machine and `Tester` is the mutable record
//! the scheduler keeps for each test. A finished status is sticky: once a test
//! has passed, failed, diffed, been skipped, deleted or silenced, nothing moves
//! it again.
//!
//! `TestStatus` 是每个测试的状态机，`Tester` 是调度器为每个测试维护的可变记录。
//! 完成状态是粘滞的：一旦确定，便不可再改变。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::evaluator::Verdict;
use crate::core::spec::TestSpec;
use crate::infra::command::LaunchCommand;

/// The lifecycle state of one test.
/// 单个测试的生命周期状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Initialized,
    Pending,
    Pass,
    Fail,
    Diff,
    Skip,
    Silent,
    Deleted,
}

impl TestStatus {
    /// Anything but `Initialized` and `Pending`.
    pub fn is_finished(self) -> bool {
        !matches!(self, TestStatus::Initialized | TestStatus::Pending)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Diff)
    }

    /// Whether a dependent may start once its prerequisite is in this state.
    pub fn unblocks_dependents(self) -> bool {
        matches!(
            self,
            TestStatus::Pass | TestStatus::Skip | TestStatus::Silent | TestStatus::Deleted
        )
    }

    fn can_transition_to(self, next: TestStatus) -> bool {
        use TestStatus::*;
        match self {
            Initialized => matches!(next, Pending | Skip | Silent | Deleted | Fail),
            Pending => matches!(next, Pass | Fail | Diff),
            _ => false,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TestStatus::Initialized => "INITIALIZED",
            TestStatus::Pending => "PENDING",
            TestStatus::Pass => "OK",
            TestStatus::Fail => "FAILED",
            TestStatus::Diff => "DIFF",
            TestStatus::Skip => "SKIP",
            TestStatus::Silent => "SILENT",
            TestStatus::Deleted => "DELETED",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("test '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: TestStatus,
        to: TestStatus,
    },
}

/// The mutable per-test record owned by the scheduler.
/// 调度器持有的每个测试的可变记录。
#[derive(Debug, Clone)]
pub struct Tester {
    spec: Arc<TestSpec>,
    status: TestStatus,
    reason: String,
    caveats: BTreeSet<String>,
    launch: Option<LaunchCommand>,
    slots: usize,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    exit_code: Option<i32>,
    output: String,
}

impl Tester {
    pub fn new(spec: Arc<TestSpec>) -> Self {
        Self {
            spec,
            status: TestStatus::Initialized,
            reason: String::new(),
            caveats: BTreeSet::new(),
            launch: None,
            slots: 1,
            started_at: None,
            finished_at: None,
            duration: None,
            exit_code: None,
            output: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub fn shared_spec(&self) -> Arc<TestSpec> {
        Arc::clone(&self.spec)
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    /// The short message attached to the current status (e.g. `TIMEOUT`).
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn ever_failed(&self) -> bool {
        self.status.is_failure()
    }

    /// Moves to `next`, recording `reason`. Illegal moves leave the record untouched.
    pub fn set_status(
        &mut self,
        next: TestStatus,
        reason: impl Into<String>,
    ) -> Result<(), StatusError> {
        if !self.status.can_transition_to(next) {
            return Err(StatusError::InvalidTransition {
                name: self.name().to_string(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.reason = reason.into();
        Ok(())
    }

    /// Applies a runnability verdict. `Runnable` leaves the test initialized.
    pub fn apply_verdict(&mut self, verdict: &Verdict) -> Result<(), StatusError> {
        match verdict {
            Verdict::Runnable => Ok(()),
            Verdict::Skipped(reason) => self.set_status(TestStatus::Skip, reason.clone()),
            Verdict::Deleted(reason) => self.set_status(TestStatus::Deleted, reason.clone()),
            Verdict::Silent => self.set_status(TestStatus::Silent, ""),
        }
    }

    pub fn add_caveat(&mut self, caveat: impl Into<String>) {
        let caveat = caveat.into();
        if !caveat.is_empty() {
            self.caveats.insert(caveat);
        }
    }

    pub fn caveats(&self) -> impl Iterator<Item = &str> {
        self.caveats.iter().map(String::as_str)
    }

    pub fn launch(&self) -> Option<&LaunchCommand> {
        self.launch.as_ref()
    }

    pub fn set_launch(&mut self, launch: LaunchCommand, slots: usize) {
        self.launch = Some(launch);
        self.slots = slots.max(1);
    }

    /// Processes times threads this test occupies while running.
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
    }

    pub fn mark_finished(&mut self, at: DateTime<Utc>, duration: Duration) {
        self.finished_at = Some(at);
        self.duration = Some(duration);
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Wall time of the run, zero if it never ran.
    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or_default()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn record_output(&mut self, exit_code: Option<i32>, output: String) {
        self.exit_code = exit_code;
        self.output = output;
    }
}
