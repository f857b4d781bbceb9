//! Run-wide options shared by the evaluator, planner and scheduler.

use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::core::spec::{TestSpec, ValgrindMode, saturating_secs};

/// How heavy tests take part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeavyMode {
    /// Heavy tests are skipped.
    #[default]
    Exclude,
    /// Heavy and normal tests both run.
    Include,
    /// Only heavy tests run; everything else is silent.
    Only,
}

/// Which skip reasons the user asked to disregard.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IgnoredCaveats {
    #[default]
    None,
    /// Lowercase reason keys such as `platform` or `heavy`.
    Keys(BTreeSet<String>),
    /// Every reason is ignored; silent filters still apply.
    All,
}

impl IgnoredCaveats {
    /// Builds the ignore set from user words; `all` anywhere ignores everything.
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: BTreeSet<String> = words
            .into_iter()
            .flat_map(|w| {
                w.as_ref()
                    .split_whitespace()
                    .map(|s| s.to_ascii_lowercase())
                    .collect::<Vec<_>>()
            })
            .collect();
        if keys.contains("all") {
            IgnoredCaveats::All
        } else if keys.is_empty() {
            IgnoredCaveats::None
        } else {
            IgnoredCaveats::Keys(keys)
        }
    }

    pub fn ignores(&self, key: &str) -> bool {
        match self {
            IgnoredCaveats::None => false,
            IgnoredCaveats::Keys(keys) => keys.contains(&key.to_ascii_lowercase()),
            IgnoredCaveats::All => true,
        }
    }
}

/// What happens to dependents of a failed prerequisite.
/// 前置测试失败时其依赖项的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamFailurePolicy {
    /// Dependents fail without running.
    #[default]
    Block,
    /// Dependents run anyway and carry a caveat.
    Flag,
}

impl FromStr for UpstreamFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "flag" => Ok(Self::Flag),
            other => Err(format!("unknown upstream failure policy '{other}'")),
        }
    }
}

/// What happens to tests that would write the same output file concurrently.
/// 并发写入相同输出文件的测试的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Both tests fail before anything runs.
    #[default]
    Fail,
    /// The tests run, but never at the same time.
    Serialize,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "serialize" => Ok(Self::Serialize),
            other => Err(format!("unknown conflict policy '{other}'")),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Fail => write!(f, "fail"),
            ConflictPolicy::Serialize => write!(f, "serialize"),
        }
    }
}

/// Options that apply to every test in a single harness invocation.
/// 适用于单次调用中所有测试的选项。
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of slots in use at once / 同时占用的最大槽位数
    pub jobs: usize,
    /// Stop admitting new work while the 1-minute load average is at or above this.
    pub max_load: Option<f64>,
    /// Requested process count per test, clamped by each test's limits.
    pub parallel: u32,
    /// Requested thread count per test, clamped by each test's limits.
    pub threads: u32,
    pub name_filter: Option<Regex>,
    pub group: Option<String>,
    pub not_group: Option<String>,
    pub heavy: HeavyMode,
    pub ignored_caveats: IgnoredCaveats,
    pub dry_run: bool,
    pub valgrind: Option<ValgrindMode>,
    pub timeout_multiplier: f64,
    pub check_input: bool,
    pub no_check_input: bool,
    pub scaling: bool,
    /// Once this many tests failed, the rest fail without running.
    pub max_fails: usize,
    pub upstream_failure: UpstreamFailurePolicy,
    pub conflict_policy: ConflictPolicy,
    /// Width available for skip reasons on a result line.
    pub term_cols: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            max_load: None,
            parallel: 1,
            threads: 1,
            name_filter: None,
            group: None,
            not_group: None,
            heavy: HeavyMode::Exclude,
            ignored_caveats: IgnoredCaveats::None,
            dry_run: false,
            valgrind: None,
            timeout_multiplier: 1.0,
            check_input: false,
            no_check_input: false,
            scaling: false,
            max_fails: 50,
            upstream_failure: UpstreamFailurePolicy::Block,
            conflict_policy: ConflictPolicy::Fail,
            term_cols: 110,
        }
    }
}

impl RunOptions {
    /// The wall-time limit for a test under these options.
    pub fn effective_max_time(&self, spec: &TestSpec) -> Duration {
        let valgrind = self.valgrind.map_or(1.0, ValgrindMode::time_multiplier);
        // A multiplier that is NaN or not positive leaves the limit unscaled.
        let user = if self.timeout_multiplier > 0.0 {
            self.timeout_multiplier
        } else {
            1.0
        };
        saturating_secs(spec.max_time.max(0.0) * valgrind * user)
    }

    /// Number of skip-reason characters that fit on a result line.
    pub fn reason_width(&self) -> usize {
        self.term_cols.saturating_sub(40).max(20)
    }
}
