//! # Runnability Evaluator / 可运行性评估器
//!
//! Decides, before anything is scheduled, whether a test runs, is skipped with a
//! reason, is deleted, or is silently filtered out. Evaluation is a pure function
//! of the test spec, the detected environment, the run options and a few read-only
//! host probes, so evaluating the same test twice gives the same verdict.
//!
//! 在调度之前决定一个测试是运行、带原因跳过、被删除，还是被静默过滤。
//! 评估只依赖规格、检测到的环境、运行选项和少量只读的主机探测，
//! 因此对同一测试评估两次会得到相同的结论。

use anyhow::{Context, Result, bail};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::process::Command;
use std::sync::{Arc, Mutex};

use crate::core::options::{HeavyMode, IgnoredCaveats, RunOptions};
use crate::core::spec::{Axis, RunEnvironment, TestSpec};
use crate::infra::fs::find_executable;

/// The outcome of evaluating one test.
/// 单个测试的评估结果。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Runnable,
    Skipped(String),
    Deleted(String),
    /// Filtered out and never reported.
    Silent,
}

impl Verdict {
    pub fn is_runnable(&self) -> bool {
        matches!(self, Verdict::Runnable)
    }
}

/// Source of the capability set an executable was built with.
pub trait CapabilityProvider: Send + Sync {
    fn capabilities(&self, executable: &str) -> Result<BTreeSet<String>>;
}

/// Asks the executable itself via `--show-capabilities`, which prints a JSON object.
/// Keys with a truthy value count as available.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutableCapabilities;

impl CapabilityProvider for ExecutableCapabilities {
    fn capabilities(&self, executable: &str) -> Result<BTreeSet<String>> {
        let output = Command::new(executable)
            .arg("--show-capabilities")
            .output()
            .with_context(|| format!("failed to invoke '{executable} --show-capabilities'"))?;
        if !output.status.success() {
            bail!(
                "'{executable} --show-capabilities' exited with {}",
                output.status
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_capabilities(&stdout)
    }
}

/// Extracts the available capability names from a JSON object.
pub fn parse_capabilities(json: &str) -> Result<BTreeSet<String>> {
    let value: serde_json::Value =
        serde_json::from_str(json.trim()).context("capabilities are not valid JSON")?;
    let object = value
        .as_object()
        .context("capabilities must be a JSON object")?;
    Ok(object
        .iter()
        .filter(|(_, v)| match v {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            _ => true,
        })
        .map(|(k, _)| k.to_ascii_lowercase())
        .collect())
}

/// A fixed capability set, for suites that declare capabilities up front and for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCapabilities(pub BTreeSet<String>);

impl CapabilityProvider for StaticCapabilities {
    fn capabilities(&self, _executable: &str) -> Result<BTreeSet<String>> {
        Ok(self.0.clone())
    }
}

type CapabilitySlot = Arc<OnceCell<Result<BTreeSet<String>, String>>>;

/// Memoizes capability lookups per executable. Each executable is asked at most once.
/// 按可执行文件缓存能力查询，每个可执行文件最多查询一次。
pub struct CapabilityCache {
    provider: Box<dyn CapabilityProvider>,
    entries: Mutex<HashMap<String, CapabilitySlot>>,
}

impl CapabilityCache {
    pub fn new(provider: impl CapabilityProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, executable: &str) -> Result<BTreeSet<String>, String> {
        let slot = {
            let mut entries = match self.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries
                .entry(executable.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        slot.get_or_init(|| {
            tracing::debug!(executable, "querying capabilities");
            self.provider
                .capabilities(executable)
                .map_err(|e| format!("{e:#}"))
        })
        .clone()
    }
}

/// Skip reasons keyed by the caveat name, in the order they were found.
#[derive(Debug, Default)]
struct Reasons(Vec<(String, String)>);

impl Reasons {
    fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    fn retain_unignored(self, options: &RunOptions) -> Self {
        Reasons(
            self.0
                .into_iter()
                .filter(|(k, _)| !options.ignored_caveats.ignores(k))
                .collect(),
        )
    }

    fn joined(&self) -> String {
        self.0
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Cuts `text` to `width` characters, marking the cut with `...`.
pub fn truncate_reason(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let keep = width.saturating_sub(3);
    let mut cut: String = text.chars().take(keep).collect();
    cut.push_str("...");
    cut
}

/// Evaluates tests against one environment and one set of run options.
pub struct RunnabilityEvaluator<'a> {
    env: &'a RunEnvironment,
    options: &'a RunOptions,
    capabilities: &'a CapabilityCache,
    default_executable: Option<&'a str>,
}

impl<'a> RunnabilityEvaluator<'a> {
    pub fn new(
        env: &'a RunEnvironment,
        options: &'a RunOptions,
        capabilities: &'a CapabilityCache,
    ) -> Self {
        Self {
            env,
            options,
            capabilities,
            default_executable: None,
        }
    }

    /// Executable used for capability checks when a test names none.
    pub fn with_default_executable(mut self, executable: Option<&'a str>) -> Self {
        self.default_executable = executable;
        self
    }

    pub fn evaluate(&self, spec: &TestSpec) -> Verdict {
        let options = self.options;

        // Silent filters come first: these tests are never reported.
        if options.check_input && !spec.check_input {
            return Verdict::Silent;
        }
        if options.no_check_input && spec.check_input {
            return Verdict::Silent;
        }
        if let Some(group) = &options.group {
            if !spec.group.iter().any(|g| g == group) {
                return Verdict::Silent;
            }
        }
        if let Some(group) = &options.not_group {
            if spec.group.iter().any(|g| g == group) {
                return Verdict::Silent;
            }
        }
        if let Some(re) = &options.name_filter {
            if !re.is_match(&spec.name) {
                return Verdict::Silent;
            }
        }

        if options.ignored_caveats == IgnoredCaveats::All {
            return Verdict::Runnable;
        }

        let mut reasons = Reasons::default();

        if let Some(deleted) = &spec.deleted {
            reasons.insert("deleted", deleted.clone());
        }

        if let Some(skip) = &spec.skip {
            let reason = if skip.trim().is_empty() {
                "no reason".to_string()
            } else {
                skip.clone()
            };
            reasons.insert("skip", reason);
        } else if options.scaling && spec.scale_refine == 0 {
            return Verdict::Silent;
        } else if let Some(mode) = options.valgrind {
            if spec.valgrind != mode {
                reasons.insert("valgrind", format!("Valgrind=={}", spec.valgrind));
            } else if spec.min_threads > 1 {
                reasons.insert("valgrind", "Valgrind requires non-threaded");
            } else if spec.min_parallel > 1 {
                reasons.insert("valgrind", "Valgrind requires serial");
            } else if spec.check_input {
                reasons.insert("valgrind", "check_input==True");
            }
        }

        self.check_library_version(spec, &mut reasons);
        for axis in Axis::ALL {
            self.check_axis(spec, axis, &mut reasons);
        }
        self.check_capabilities(spec, &mut reasons);

        let missing_features: Vec<&str> = spec
            .features
            .iter()
            .filter(|f| !self.env.features.contains(f.as_str()))
            .map(String::as_str)
            .collect();
        if !missing_features.is_empty() {
            reasons.insert("features", format!("NO {}", missing_features.join(", ")));
        }

        match options.heavy {
            HeavyMode::Only if !spec.heavy => reasons.insert("heavy", "NOT HEAVY"),
            HeavyMode::Exclude if spec.heavy => reasons.insert("heavy", "HEAVY"),
            _ => {}
        }

        if spec
            .depend_files
            .iter()
            .any(|file| !spec.resolve(file).is_file())
        {
            reasons.insert("depend_files", "DEPEND FILES");
        }

        for submodule in &spec.required_submodule {
            if !self.env.submodules.contains(submodule) {
                reasons.insert(
                    "required_submodule",
                    format!("{submodule} submodule not initialized"),
                );
            }
        }

        let is_set = |name: &str| std::env::var_os(name).is_some_and(|v| !v.is_empty());
        if spec.env_vars.iter().any(|v| !is_set(v)) {
            reasons.insert("env_vars", "ENV VAR NOT SET");
        }
        if spec.env_vars_not_set.iter().any(|v| is_set(v)) {
            reasons.insert("env_vars", "ENV VAR SET");
        }

        if spec.display_required && !self.env.has_display {
            reasons.insert("display_required", "NO DISPLAY");
        }

        let missing_programs: Vec<String> = spec
            .requires
            .iter()
            .filter(|program| find_executable(program).is_none())
            .map(|program| format!("no {program}"))
            .collect();
        if !missing_programs.is_empty() {
            reasons.insert("requires", missing_programs.join(", "));
        }

        let reasons = reasons.retain_unignored(options);
        if reasons.0.is_empty() {
            return Verdict::Runnable;
        }

        // Heavy-only runs hide the normal tests instead of listing them as skipped.
        if options.heavy == HeavyMode::Only && !spec.heavy && reasons.contains("heavy") {
            return Verdict::Silent;
        }

        let text = truncate_reason(&reasons.joined(), options.reason_width());
        if reasons.contains("deleted") {
            Verdict::Deleted(text)
        } else {
            Verdict::Skipped(text)
        }
    }

    fn check_library_version(&self, spec: &TestSpec, reasons: &mut Reasons) {
        if spec.library_version.is_empty() {
            return;
        }
        let Some(detected) = &self.env.library_version else {
            reasons.insert("library_version", "NO LIBRARY VERSION");
            return;
        };
        if let Some(failed) = spec
            .library_version
            .iter()
            .find(|constraint| !constraint.is_satisfied_by(detected))
        {
            reasons.insert("library_version", format!("LIBRARY VERSION {failed}"));
        }
    }

    fn check_axis(&self, spec: &TestSpec, axis: Axis, reasons: &mut Reasons) {
        let mut declared = BTreeSet::new();
        let mut negated = false;
        for entry in axis.declared(spec) {
            let value = match entry.strip_prefix('!') {
                Some(rest) => {
                    if negated {
                        reasons.insert(axis.key(), "Multiple Negation Unsupported");
                    }
                    negated = true;
                    rest
                }
                None => entry.as_str(),
            };
            let value = value.to_ascii_uppercase();
            if !declared.insert(value.clone()) {
                reasons.insert(
                    value.clone(),
                    "Duplicate Entry or Negative of Existing Entry",
                );
            }
        }

        let matched = !declared.is_disjoint(&self.env.axis_values(axis));
        // A plain list must match; a negated list must not.
        if negated == matched {
            let operator = if negated { "==" } else { "!=" };
            let values: Vec<&str> = declared.iter().map(String::as_str).collect();
            reasons.insert(
                axis.key(),
                format!(
                    "{}{}{}",
                    axis.key().to_ascii_uppercase(),
                    operator,
                    values.join(", ")
                ),
            );
        }
    }

    fn check_capabilities(&self, spec: &TestSpec, reasons: &mut Reasons) {
        if spec.capabilities.is_empty() {
            return;
        }
        let Some(executable) = spec.executable.as_deref().or(self.default_executable) else {
            reasons.insert("capabilities", "NO EXECUTABLE FOR CAPABILITIES");
            return;
        };
        let available = match self.capabilities.lookup(executable) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(test = %spec.name, "capability lookup failed: {e}");
                reasons.insert("capabilities", "CAPABILITIES UNAVAILABLE");
                return;
            }
        };
        let unmet: Vec<&str> = spec
            .capabilities
            .iter()
            .filter(|requirement| match requirement.strip_prefix('!') {
                Some(name) => available.contains(&name.to_ascii_lowercase()),
                None => !available.contains(&requirement.to_ascii_lowercase()),
            })
            .map(String::as_str)
            .collect();
        if !unmet.is_empty() {
            reasons.insert("capabilities", format!("CAPABILITIES {}", unmet.join(", ")));
        }
    }
}
