//! # Test Specification Module / 测试规格模块
//!
//! This module defines the immutable description of a single test case (`TestSpec`)
//! and the detected platform/build facts (`RunEnvironment`) that tests are filtered
//! against. Both are plain data: nothing in here spawns processes or mutates state.
//!
//! 此模块定义单个测试用例的不可变描述（`TestSpec`）以及用于过滤测试的
//! 平台/构建检测信息（`RunEnvironment`）。两者都是纯数据。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::infra::fs::normalize_path;

/// The default error markers that make an otherwise successful run fail.
pub const DEFAULT_ERROR_MARKERS: &[&str] = &[
    "ERROR",
    "command not found",
    "terminate called after throwing an instance of",
];

/// Memory-checker modes a test may be eligible for.
/// 测试可参与的内存检查模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValgrindMode {
    /// Never run under the memory checker / 从不在内存检查器下运行
    None,
    /// Run in normal memory-check sweeps / 在普通内存检查中运行
    #[default]
    Normal,
    /// Only run in heavy memory-check sweeps / 仅在重度内存检查中运行
    Heavy,
}

impl ValgrindMode {
    /// How much longer a test may take when running under this mode.
    pub fn time_multiplier(self) -> f64 {
        match self {
            ValgrindMode::None => 1.0,
            ValgrindMode::Normal => 2.0,
            ValgrindMode::Heavy => 6.0,
        }
    }
}

impl fmt::Display for ValgrindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValgrindMode::None => write!(f, "NONE"),
            ValgrindMode::Normal => write!(f, "NORMAL"),
            ValgrindMode::Heavy => write!(f, "HEAVY"),
        }
    }
}

impl FromStr for ValgrindMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(ValgrindMode::None),
            "NORMAL" => Ok(ValgrindMode::Normal),
            "HEAVY" => Ok(ValgrindMode::Heavy),
            other => Err(format!("unknown valgrind mode '{other}'")),
        }
    }
}

/// A dotted numeric version such as `3.20.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(Vec<u64>);

impl Version {
    pub fn components(&self) -> &[u64] {
        &self.0
    }

    /// Compares only the first `len` components, padding missing ones with zero.
    fn compare_prefix(&self, other: &Version, len: usize) -> Ordering {
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty version".to_string());
        }
        trimmed
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| format!("invalid version component '{part}' in '{trimmed}'"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Version)
    }
}

impl TryFrom<String> for Version {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Comparison operators accepted in library version constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

/// A constraint such as `>= 3.11` on the numerical library version.
///
/// Only as many components as the constraint spells out take part in the
/// comparison, so `= 3.11` is satisfied by `3.11.4`.
/// 仅比较约束中写出的版本分量，因此 `= 3.11` 可被 `3.11.4` 满足。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionConstraint {
    pub op: CompareOp,
    pub version: Version,
}

impl VersionConstraint {
    pub fn is_satisfied_by(&self, detected: &Version) -> bool {
        let ord = detected.compare_prefix(&self.version, self.version.components().len());
        match self.op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Longest operators first so `>=` is not read as `>`.
        let (op, rest) = [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("==", CompareOp::Eq),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
            ("=", CompareOp::Eq),
        ]
        .iter()
        .find_map(|(prefix, op)| s.strip_prefix(prefix).map(|rest| (*op, rest)))
        .unwrap_or((CompareOp::Eq, s));

        Ok(VersionConstraint {
            op,
            version: rest.parse()?,
        })
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.symbol(), self.version)
    }
}

/// An output file compared against a checked-in gold copy after the run.
/// 运行后与已提交的参考文件进行比较的输出文件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldFile {
    /// Output written by the test, relative to the test directory.
    pub output: PathBuf,
    /// Reference copy, relative to the test directory.
    pub gold: PathBuf,
    /// Relative tolerance for numeric fields.
    #[serde(default = "default_rel_tol")]
    pub rel_tol: f64,
    /// Values whose magnitude is below this are treated as zero.
    #[serde(default = "default_abs_zero")]
    pub abs_zero: f64,
}

fn default_rel_tol() -> f64 {
    5.5e-6
}

fn default_abs_zero() -> f64 {
    1e-10
}

/// Represents a single test as produced by discovery. Immutable once created.
///
/// Every field has a serde default so a suite file only needs to spell out what
/// differs from the defaults.
///
/// 表示发现阶段产生的单个测试。创建后不可变。
/// 每个字段都有 serde 默认值，因此套件文件只需写出与默认值不同的部分。
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TestSpec {
    /// Unique name of the test within the suite / 测试在套件中的唯一名称
    pub name: String,
    /// Directory the test lives in and runs from / 测试所在并运行的目录
    pub test_dir: PathBuf,
    /// Optional relative subdirectory to run in / 可选的相对运行子目录
    pub working_directory: Option<PathBuf>,
    /// Names of tests that must finish first / 必须先完成的测试名称
    pub prereqs: Vec<String>,
    /// Files the test writes, relative to the test directory / 测试写入的文件
    pub output_files: Vec<PathBuf>,
    /// Groups the test belongs to / 测试所属的分组
    pub group: Vec<String>,

    pub platform: Vec<String>,
    pub compiler: Vec<String>,
    pub mesh_mode: Vec<String>,
    pub method: Vec<String>,
    pub library_mode: Vec<String>,
    pub library_version: Vec<VersionConstraint>,
    /// Feature flags the environment must provide (e.g. `gpu`, `threads`).
    pub features: Vec<String>,
    pub display_required: bool,
    pub required_submodule: Vec<String>,
    pub depend_files: Vec<PathBuf>,
    pub capabilities: Vec<String>,
    pub env_vars: Vec<String>,
    pub env_vars_not_set: Vec<String>,
    /// Programs that must be available on `PATH`.
    pub requires: Vec<String>,

    pub min_parallel: u32,
    pub max_parallel: u32,
    pub min_threads: u32,
    pub max_threads: u32,

    /// Maximum wall time in seconds / 最大墙钟时间（秒）
    pub max_time: f64,
    /// Seconds after which a still-running test is reported / 仍在运行的测试被报告的秒数
    pub min_reported_time: f64,

    pub heavy: bool,
    pub deleted: Option<String>,
    pub skip: Option<String>,
    pub should_execute: bool,
    pub check_input: bool,
    pub scale_refine: u32,
    pub valgrind: ValgrindMode,

    /// Subject executable; falls back to the suite default.
    pub executable: Option<String>,
    /// Literal command line, used instead of the executable when present.
    pub command: Option<String>,
    pub input: Option<String>,
    pub input_switch: String,
    pub cli_args: Vec<String>,

    pub expect_exit_code: i32,
    pub errors: Vec<String>,
    pub expect_out: Option<String>,
    pub absent_out: Option<String>,
    pub match_literal: bool,
    pub delete_output_before_running: bool,
    pub gold: Vec<GoldFile>,
}

impl Default for TestSpec {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            test_dir: PathBuf::from("."),
            working_directory: None,
            prereqs: vec![],
            output_files: vec![],
            group: vec![],
            platform: vec!["ALL".to_string()],
            compiler: vec!["ALL".to_string()],
            mesh_mode: vec!["ALL".to_string()],
            method: vec!["ALL".to_string()],
            library_mode: vec!["ALL".to_string()],
            library_version: vec![],
            features: vec![],
            display_required: false,
            required_submodule: vec![],
            depend_files: vec![],
            capabilities: vec![],
            env_vars: vec![],
            env_vars_not_set: vec![],
            requires: vec![],
            min_parallel: 1,
            max_parallel: 1000,
            min_threads: 1,
            max_threads: 16,
            max_time: 300.0,
            min_reported_time: 10.0,
            heavy: false,
            deleted: None,
            skip: None,
            should_execute: true,
            check_input: false,
            scale_refine: 0,
            valgrind: ValgrindMode::Normal,
            executable: None,
            command: None,
            input: None,
            input_switch: "-i".to_string(),
            cli_args: vec![],
            expect_exit_code: 0,
            errors: DEFAULT_ERROR_MARKERS.iter().map(|s| s.to_string()).collect(),
            expect_out: None,
            absent_out: None,
            match_literal: false,
            delete_output_before_running: true,
            gold: vec![],
        }
    }
}

impl TestSpec {
    /// Creates a spec with default settings and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The directory the test process runs in.
    pub fn run_dir(&self) -> PathBuf {
        match &self.working_directory {
            Some(sub) => self.test_dir.join(sub),
            None => self.test_dir.clone(),
        }
    }

    /// Declared output files as normalized paths, used for collision detection.
    pub fn output_paths(&self) -> BTreeSet<PathBuf> {
        self.output_files
            .iter()
            .map(|file| normalize_path(&self.run_dir().join(file)))
            .collect()
    }

    pub fn max_time(&self) -> Duration {
        saturating_secs(self.max_time)
    }

    pub fn min_reported_time(&self) -> Duration {
        saturating_secs(self.min_reported_time)
    }

    /// Resolves a path declared relative to the test directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.run_dir().join(path)
        }
    }
}

/// Overrides for the detected environment, as written in a suite file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EnvironmentOverrides {
    pub platform: Option<String>,
    pub compiler: Option<String>,
    pub library_version: Option<Version>,
    pub mesh_mode: Option<String>,
    pub library_mode: Option<String>,
    pub method: Option<String>,
    pub features: Option<Vec<String>>,
    pub submodules: Option<Vec<String>>,
    pub has_display: Option<bool>,
}

/// Filter axes that are matched by set intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Platform,
    Compiler,
    MeshMode,
    Method,
    LibraryMode,
}

impl Axis {
    pub const ALL: [Axis; 5] = [
        Axis::Platform,
        Axis::Compiler,
        Axis::MeshMode,
        Axis::Method,
        Axis::LibraryMode,
    ];

    /// Key used for caveats and the ignore list.
    pub fn key(self) -> &'static str {
        match self {
            Axis::Platform => "platform",
            Axis::Compiler => "compiler",
            Axis::MeshMode => "mesh_mode",
            Axis::Method => "method",
            Axis::LibraryMode => "library_mode",
        }
    }

    pub fn declared(self, spec: &TestSpec) -> &[String] {
        match self {
            Axis::Platform => &spec.platform,
            Axis::Compiler => &spec.compiler,
            Axis::MeshMode => &spec.mesh_mode,
            Axis::Method => &spec.method,
            Axis::LibraryMode => &spec.library_mode,
        }
    }
}

/// The build and platform facts detected once per harness invocation.
/// 每次调用检测一次的构建与平台信息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub platform: String,
    pub compiler: String,
    pub library_version: Option<Version>,
    pub mesh_mode: String,
    pub library_mode: String,
    pub method: String,
    pub features: BTreeSet<String>,
    pub submodules: BTreeSet<String>,
    pub has_display: bool,
}

impl Default for RunEnvironment {
    fn default() -> Self {
        Self {
            platform: platform_name(std::env::consts::OS),
            compiler: "GCC".to_string(),
            library_version: None,
            mesh_mode: "REPLICATED".to_string(),
            library_mode: "DYNAMIC".to_string(),
            method: "OPT".to_string(),
            features: BTreeSet::new(),
            submodules: BTreeSet::new(),
            has_display: false,
        }
    }
}

fn platform_name(os: &str) -> String {
    match os {
        "linux" => "LINUX".to_string(),
        "macos" => "DARWIN".to_string(),
        "windows" => "WINDOWS".to_string(),
        other => other.to_ascii_uppercase(),
    }
}

fn split_list(value: &str) -> BTreeSet<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl RunEnvironment {
    /// Detects the environment from the host and `SIM_HARNESS_*` variables.
    pub fn detect() -> Self {
        let mut env = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(v) = var("SIM_HARNESS_COMPILER") {
            env.compiler = v.to_ascii_uppercase();
        }
        if let Some(v) = var("SIM_HARNESS_LIBRARY_VERSION") {
            match v.parse() {
                Ok(version) => env.library_version = Some(version),
                Err(e) => tracing::warn!("ignoring SIM_HARNESS_LIBRARY_VERSION: {e}"),
            }
        }
        if let Some(v) = var("SIM_HARNESS_MESH_MODE") {
            env.mesh_mode = v.to_ascii_uppercase();
        }
        if let Some(v) = var("SIM_HARNESS_LIBRARY_MODE") {
            env.library_mode = v.to_ascii_uppercase();
        }
        if let Some(v) = var("METHOD") {
            env.method = v.to_ascii_uppercase();
        }
        if let Some(v) = var("SIM_HARNESS_FEATURES") {
            env.features = split_list(&v);
        }
        if let Some(v) = var("SIM_HARNESS_SUBMODULES") {
            env.submodules = split_list(&v);
        }
        env.has_display = var("DISPLAY").is_some();
        env
    }

    /// Applies suite-file overrides on top of the detected values.
    pub fn with_overrides(mut self, overrides: &EnvironmentOverrides) -> Self {
        if let Some(v) = &overrides.platform {
            self.platform = v.to_ascii_uppercase();
        }
        if let Some(v) = &overrides.compiler {
            self.compiler = v.to_ascii_uppercase();
        }
        if let Some(v) = &overrides.library_version {
            self.library_version = Some(v.clone());
        }
        if let Some(v) = &overrides.mesh_mode {
            self.mesh_mode = v.to_ascii_uppercase();
        }
        if let Some(v) = &overrides.library_mode {
            self.library_mode = v.to_ascii_uppercase();
        }
        if let Some(v) = &overrides.method {
            self.method = v.to_ascii_uppercase();
        }
        if let Some(v) = &overrides.features {
            self.features = v.iter().cloned().collect();
        }
        if let Some(v) = &overrides.submodules {
            self.submodules = v.iter().cloned().collect();
        }
        if let Some(v) = overrides.has_display {
            self.has_display = v;
        }
        self
    }

    /// The values an axis filter is intersected with; always contains `ALL`.
    pub fn axis_values(&self, axis: Axis) -> BTreeSet<String> {
        let value = match axis {
            Axis::Platform => &self.platform,
            Axis::Compiler => &self.compiler,
            Axis::MeshMode => &self.mesh_mode,
            Axis::Method => &self.method,
            Axis::LibraryMode => &self.library_mode,
        };
        ["ALL".to_string(), value.to_ascii_uppercase()]
            .into_iter()
            .collect()
    }
}

/// Converts seconds to a `Duration`, clamping negative or NaN values to zero and
/// values too large to represent to `Duration::MAX`.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
