//! # Suite Configuration Module / 套件配置模块
//!
//! Loads a suite file: a TOML document holding the UI language, the default
//! subject executable, overrides for the detected environment, and the list of
//! tests.
//!
//! 加载套件文件：一个 TOML 文档，包含界面语言、默认被测可执行文件、
//! 检测环境的覆盖项以及测试列表。
//!
//! ```toml
//! language = "en"
//! executable = "../build/sim-opt"
//!
//! [environment]
//! compiler = "CLANG"
//!
//! [[tests]]
//! name = "kernels.diffusion"
//! input = "diffusion.i"
//! output_files = ["diffusion_out.csv"]
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::spec::{EnvironmentOverrides, TestSpec};

/// A suite file as written on disk.
/// 磁盘上的套件文件。
#[derive(Debug, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// The language for the harness output (e.g. "en", "zh-CN").
    /// 输出消息的语言（例如 "en", "zh-CN"）。
    #[serde(default = "default_language")]
    pub language: String,

    /// Subject executable for tests that do not name their own.
    /// 未指定可执行文件的测试所使用的默认可执行文件。
    #[serde(default)]
    pub executable: Option<String>,

    #[serde(default)]
    pub environment: EnvironmentOverrides,

    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

fn default_language() -> String {
    "en".to_string()
}

impl SuiteConfig {
    /// Parses a suite from TOML text. Paths stay as written.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse suite file")
    }

    /// Makes relative test directories and executables relative to `base`.
    pub fn anchor_to(&mut self, base: &Path) {
        for spec in &mut self.tests {
            if spec.test_dir.is_relative() {
                spec.test_dir = base.join(&spec.test_dir);
            }
        }
        if let Some(exe) = &self.executable {
            let path = Path::new(exe);
            if path.is_relative() && path.components().count() > 1 {
                self.executable = Some(base.join(path).to_string_lossy().into_owned());
            }
        }
    }

    /// Rejects suites that cannot be scheduled at all.
    pub fn validate(&self) -> Result<()> {
        for (i, spec) in self.tests.iter().enumerate() {
            if spec.name.trim().is_empty() {
                bail!("test #{} has an empty name", i + 1);
            }
            if let Some(dir) = &spec.working_directory {
                if dir.is_absolute() {
                    bail!(
                        "test '{}': working_directory must be relative, got {}",
                        spec.name,
                        dir.display()
                    );
                }
            }
            if !spec.max_time.is_finite() || spec.max_time <= 0.0 {
                bail!(
                    "test '{}': max_time must be a positive number of seconds, got {}",
                    spec.name,
                    spec.max_time
                );
            }
            if !spec.min_reported_time.is_finite() || spec.min_reported_time < 0.0 {
                bail!(
                    "test '{}': min_reported_time must be a non-negative number of seconds, got {}",
                    spec.name,
                    spec.min_reported_time
                );
            }
            if spec.min_parallel > spec.max_parallel {
                bail!(
                    "test '{}': min_parallel ({}) exceeds max_parallel ({})",
                    spec.name,
                    spec.min_parallel,
                    spec.max_parallel
                );
            }
            if spec.min_threads > spec.max_threads {
                bail!(
                    "test '{}': min_threads ({}) exceeds max_threads ({})",
                    spec.name,
                    spec.min_threads,
                    spec.max_threads
                );
            }
        }
        Ok(())
    }
}

/// Reads, anchors and validates the suite file at `path`.
///
/// 读取、定位并校验 `path` 处的套件文件。
pub fn load_suite(path: &Path) -> Result<SuiteConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read suite file: {}", path.display()))?;
    let mut suite = SuiteConfig::from_toml(&text)
        .with_context(|| format!("Invalid suite file: {}", path.display()))?;
    let base: PathBuf = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    suite.anchor_to(&base);
    suite.validate()?;
    tracing::debug!(
        path = %path.display(),
        tests = suite.tests.len(),
        "loaded suite"
    );
    Ok(suite)
}
