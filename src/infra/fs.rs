//! # File System Operations Module / 文件系统操作模块
//!
//! This module provides the small file system helpers the harness needs:
//! lexical path normalization for output-collision checks, `PATH` lookups,
//! clearing stale outputs before a run and writing per-test output files.
//!
//! 此模块提供测试工具所需的文件系统辅助功能：
//! 用于输出冲突检查的路径规范化、`PATH` 查找、运行前清理旧输出以及写入每个测试的输出文件。

use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Normalizes a path without touching the file system.
///
/// `.` components are dropped and `..` pops the previous component, so
/// `a/./b/../c` and `a/c` compare equal.
///
/// 在不访问文件系统的情况下规范化路径。
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Looks up a program the way a shell would.
///
/// Names containing a path separator are checked directly; bare names are
/// searched for in every `PATH` entry.
///
/// 以 shell 的方式查找程序。
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let expanded = shellexpand::tilde(program);
    let candidate = Path::new(expanded.as_ref());
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Deletes output files left over from a previous run. Missing files are fine.
///
/// 删除上一次运行遗留的输出文件。文件不存在不视为错误。
pub async fn remove_stale_outputs(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::trace!(path = %path.display(), "removed stale output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove old output: {}", path.display()));
            }
        }
    }
    Ok(())
}

/// Turns a test name into something safe to use as a file name.
pub fn sanitized_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Writes the captured output of one test to `<dir>/<name>.<status>.txt`.
///
/// 将单个测试的输出写入 `<dir>/<name>.<status>.txt`。
pub fn write_output_file(dir: &Path, name: &str, status: &str, output: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    let path = dir.join(format!(
        "{}.{}.txt",
        sanitized_name(name),
        status.to_ascii_lowercase()
    ));
    fs::write(&path, output)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;
    Ok(path)
}
