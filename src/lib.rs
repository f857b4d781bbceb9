//! # Sim Harness Library / Sim Harness 库
//!
//! This library provides the scheduling and admission-control engine of a test
//! harness for large simulation test suites: deciding which tests may run,
//! ordering them by their prerequisites, catching tests that would write the
//! same output file at once, and running them on a bounded pool of subprocess
//! workers with timeouts and cancellation.
//!
//! 此库为大型仿真测试套件的测试工具提供调度与准入控制引擎：
//! 决定哪些测试可以运行、按前置条件排序、发现会同时写入同一输出文件的测试，
//! 并在带有超时与取消的有界子进程工作池上运行它们。
//!
//! ## Modules / 模块
//!
//! - `core` - Test specs, evaluation, dependency graph, race checks, planning and scheduling
//! - `infra` - Process supervision, file system helpers and load sampling
//! - `reporting` - Console and machine-readable result sinks
//! - `cli` - Command-line interface and commands
//!
//! - `core` - 测试规格、评估、依赖图、竞争检查、计划与调度
//! - `infra` - 进程监督、文件系统辅助与负载采样
//! - `reporting` - 控制台与机器可读的结果输出
//! - `cli` - 命令行接口和命令

pub mod cli;
pub mod core;
pub mod infra;
pub mod reporting;

// Re-export commonly used items
pub use core::config;
pub use core::scheduler;
pub use core::spec;

/// Initializes the application's internationalization (i18n) based on the system locale.
///
/// This function detects the user's system locale and sets the appropriate
/// language for the application's user interface. It attempts to match the full
/// locale (e.g., "zh-CN"), then just the language code (e.g., "en"), and
/// finally falls back to the default language ("en"). Returns the chosen locale.
pub fn init() -> String {
    let locale = sys_locale::get_locale().unwrap_or_else(|| "en".to_string());
    let available_locales = rust_i18n::available_locales!();

    // Try to match the full locale first (e.g., "zh-CN")
    // Then try to match the language part only (e.g., "en" from "en-US")
    // Finally, fall back to "en"
    let lang = if available_locales.contains(&locale.as_str()) {
        locale.as_str()
    } else {
        locale
            .split('-')
            .next()
            .filter(|lang_code| available_locales.contains(lang_code))
            .unwrap_or("en")
    };

    rust_i18n::set_locale(lang);
    lang.to_string()
}

// Initialize i18n
rust_i18n::i18n!("locales", fallback = "en");
