//! # Reporting Module / 报告模块
//!
//! This module implements the result sinks the scheduler reports to: a colored,
//! localized console reporter and a writer for machine-readable results.
//!
//! 此模块实现调度器报告的结果接收器：带颜色和本地化的控制台报告器，
//! 以及机器可读结果的写入器。

pub mod console;
pub mod results_file;

pub use crate::core::scheduler::ResultSink;
pub use console::{ConsoleOptions, ConsoleReporter, format_result_line};
pub use results_file::ResultsFileWriter;
