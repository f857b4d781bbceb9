//! # Infrastructure Module / 基础设施模块
//!
//! This module provides infrastructure services for the harness:
//! supervised process execution, file system helpers, and host load sampling.
//!
//! 此模块为测试工具提供基础设施服务：
//! 受监督的进程执行、文件系统辅助功能以及主机负载采样。

pub mod command;
pub mod fs;
pub mod load;

// Re-export i18n functions for easier access
pub use rust_i18n::t;
