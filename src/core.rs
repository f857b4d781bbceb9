//! # Core Module / 核心模块
//!
//! This module contains the scheduling and admission-control engine:
//! test specs and run options, runnability evaluation, the dependency graph,
//! output-race detection, run planning, the worker-pool scheduler and result
//! interpretation.
//!
//! 此模块包含调度与准入控制引擎：测试规格与运行选项、可运行性评估、
//! 依赖图、输出竞争检测、运行计划、工作池调度器以及结果解释。

pub mod config;
pub mod evaluator;
pub mod graph;
pub mod options;
pub mod planner;
pub mod race;
pub mod results;
pub mod scheduler;
pub mod spec;
pub mod status;

// Re-exports
pub use evaluator::{RunnabilityEvaluator, Verdict};
pub use graph::{DependencyGraph, Generation};
pub use options::RunOptions;
pub use planner::{RunPlan, plan_run};
pub use scheduler::{RunSummary, Scheduler};
pub use spec::{RunEnvironment, TestSpec};
pub use status::{TestStatus, Tester};
