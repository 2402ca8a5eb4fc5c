//! Duel - 卡牌对战客户端核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务抽象、优先级队列、串行任务调度、操作执行器
//! - **observability**: tracing 初始化
//! - **targeting**: 目标槽位、选择器、注册表与目标解析器

pub mod config;
pub mod core;
pub mod observability;
pub mod targeting;

pub use crate::core::{ExecutionResult, OperationExecutor, Priority, TaskScheduler};
pub use crate::targeting::TargetResolver;
