//! 任务抽象：Task trait、任务 ID、优先级、执行结果
//!
//! 调度器只认识 `Task`：一个带稳定 ID（单飞去重键）和描述的异步可执行单元。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::TaskError;

/// 任务 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    pub fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// 调度优先级（仅作为队列排序键，不存储在任务上）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// 任务执行结果：每次执行恰好产生一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success,
    Failure(String),
    Cancelled,
}

impl ExecutionResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 可调度的异步任务
///
/// `execute` 收到的取消令牌在 CancelCurrent / CancelAll 时触发；任务应在挂起点检查它，
/// 并以 `TaskError::Cancelled` 返回。
#[async_trait]
pub trait Task: Send + Sync {
    /// 稳定 ID，同一实例多次提交按此去重
    fn id(&self) -> TaskId;

    /// 人类可读描述（日志、诊断）
    fn description(&self) -> String;

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError>;
}

pub type BoxTaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;

type TaskFn = Box<dyn Fn(CancellationToken) -> BoxTaskFuture + Send + Sync>;

/// 由闭包构造的任务，供游戏逻辑层把「已解析目标的操作」包装成可调度单元
pub struct FnTask {
    id: TaskId,
    description: String,
    run: TaskFn,
}

impl FnTask {
    pub fn new<F, Fut>(description: impl Into<String>, run: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            description: description.into(),
            run: Box::new(move |cancel| Box::pin(run(cancel))),
        }
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl Task for FnTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    async fn execute(&self, cancel: CancellationToken) -> Result<(), TaskError> {
        (self.run)(cancel).await
    }
}
