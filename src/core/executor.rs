//! 操作执行器
//!
//! 一次性编排：解析操作的目标 → 用已解析目标构造任务 → 提交调度器并等待结果。
//! 同一执行器实例同一时刻只处理一个操作；重入直接返回 Failure，不触碰调度器。

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::panic_message;
use super::{ExecutionResult, Priority, Task, TaskScheduler};
use crate::targeting::{EntityId, FillFailure, ResolvedTargetSet, TargetRequirement, TargetResolver};

/// 构造任务时可用的上下文
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub source: EntityId,
    pub targets: ResolvedTargetSet,
}

/// 游戏动作描述：声明需要的目标，目标解析完成后产出可调度任务
pub trait Operation<T: Task + ?Sized = dyn Task>: Send + Sync {
    fn name(&self) -> &str;

    /// 按填充顺序排列的目标槽位
    fn requirements(&self) -> Vec<TargetRequirement>;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// false 时所有槽位都按可选处理
    fn mandatory(&self) -> bool {
        true
    }

    fn build_task(&self, context: OperationContext) -> Arc<T>;
}

type BuildFn<T> = Box<dyn Fn(OperationContext) -> Arc<T> + Send + Sync>;

/// 由闭包构造任务的操作
pub struct FnOperation<T: Task + ?Sized = dyn Task> {
    name: String,
    requirements: Vec<TargetRequirement>,
    priority: Priority,
    mandatory: bool,
    build: BuildFn<T>,
}

impl<T: Task + ?Sized> FnOperation<T> {
    pub fn new<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(OperationContext) -> Arc<T> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            requirements: Vec::new(),
            priority: Priority::Normal,
            mandatory: true,
            build: Box::new(build),
        }
    }

    pub fn with_requirement(mut self, requirement: TargetRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// 目标全部可选（例如「最多选择两个目标」）
    pub fn with_optional_targets(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

impl<T: Task + ?Sized> fmt::Debug for FnOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .field("requirements", &self.requirements)
            .field("priority", &self.priority)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

impl<T: Task + ?Sized> Operation<T> for FnOperation<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Vec<TargetRequirement> {
        self.requirements.clone()
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn mandatory(&self) -> bool {
        self.mandatory
    }

    fn build_task(&self, context: OperationContext) -> Arc<T> {
        (self.build)(context)
    }
}

/// 执行中标志；离开作用域时释放
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OperationExecutor<T: Task + ?Sized + 'static = dyn Task> {
    scheduler: TaskScheduler<T>,
    resolver: Arc<TargetResolver>,
    busy: AtomicBool,
}

impl<T: Task + ?Sized + 'static> OperationExecutor<T> {
    pub fn new(scheduler: TaskScheduler<T>, resolver: Arc<TargetResolver>) -> Self {
        Self {
            scheduler,
            resolver,
            busy: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler<T> {
        &self.scheduler
    }

    pub fn resolver(&self) -> &Arc<TargetResolver> {
        &self.resolver
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// 解析目标并执行操作
    ///
    /// 目标解析失败时不会提交任何任务。外部令牌先触发时返回 Cancelled：仍在排队的任务被撤出，
    /// 已在执行的任务收到取消信号。
    pub async fn execute(
        &self,
        operation: &dyn Operation<T>,
        source: EntityId,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            warn!(operation = operation.name(), "Executor is busy, rejecting operation");
            return ExecutionResult::failure("executor is busy with another operation");
        };

        let started = Instant::now();
        let result = match AssertUnwindSafe(self.run(operation, source, cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(operation = operation.name(), "Operation panicked: {}", reason);
                ExecutionResult::Failure(format!("operation panicked: {reason}"))
            }
        };

        info!(
            operation = operation.name(),
            source = %source,
            result = %result,
            duration_ms = started.elapsed().as_millis() as u64,
            "Operation finished"
        );
        result
    }

    async fn run(
        &self,
        operation: &dyn Operation<T>,
        source: EntityId,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let requirements = operation.requirements();
        let fill = self
            .resolver
            .fill_targets(&requirements, source, operation.mandatory(), cancel)
            .await;

        let targets = match fill.into_result() {
            Ok(targets) => targets,
            Err(FillFailure::Cancelled) => return ExecutionResult::Cancelled,
            Err(failure) => {
                return ExecutionResult::Failure(format!("target fill failed: {failure}"));
            }
        };
        if cancel.is_cancelled() {
            return ExecutionResult::Cancelled;
        }

        let task = operation.build_task(OperationContext { source, targets });
        let task_id = task.id();
        debug!(operation = operation.name(), task_id = %task_id, "Submitting operation task");

        tokio::select! {
            biased;
            result = self.scheduler.execute_and_await(task, operation.priority()) => result,
            _ = cancel.cancelled() => {
                let dequeued = !self.scheduler.remove_where(|queued| queued.id() == task_id).is_empty();
                let stopped = !dequeued && self.scheduler.cancel_if_current(task_id);
                debug!(task_id = %task_id, dequeued, stopped, "Operation cancelled by caller");
                ExecutionResult::Cancelled
            }
        }
    }
}
