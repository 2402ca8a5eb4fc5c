//! 任务调度：优先级队列 + 单循环串行执行 + 单飞去重 + 协作式取消
//!
//! 同一时刻最多只有一个处理循环在排空队列，任务严格逐个执行；已开始的任务不会被后来的
//! 高优先级任务抢占。同一任务实例（按 `TaskId`）在完成前重复提交只执行一次，所有等待者
//! 收到同一个结果。
//!
//! CancelAll 会等待当前任务真正停止（有超时上限）。超时后调度器强制标记空闲并放弃该任务：
//! 被放弃的任务可能仍在后台运行并稍后返回，其迟到结果会被丢弃（不回填等待者、不记历史、
//! 不发布 TaskCompleted），只发布 TaskAbandoned。
//!
//! 等待者、历史与 TaskCompleted 对同一次执行给出同一结果：被 CancelAll 提前回填为 Cancelled
//! 的任务即使随后正常返回，也按 Cancelled 记录。

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::panic_message;
use super::{ExecutionResult, Priority, PriorityQueue, Task, TaskError, TaskId};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// CancelAll 等待当前任务停止的上限
    pub cancel_all_timeout: Duration,
    /// 保留的最近完成记录条数（0 表示不保留）
    pub history_limit: usize,
    /// 事件广播缓冲
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cancel_all_timeout: Duration::from_secs(2),
            history_limit: 32,
            event_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_all_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_all_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// 调度器事件（同步 fire-and-forget；无订阅者时直接丢弃）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        description: String,
    },
    TaskCompleted {
        task_id: TaskId,
        description: String,
        result: ExecutionResult,
    },
    /// 被 CancelAll 超时放弃的任务最终返回
    TaskAbandoned {
        task_id: TaskId,
        description: String,
        late_result: ExecutionResult,
    },
    QueueEmpty,
}

/// 一条完成记录（供撤销等上层逻辑回看）
pub struct CompletedTask<T: ?Sized> {
    pub task: Arc<T>,
    pub result: ExecutionResult,
    pub finished_at: DateTime<Utc>,
}

impl<T: ?Sized> Clone for CompletedTask<T> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            result: self.result.clone(),
            finished_at: self.finished_at,
        }
    }
}

impl<T: Task + ?Sized> fmt::Debug for CompletedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedTask")
            .field("task_id", &self.task.id())
            .field("result", &self.result)
            .field("finished_at", &self.finished_at)
            .finish()
    }
}

/// CancelAll 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAllReport {
    /// 被清出队列的任务数
    pub cancelled_queued: usize,
    /// 被取消的当前任务
    pub cancelled_current: Option<TaskId>,
    /// 当前任务未在超时内停止而被放弃
    pub abandoned: bool,
}

struct ActiveTask<T: ?Sized> {
    task: Arc<T>,
    scope: CancellationToken,
    /// 本次执行的序号；同一任务再次执行会得到新序号
    run: u64,
    /// 等待者已被 CancelAll 以 Cancelled 回填
    resolved: bool,
}

type Waiters = Vec<oneshot::Sender<ExecutionResult>>;

struct Shared<T: ?Sized> {
    queue: PriorityQueue<Arc<T>>,
    /// 单飞表：排队中或执行中的任务 -> 等待者
    pending: Mutex<HashMap<TaskId, Waiters>>,
    /// 处理循环独占启动标志
    processing: AtomicBool,
    /// 每次强制放弃递增；旧循环据此识别自己已被放弃
    generation: AtomicU64,
    next_run: AtomicU64,
    active: Mutex<Option<ActiveTask<T>>>,
    /// 全局作用域，每个任务的作用域都是它的子令牌
    global_scope: Mutex<CancellationToken>,
    /// 正在执行的序号，供 CancelAll 等待被取消的那一次执行结束
    active_run: watch::Sender<Option<u64>>,
    history: Mutex<VecDeque<CompletedTask<T>>>,
    events: broadcast::Sender<SchedulerEvent>,
    config: SchedulerConfig,
}

/// 串行任务调度器
///
/// 克隆得到的是同一调度器的句柄。提交任务需要在 tokio 运行时内调用。
pub struct TaskScheduler<T: Task + ?Sized + 'static = dyn Task> {
    inner: Arc<Shared<T>>,
}

impl<T: Task + ?Sized + 'static> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Task + ?Sized + 'static> TaskScheduler<T> {
    pub fn new(config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (active_run, _) = watch::channel(None);
        Self {
            inner: Arc::new(Shared {
                queue: PriorityQueue::new(),
                pending: Mutex::new(HashMap::new()),
                processing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                next_run: AtomicU64::new(0),
                active: Mutex::new(None),
                global_scope: Mutex::new(CancellationToken::new()),
                active_run,
                history: Mutex::new(VecDeque::new()),
                events,
                config,
            }),
        }
    }

    /// 入队并在没有处理循环时启动一个；同一任务已在途时不重复入队，返回 false
    pub fn submit(&self, task: Arc<T>, priority: Priority) -> bool {
        let accepted = self.inner.track(task, priority, None);
        self.inner.ensure_processing();
        accepted
    }

    /// 提交并等待结果；同一任务已在途时加入等待而不重新入队
    pub async fn execute_and_await(&self, task: Arc<T>, priority: Priority) -> ExecutionResult {
        let (tx, rx) = oneshot::channel();
        let task_id = task.id();
        if !self.inner.track(task, priority, Some(tx)) {
            debug!(task_id = %task_id, "Joining in-flight task");
        }
        self.inner.ensure_processing();

        // 发送端在未回填的情况下被丢弃只可能发生在调度器被销毁时
        rx.await.unwrap_or(ExecutionResult::Cancelled)
    }

    /// 取消正在执行的任务（若有）；排队中的任务不受影响。下一个任务会拿到新的作用域。
    pub fn cancel_current(&self) -> Option<TaskId> {
        let active = self.inner.active.lock();
        let active = active.as_ref()?;
        let task_id = active.task.id();
        info!(task_id = %task_id, "Cancelling current task");
        active.scope.cancel();
        Some(task_id)
    }

    /// 仅当指定任务正在执行时取消它
    pub fn cancel_if_current(&self, task_id: TaskId) -> bool {
        let active = self.inner.active.lock();
        match active.as_ref() {
            Some(active) if active.task.id() == task_id => {
                info!(task_id = %task_id, "Cancelling current task on request");
                active.scope.cancel();
                true
            }
            _ => false,
        }
    }

    /// 取消当前任务并清空队列，所有在途等待者以 Cancelled 回填
    ///
    /// 等待当前任务停止，最长 `cancel_all_timeout`；超时则放弃该任务、强制标记空闲并继续接收新任务。
    pub async fn cancel_all(&self) -> CancelAllReport {
        let shared = &self.inner;

        let previous = std::mem::replace(&mut *shared.global_scope.lock(), CancellationToken::new());
        previous.cancel();

        let drained = shared.queue.drain();
        for task in &drained {
            shared.resolve(task.id(), ExecutionResult::Cancelled);
        }

        let current = {
            let mut active = shared.active.lock();
            active.as_mut().map(|active| {
                active.resolved = true;
                shared.resolve(active.task.id(), ExecutionResult::Cancelled);
                (active.task.id(), active.run)
            })
        };

        info!(
            queued = drained.len(),
            current = ?current.map(|(task_id, _)| task_id),
            "Cancelling all tasks"
        );

        let abandoned = match current {
            None => false,
            Some((task_id, run)) => {
                let mut active_run = shared.active_run.subscribe();
                let stopped = tokio::time::timeout(shared.config.cancel_all_timeout, async {
                    active_run
                        .wait_for(|active| *active != Some(run))
                        .await
                        .map(|_| ())
                })
                .await;
                match stopped {
                    Ok(_) => false,
                    Err(_) => {
                        let abandoned = shared.abandon(run);
                        if abandoned {
                            warn!(
                                task_id = %task_id,
                                timeout_ms = shared.config.cancel_all_timeout.as_millis() as u64,
                                "Current task did not stop in time, abandoning it"
                            );
                        }
                        abandoned
                    }
                }
            }
        };

        CancelAllReport {
            cancelled_queued: drained.len(),
            cancelled_current: current.map(|(task_id, _)| task_id),
            abandoned,
        }
    }

    /// 移除满足谓词的排队任务（不含正在执行的），其等待者以 Cancelled 回填
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<Arc<T>> {
        let removed = self.inner.queue.remove_where(|task| predicate(task.as_ref()));
        for task in &removed {
            debug!(task_id = %task.id(), "Removed queued task");
            self.inner.resolve(task.id(), ExecutionResult::Cancelled);
        }
        removed
    }

    pub fn is_idle(&self) -> bool {
        self.inner.active.lock().is_none() && self.inner.queue.is_empty()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn current_task(&self) -> Option<Arc<T>> {
        self.inner.active.lock().as_ref().map(|a| Arc::clone(&a.task))
    }

    /// 任务是否在途（排队或执行中且尚未回填）
    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.inner.pending.lock().contains_key(&task_id)
    }

    /// 排队任务描述，按将被执行的顺序
    pub fn queued_descriptions(&self) -> Vec<String> {
        self.inner
            .queue
            .snapshot()
            .into_iter()
            .map(|(priority, task)| format!("[{priority:?}] {}", task.description()))
            .collect()
    }

    /// 最近完成的任务，旧的在前
    pub fn recent_history(&self) -> Vec<CompletedTask<T>> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// 订阅调度事件；丢弃接收端即取消订阅
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }
}

impl<T: Task + ?Sized + 'static> Default for TaskScheduler<T> {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl<T: Task + ?Sized + 'static> Shared<T> {
    /// 登记到单飞表并入队；已在途则只追加等待者
    fn track(
        &self,
        task: Arc<T>,
        priority: Priority,
        waiter: Option<oneshot::Sender<ExecutionResult>>,
    ) -> bool {
        let task_id = task.id();
        let mut pending = self.pending.lock();
        match pending.entry(task_id) {
            Entry::Occupied(mut entry) => {
                if let Some(waiter) = waiter {
                    entry.get_mut().push(waiter);
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(waiter.into_iter().collect());
                debug!(task_id = %task_id, priority = ?priority, "Task queued");
                self.queue.enqueue(priority, task);
                true
            }
        }
    }

    fn ensure_processing(self: &Arc<Self>) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(self);
            let generation = shared.generation.load(Ordering::Acquire);
            tokio::spawn(async move { shared.drain(generation).await });
        }
    }

    async fn drain(self: Arc<Self>, generation: u64) {
        debug!(generation, "Processing loop started");
        loop {
            if self.generation.load(Ordering::Acquire) != generation {
                return;
            }

            let Some(task) = self.queue.try_dequeue() else {
                self.processing.store(false, Ordering::Release);
                if self.settle() {
                    continue;
                }
                return;
            };

            if !self.run_one(task, generation).await {
                return;
            }
        }
    }

    /// 执行一个任务；返回 false 表示本循环已被放弃
    async fn run_one(&self, task: Arc<T>, generation: u64) -> bool {
        let task_id = task.id();
        let description = task.description();
        let scope = self.global_scope.lock().child_token();
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);

        {
            let mut active = self.active.lock();
            *active = Some(ActiveTask {
                task: Arc::clone(&task),
                scope: scope.clone(),
                run,
                resolved: false,
            });
            self.active_run.send_replace(Some(run));
        }

        info!(task_id = %task_id, "Executing task: {}", description);
        let _ = self.events.send(SchedulerEvent::TaskStarted {
            task_id,
            description: description.clone(),
        });

        let outcome = AssertUnwindSafe(task.execute(scope.clone()))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(())) => ExecutionResult::Success,
            Ok(Err(TaskError::Cancelled)) => {
                debug!(task_id = %task_id, "Task observed cancellation");
                ExecutionResult::Cancelled
            }
            Ok(Err(err)) if scope.is_cancelled() => {
                debug!(task_id = %task_id, "Task stopped after cancellation: {}", err);
                ExecutionResult::Cancelled
            }
            Ok(Err(err)) => {
                warn!(task_id = %task_id, "Task failed: {}", err);
                ExecutionResult::Failure(err.reason())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(task_id = %task_id, "Task panicked: {}", reason);
                ExecutionResult::Failure(format!("task panicked: {reason}"))
            }
        };

        // 放弃与收尾都在 active 锁内判定，二者只会发生其一
        let finished = {
            let mut active = self.active.lock();
            if self.generation.load(Ordering::Acquire) != generation {
                None
            } else {
                let resolved = active.take().is_some_and(|active| active.resolved);
                self.active_run.send_replace(None);
                Some(resolved)
            }
        };

        let Some(already_resolved) = finished else {
            warn!(
                task_id = %task_id,
                result = %result,
                "Abandoned task finished late, discarding its result"
            );
            let _ = self.events.send(SchedulerEvent::TaskAbandoned {
                task_id,
                description,
                late_result: result,
            });
            return false;
        };

        let result = if already_resolved {
            if result != ExecutionResult::Cancelled {
                debug!(
                    task_id = %task_id,
                    result = %result,
                    "Task finished after CancelAll, reporting it as cancelled"
                );
            }
            ExecutionResult::Cancelled
        } else {
            self.resolve(task_id, result.clone());
            result
        };
        self.record(task, result.clone());
        debug!(task_id = %task_id, result = %result, "Task completed");
        let _ = self.events.send(SchedulerEvent::TaskCompleted {
            task_id,
            description,
            result,
        });
        true
    }

    /// 回填等待者；条目被移除，保证每个任务只回填一次
    fn resolve(&self, task_id: TaskId, result: ExecutionResult) {
        let waiters = self.pending.lock().remove(&task_id);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn record(&self, task: Arc<T>, result: ExecutionResult) {
        let limit = self.config.history_limit;
        if limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= limit {
            history.pop_front();
        }
        history.push_back(CompletedTask {
            task,
            result,
            finished_at: Utc::now(),
        });
    }

    /// 处理循环释放标志后调用；返回 true 表示本循环重新取得标志继续排空
    ///
    /// 队列确实为空时才发布 QueueEmpty；释放与检查之间有新任务入队且已被新循环接手时静默退出。
    fn settle(&self) -> bool {
        if self.queue.is_empty() {
            debug!("Queue drained, processing loop stopped");
            let _ = self.events.send(SchedulerEvent::QueueEmpty);
            return false;
        }
        let reclaimed = self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !reclaimed {
            debug!("Queue handed off to another processing loop");
        }
        reclaimed
    }

    /// CancelAll 超时路径：仅当序号为 `run` 的执行仍未结束时放弃当前循环并标记空闲
    fn abandon(self: &Arc<Self>, run: u64) -> bool {
        {
            let mut active = self.active.lock();
            if active.as_ref().map(|active| active.run) != Some(run) {
                return false;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            *active = None;
            self.active_run.send_replace(None);
        }
        self.processing.store(false, Ordering::Release);
        // 放弃期间入队的任务需要新循环
        if !self.queue.is_empty() {
            self.ensure_processing();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FnTask;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn explode() -> Result<(), TaskError> {
        panic!("boom")
    }

    async fn wait_for_depth(scheduler: &TaskScheduler, depth: usize) {
        while scheduler.queue_depth() < depth {
            tokio::task::yield_now().await;
        }
    }

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn logging_task(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Task> {
        let log = Arc::clone(log);
        Arc::new(FnTask::new(name, move |_cancel| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(name);
                Ok(())
            }
        }))
    }

    /// 阻塞直到 gate 被通知或被取消
    fn gated_task(gate: Arc<Notify>, started: Arc<Notify>) -> Arc<dyn Task> {
        Arc::new(FnTask::new("gated", move |cancel| {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            async move {
                started.notify_one();
                tokio::select! {
                    _ = gate.notified() => Ok(()),
                    _ = cancel.cancelled() => Err(TaskError::Cancelled),
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let log = recorder();

        let a = logging_task("A", &log);
        let b = logging_task("B", &log);
        let c = logging_task("C", &log);

        scheduler.submit(a, Priority::Normal);
        scheduler.submit(b, Priority::High);
        let last = scheduler.execute_and_await(c, Priority::Normal).await;

        assert!(last.is_success());
        assert_eq!(*log.lock(), vec!["B", "A", "C"]);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_single_flight_executes_once() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let runs = Arc::new(AtomicUsize::new(0));
        let task: Arc<dyn Task> = {
            let runs = Arc::clone(&runs);
            Arc::new(FnTask::new("play card", move |_cancel| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::failed("target left the battlefield"))
                }
            }))
        };

        let (first, second) = tokio::join!(
            scheduler.execute_and_await(Arc::clone(&task), Priority::Normal),
            scheduler.execute_and_await(Arc::clone(&task), Priority::High),
        );

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first, ExecutionResult::failure("target left the battlefield"));
        assert!(!scheduler.is_pending(task.id()));
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_rejected_while_pending() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let log = recorder();
        let task = logging_task("A", &log);

        assert!(scheduler.submit(Arc::clone(&task), Priority::Normal));
        assert!(!scheduler.submit(Arc::clone(&task), Priority::Normal));
        assert_eq!(scheduler.queue_depth(), 1);

        let result = scheduler.execute_and_await(task, Priority::Normal).await;
        assert!(result.is_success());
        assert_eq!(*log.lock(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_stop_the_loop() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let log = recorder();

        let failing: Arc<dyn Task> = Arc::new(FnTask::new("fails", |_cancel| async {
            Err(TaskError::Other(anyhow::anyhow!("deck is empty")))
        }));
        let panicking: Arc<dyn Task> = Arc::new(FnTask::new("panics", |_cancel| async { explode() }));
        let healthy = logging_task("healthy", &log);

        let (failed, panicked, ok) = tokio::join!(
            scheduler.execute_and_await(failing, Priority::Normal),
            scheduler.execute_and_await(panicking, Priority::Normal),
            scheduler.execute_and_await(healthy, Priority::Normal),
        );

        assert_eq!(failed, ExecutionResult::failure("deck is empty"));
        assert!(matches!(panicked, ExecutionResult::Failure(ref msg) if msg.contains("boom")));
        assert!(ok.is_success());
        assert_eq!(*log.lock(), vec!["healthy"]);
    }

    #[tokio::test]
    async fn test_cancel_current_keeps_queued_tasks() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let log = recorder();

        let blocker = gated_task(Arc::clone(&gate), Arc::clone(&started));
        let follower = logging_task("follower", &log);

        let blocked = tokio::spawn({
            let scheduler = scheduler.clone();
            let blocker = Arc::clone(&blocker);
            async move { scheduler.execute_and_await(blocker, Priority::Normal).await }
        });
        started.notified().await;
        let follower_wait = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute_and_await(follower, Priority::Normal).await }
        });
        wait_for_depth(&scheduler, 1).await;

        assert_eq!(scheduler.cancel_current(), Some(blocker.id()));
        assert_eq!(blocked.await.unwrap(), ExecutionResult::Cancelled);
        assert!(follower_wait.await.unwrap().is_success());
        assert_eq!(*log.lock(), vec!["follower"]);
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_everything_cancelled() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let log = recorder();

        let blocker = gated_task(Arc::clone(&gate), Arc::clone(&started));
        let current = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute_and_await(blocker, Priority::Normal).await }
        });
        started.notified().await;

        let queued: Vec<_> = ["q1", "q2", "q3"]
            .into_iter()
            .map(|name| {
                let scheduler = scheduler.clone();
                let task = logging_task(name, &log);
                tokio::spawn(async move { scheduler.execute_and_await(task, Priority::Normal).await })
            })
            .collect();
        wait_for_depth(&scheduler, 3).await;

        let report = scheduler.cancel_all().await;
        assert_eq!(report.cancelled_queued, 3);
        assert!(report.cancelled_current.is_some());
        assert!(!report.abandoned);

        assert_eq!(current.await.unwrap(), ExecutionResult::Cancelled);
        for handle in queued {
            assert_eq!(handle.await.unwrap(), ExecutionResult::Cancelled);
        }
        assert_eq!(scheduler.queue_depth(), 0);
        assert!(log.lock().is_empty());

        // 取消后提交的任务使用新的作用域，不受影响
        let fresh = logging_task("fresh", &log);
        assert!(scheduler.execute_and_await(fresh, Priority::Normal).await.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_abandons_stubborn_task_after_timeout() {
        let scheduler: TaskScheduler =
            TaskScheduler::new(SchedulerConfig::new().with_cancel_all_timeout(Duration::from_millis(50)));
        let mut events = scheduler.subscribe();
        let release = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());

        // 无视取消令牌的任务
        let stubborn: Arc<dyn Task> = {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            Arc::new(FnTask::new("stubborn", move |_cancel| {
                let release = Arc::clone(&release);
                let started = Arc::clone(&started);
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }))
        };
        let stubborn_id = stubborn.id();

        let waiter = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute_and_await(stubborn, Priority::Normal).await }
        });
        started.notified().await;

        let report = scheduler.cancel_all().await;
        assert!(report.abandoned);
        assert_eq!(report.cancelled_current, Some(stubborn_id));
        assert_eq!(waiter.await.unwrap(), ExecutionResult::Cancelled);
        assert!(scheduler.is_idle());

        // 放弃后调度器继续接收新任务
        let log = recorder();
        let next = logging_task("next", &log);
        assert!(scheduler.execute_and_await(next, Priority::Normal).await.is_success());

        // 迟到的结果被丢弃
        release.notify_one();
        let mut abandoned = None;
        while let Ok(event) = events.recv().await {
            if let SchedulerEvent::TaskAbandoned { task_id, late_result, .. } = event {
                abandoned = Some((task_id, late_result));
                break;
            }
        }
        assert_eq!(abandoned, Some((stubborn_id, ExecutionResult::Success)));
        assert!(scheduler
            .recent_history()
            .iter()
            .all(|record| record.task.id() != stubborn_id));
    }

    /// 无视取消令牌、睡眠固定时长后成功的任务
    fn sleepy_task(name: &'static str, nap: Duration, runs: &Arc<AtomicUsize>) -> Arc<dyn Task> {
        let runs = Arc::clone(runs);
        Arc::new(FnTask::new(name, move |_cancel| {
            let runs = Arc::clone(&runs);
            async move {
                tokio::time::sleep(nap).await;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_waits_for_the_cancelled_run_only() {
        let scheduler: TaskScheduler =
            TaskScheduler::new(SchedulerConfig::new().with_cancel_all_timeout(Duration::from_millis(50)));
        let slow_runs = Arc::new(AtomicUsize::new(0));
        let next_runs = Arc::new(AtomicUsize::new(0));

        let slow = sleepy_task("slow", Duration::from_millis(49), &slow_runs);
        let slow_wait = tokio::spawn({
            let scheduler = scheduler.clone();
            let slow = Arc::clone(&slow);
            async move { scheduler.execute_and_await(slow, Priority::Normal).await }
        });
        while scheduler.current_task().is_none() {
            tokio::task::yield_now().await;
        }

        let sweep = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.cancel_all().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 清扫之后提交，慢任务结束后立即接着执行
        let next = sleepy_task("next", Duration::from_millis(20), &next_runs);
        let next_wait = tokio::spawn({
            let scheduler = scheduler.clone();
            let next = Arc::clone(&next);
            async move { scheduler.execute_and_await(next, Priority::Normal).await }
        });

        let report = sweep.await.unwrap();
        assert_eq!(report.cancelled_current, Some(slow.id()));
        assert!(!report.abandoned);
        assert_eq!(slow_wait.await.unwrap(), ExecutionResult::Cancelled);

        let next_result = tokio::time::timeout(Duration::from_secs(5), next_wait)
            .await
            .expect("follow-up task must be resolved")
            .unwrap();
        assert_eq!(next_result, ExecutionResult::Success);
        assert!(!scheduler.is_pending(next.id()));

        // 单飞表没有残留，再次提交会真正执行
        assert!(scheduler
            .execute_and_await(Arc::clone(&next), Priority::Normal)
            .await
            .is_success());
        assert_eq!(next_runs.load(Ordering::SeqCst), 2);
        assert_eq!(slow_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_result_agrees_for_caller_history_and_event() {
        let scheduler: TaskScheduler =
            TaskScheduler::new(SchedulerConfig::new().with_cancel_all_timeout(Duration::from_millis(50)));
        let mut events = scheduler.subscribe();
        let runs = Arc::new(AtomicUsize::new(0));

        // 不检查令牌，在超时内正常返回
        let oblivious = sleepy_task("oblivious", Duration::from_millis(10), &runs);
        let caller = tokio::spawn({
            let scheduler = scheduler.clone();
            let oblivious = Arc::clone(&oblivious);
            async move { scheduler.execute_and_await(oblivious, Priority::Normal).await }
        });
        while scheduler.current_task().is_none() {
            tokio::task::yield_now().await;
        }

        let report = scheduler.cancel_all().await;
        assert!(!report.abandoned);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let caller_saw = caller.await.unwrap();
        assert_eq!(caller_saw, ExecutionResult::Cancelled);

        let mut observed = None;
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::TaskCompleted { task_id, result, .. } = event {
                assert_eq!(task_id, oblivious.id());
                observed = Some(result);
            }
        }
        assert_eq!(observed, Some(caller_saw.clone()));

        let history: Vec<_> = scheduler
            .recent_history()
            .into_iter()
            .map(|record| record.result)
            .collect();
        assert_eq!(history, vec![caller_saw]);
    }

    #[tokio::test]
    async fn test_settle_reports_queue_empty_only_when_empty() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let mut events = scheduler.subscribe();
        let shared = &scheduler.inner;

        assert!(!shared.settle());
        assert_eq!(events.try_recv().unwrap(), SchedulerEvent::QueueEmpty);

        // 有排队任务且另一个循环已持有标志：静默退出
        let log = recorder();
        shared.queue.enqueue(Priority::Normal, logging_task("late", &log));
        shared.processing.store(true, Ordering::Release);
        assert!(!shared.settle());
        assert!(events.try_recv().is_err());

        // 有排队任务且标志空闲：重新取得标志继续排空
        shared.processing.store(false, Ordering::Release);
        assert!(shared.settle());
        assert!(shared.processing.load(Ordering::Acquire));
        assert!(events.try_recv().is_err());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remove_where_cancels_only_matching_queued() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let log = recorder();

        let blocker = gated_task(Arc::clone(&gate), Arc::clone(&started));
        scheduler.submit(Arc::clone(&blocker), Priority::Normal);
        started.notified().await;

        let doomed = logging_task("doomed", &log);
        let kept = logging_task("kept", &log);
        let doomed_wait = tokio::spawn({
            let scheduler = scheduler.clone();
            let doomed = Arc::clone(&doomed);
            async move { scheduler.execute_and_await(doomed, Priority::Normal).await }
        });
        let kept_wait = tokio::spawn({
            let scheduler = scheduler.clone();
            let kept = Arc::clone(&kept);
            async move { scheduler.execute_and_await(kept, Priority::Normal).await }
        });
        wait_for_depth(&scheduler, 2).await;
        assert_eq!(scheduler.queue_depth(), 2);

        let removed = scheduler.remove_where(|task| task.description() == "doomed");
        assert_eq!(removed.len(), 1);
        // 正在执行的任务不会被移除
        assert!(scheduler.remove_where(|task| task.description() == "gated").is_empty());

        gate.notify_one();
        assert_eq!(doomed_wait.await.unwrap(), ExecutionResult::Cancelled);
        assert!(kept_wait.await.unwrap().is_success());
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[tokio::test]
    async fn test_events_and_history() {
        let scheduler: TaskScheduler =
            TaskScheduler::new(SchedulerConfig::new().with_history_limit(2));
        let mut events = scheduler.subscribe();
        let log = recorder();

        for name in ["one", "two", "three"] {
            let task = logging_task(name, &log);
            assert!(scheduler.execute_and_await(task, Priority::Normal).await.is_success());
        }

        let history: Vec<_> = scheduler
            .recent_history()
            .iter()
            .map(|record| record.task.description())
            .collect();
        assert_eq!(history, vec!["two", "three"]);

        // 排空通知在最后一个结果回填之后发布
        tokio::task::yield_now().await;
        let mut started = 0;
        let mut completed = 0;
        let mut empty = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SchedulerEvent::TaskStarted { .. } => started += 1,
                SchedulerEvent::TaskCompleted { result, .. } => {
                    assert!(result.is_success());
                    completed += 1;
                }
                SchedulerEvent::QueueEmpty => empty += 1,
                SchedulerEvent::TaskAbandoned { .. } => panic!("nothing was abandoned"),
            }
        }
        assert_eq!(started, 3);
        assert_eq!(completed, 3);
        assert!(empty >= 1);
    }

    #[tokio::test]
    async fn test_queued_descriptions_in_execution_order() {
        let scheduler: TaskScheduler = TaskScheduler::default();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let log = recorder();

        scheduler.submit(gated_task(Arc::clone(&gate), Arc::clone(&started)), Priority::Normal);
        started.notified().await;
        assert!(scheduler.current_task().is_some());
        assert!(!scheduler.is_idle());

        scheduler.submit(logging_task("low", &log), Priority::Low);
        scheduler.submit(logging_task("critical", &log), Priority::Critical);

        assert_eq!(
            scheduler.queued_descriptions(),
            vec!["[Critical] critical".to_string(), "[Low] low".to_string()]
        );
        gate.notify_one();
    }
}
