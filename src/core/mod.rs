//! 核心编排层：任务抽象、优先级队列、任务调度、操作执行

pub mod error;
pub mod executor;
pub mod queue;
pub mod task;
pub mod task_scheduler;

pub use error::TaskError;
pub use executor::{FnOperation, Operation, OperationContext, OperationExecutor};
pub use queue::PriorityQueue;
pub use task::{BoxTaskFuture, ExecutionResult, FnTask, Priority, Task, TaskId};
pub use task_scheduler::{
    CancelAllReport, CompletedTask, SchedulerConfig, SchedulerEvent, TaskScheduler,
};
