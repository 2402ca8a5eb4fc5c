//! 任务错误类型
//!
//! `Task::execute` 的返回错误；调度器在边界处把它映射为 `ExecutionResult`：
//! Cancelled -> Cancelled，其余 -> Failure(reason)。

use std::any::Any;

use thiserror::Error;

/// 任务执行过程中可能出现的错误（取消、业务失败、未预期错误）
#[derive(Error, Debug)]
pub enum TaskError {
    /// 任务观察到取消令牌后主动退出，不视为失败
    #[error("Task cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// 写入 `ExecutionResult::Failure` 的原因文本
    pub fn reason(&self) -> String {
        match self {
            Self::Cancelled => "cancelled".to_string(),
            Self::Failed(reason) => reason.clone(),
            Self::Other(err) => format!("{err:#}"),
        }
    }
}

/// 提取 panic 载荷中的文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
