//! 目标解析错误类型

use thiserror::Error;

/// 选择器返回的错误；解析器把它记为一次失败尝试，不向上抛出
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Selection cancelled")]
    Cancelled,

    /// 交互通道另一端（UI）已关闭
    #[error("Selection channel closed")]
    ChannelClosed,

    #[error("Strategy failed: {0}")]
    Strategy(String),
}

/// 整体填充失败的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FillFailure {
    #[error("Target resolution cancelled")]
    Cancelled,

    #[error("Target '{key}' could not be filled: {reason}")]
    Unfillable { key: String, reason: String },
}
