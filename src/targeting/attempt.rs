//! 单个目标槽位的尝试状态机
//!
//! Pending → Attempting → {Valid, Invalid/NoCandidate, TimedOut, Errored}
//! → (Retry | EscalateToFallback | Skip | Fail | Succeed)
//!
//! 与 I/O 无关：解析器负责真正发起选择，这里只决定下一步。

use std::fmt;

use super::EntityId;

/// 重试预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
    /// 主选择器的尝试次数（至少 1）
    pub max_attempts: u32,
    /// 升级到兜底后的尝试次数（至少 1）
    pub fallback_attempts: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            fallback_attempts: 1,
        }
    }
}

/// 一次尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Valid(EntityId),
    Invalid { candidate: EntityId, reason: String },
    NoCandidate,
    TimedOut,
    /// 选择器报错或 panic
    Errored(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid(entity) => write!(f, "selected {entity}"),
            Self::Invalid { candidate, reason } => write!(f, "{candidate} rejected: {reason}"),
            Self::NoCandidate => write!(f, "no candidate selected"),
            Self::TimedOut => write!(f, "selection timed out"),
            Self::Errored(reason) => write!(f, "strategy error: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Attempting { attempt: u32, on_fallback: bool },
    Filled(EntityId),
    Skipped,
    Failed(String),
}

/// 记录结果后的下一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Succeed(EntityId),
    Retry,
    EscalateToFallback,
    Skip,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct SlotMachine {
    mandatory: bool,
    limits: AttemptLimits,
    state: SlotState,
    on_fallback: bool,
    /// 当前阶段（主 / 兜底）已用次数
    phase_attempts: u32,
    total_attempts: u32,
    last_failure: Option<String>,
}

impl SlotMachine {
    /// `primary_is_fallback`：该槽位一开始就只能用兜底（没有已注册的选择器），此时不再升级
    pub fn new(mandatory: bool, primary_is_fallback: bool, limits: AttemptLimits) -> Self {
        Self {
            mandatory,
            limits: AttemptLimits {
                max_attempts: limits.max_attempts.max(1),
                fallback_attempts: limits.fallback_attempts.max(1),
            },
            state: SlotState::Pending,
            on_fallback: primary_is_fallback,
            phase_attempts: 0,
            total_attempts: 0,
            last_failure: None,
        }
    }

    /// 开始一次尝试，返回总尝试序号（从 1 开始）
    ///
    /// # Panics
    ///
    /// 槽位已结束（Filled / Skipped / Failed）时 panic。
    pub fn begin(&mut self) -> u32 {
        assert!(
            !self.is_terminal(),
            "begin called on a finished slot: {:?}",
            self.state
        );
        self.phase_attempts += 1;
        self.total_attempts += 1;
        self.state = SlotState::Attempting {
            attempt: self.total_attempts,
            on_fallback: self.on_fallback,
        };
        self.total_attempts
    }

    pub fn record(&mut self, outcome: AttemptOutcome) -> Transition {
        match outcome {
            AttemptOutcome::Valid(entity) => {
                self.state = SlotState::Filled(entity);
                Transition::Succeed(entity)
            }
            AttemptOutcome::NoCandidate if !self.mandatory => {
                self.state = SlotState::Skipped;
                Transition::Skip
            }
            failed => {
                self.last_failure = Some(failed.to_string());
                self.after_failure()
            }
        }
    }

    fn after_failure(&mut self) -> Transition {
        let budget = if self.escalated() {
            self.limits.fallback_attempts
        } else {
            self.limits.max_attempts
        };

        if self.phase_attempts < budget {
            self.state = SlotState::Pending;
            return Transition::Retry;
        }

        if self.mandatory && !self.on_fallback {
            self.on_fallback = true;
            self.phase_attempts = 0;
            self.state = SlotState::Pending;
            return Transition::EscalateToFallback;
        }

        if self.mandatory {
            let reason = format!(
                "gave up after {} attempt(s): {}",
                self.total_attempts,
                self.last_failure.as_deref().unwrap_or("no candidate selected")
            );
            self.state = SlotState::Failed(reason.clone());
            Transition::Fail(reason)
        } else {
            self.state = SlotState::Skipped;
            Transition::Skip
        }
    }

    /// 主阶段中途主选择器消失（被注销），后续尝试已由兜底承担
    ///
    /// 沿用主阶段的剩余预算，之后不再升级；已在兜底上时无效果。
    pub fn mark_on_fallback(&mut self) {
        if !self.on_fallback {
            self.on_fallback = true;
        }
    }

    /// 是否已从主选择器升级到兜底
    fn escalated(&self) -> bool {
        self.on_fallback && self.total_attempts > self.phase_attempts
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }

    /// 下一次尝试是否应使用兜底选择器
    pub fn on_fallback(&self) -> bool {
        self.on_fallback
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SlotState::Filled(_) | SlotState::Skipped | SlotState::Failed(_)
        )
    }
}
