//! 目标解析器（TargetResolver）
//!
//! 按顺序为操作的每个目标槽位找到具体实体：
//! 1. 按 SelectionRole 决定由哪个参与者选择，取其注册的选择器（没有则用兜底）；
//! 2. 每次尝试都受单次超时、外部取消令牌、解析器自身令牌约束，任一触发即中止该尝试；
//! 3. 选中的候选用槽位谓词校验，失败则把原因带入下一次尝试；
//! 4. 重试 / 升级兜底 / 跳过 / 失败由 [`SlotMachine`] 决定。
//!
//! 外部令牌或解析器令牌触发时立即中止整个解析，剩余槽位不再处理。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::attempt::{AttemptLimits, AttemptOutcome, SlotMachine, Transition};
use super::{
    Battlefield, ControllerId, EntityId, FillFailure, ResolvedTargetSet, SelectionError,
    SelectionRequest, SelectionRole, SelectionStrategy, StrategyHandle, StrategyRegistry,
    TargetRequirement, ValidationContext,
};
use crate::core::error::panic_message;

/// 解析器配置
#[derive(Debug, Clone)]
pub struct TargetingConfig {
    /// 每个槽位主选择器的尝试次数
    pub max_attempts: u32,
    /// 单次尝试超时
    pub attempt_timeout: Duration,
    /// 升级到兜底后的尝试次数
    pub fallback_attempts: u32,
    pub event_capacity: usize,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            attempt_timeout: Duration::from_secs(15),
            fallback_attempts: 1,
            event_capacity: 64,
        }
    }
}

impl TargetingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_fallback_attempts(mut self, attempts: u32) -> Self {
        self.fallback_attempts = attempts.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn limits(&self) -> AttemptLimits {
        AttemptLimits {
            max_attempts: self.max_attempts,
            fallback_attempts: self.fallback_attempts,
        }
    }
}

/// 选择过程事件（UI 箭头、提示文字、日志等订阅）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionEvent {
    SelectionStarted {
        key: String,
        attempt: u32,
        strategy: String,
        chooser: Option<ControllerId>,
    },
    SelectionCompleted {
        key: String,
        chosen: EntityId,
    },
    /// 候选未通过校验，原因可直接展示给玩家
    SelectionRejected {
        key: String,
        candidate: EntityId,
        reason: String,
    },
    SelectionCancelled {
        key: String,
    },
    FallbackEscalated {
        key: String,
        from: String,
    },
}

/// 一次 FillTargets 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFill {
    /// 已解析的目标（失败时为失败前已解析的部分）
    pub resolved: ResolvedTargetSet,
    pub failure: Option<FillFailure>,
}

impl TargetFill {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(FillFailure::Cancelled))
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub fn into_result(self) -> Result<ResolvedTargetSet, FillFailure> {
        match self.failure {
            None => Ok(self.resolved),
            Some(failure) => Err(failure),
        }
    }
}

/// 单次尝试的原始结果（尚未校验）
enum Selection {
    Chosen(Option<EntityId>),
    TimedOut,
    Errored(String),
    /// 选择器在尝试中被注销
    Revoked,
    Aborted,
}

enum SlotResult {
    Filled(EntityId),
    Skipped,
    Failed(String),
    Cancelled,
}

pub struct TargetResolver {
    battlefield: Arc<dyn Battlefield>,
    registry: StrategyRegistry,
    config: TargetingConfig,
    /// 解析器自身的取消作用域；cancel() 时替换
    scope: Mutex<CancellationToken>,
    events: broadcast::Sender<SelectionEvent>,
}

impl TargetResolver {
    pub fn new(
        battlefield: Arc<dyn Battlefield>,
        fallback: Arc<dyn SelectionStrategy>,
        config: TargetingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            battlefield,
            registry: StrategyRegistry::new(fallback),
            config,
            scope: Mutex::new(CancellationToken::new()),
            events,
        }
    }

    pub fn register_strategy(&self, controller: ControllerId, strategy: Arc<dyn SelectionStrategy>) {
        self.registry.register(controller, strategy);
    }

    /// 注销后，该参与者正在进行的选择按「无候选」处理
    pub fn unregister_strategy(&self, controller: ControllerId) -> bool {
        self.registry.unregister(controller)
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TargetingConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SelectionEvent> {
        self.events.subscribe()
    }

    /// 中止所有进行中的解析；之后开始的解析不受影响
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.scope.lock(), CancellationToken::new());
        info!("Cancelling in-flight target resolution");
        previous.cancel();
    }

    /// 依次填充目标槽位
    ///
    /// `mandatory_overall` 为 false 时所有槽位都按可选处理。只有必填槽位无法填充或被取消时
    /// 才返回失败；可选槽位可以留空。
    pub async fn fill_targets(
        &self,
        requirements: &[TargetRequirement],
        source: EntityId,
        mandatory_overall: bool,
        cancel: &CancellationToken,
    ) -> TargetFill {
        let scope = self.scope.lock().clone();
        let controller = self.battlefield.controller_of(source);
        let opponent = controller.and_then(|c| self.battlefield.opponent_of(c));
        let mut resolved = ResolvedTargetSet::new();

        debug!(
            source = %source,
            requirements = requirements.len(),
            "Filling targets"
        );

        for requirement in requirements {
            if cancel.is_cancelled() || scope.is_cancelled() {
                debug!(key = requirement.key(), "Target resolution cancelled before slot");
                return TargetFill {
                    resolved,
                    failure: Some(FillFailure::Cancelled),
                };
            }

            let context = ValidationContext {
                source,
                controller,
                opponent,
                resolved: resolved.clone(),
            };
            let mandatory = mandatory_overall && requirement.is_mandatory();

            match self
                .fill_slot(requirement, mandatory, &context, cancel, &scope)
                .await
            {
                SlotResult::Filled(entity) => {
                    resolved.insert(requirement.key(), entity);
                }
                SlotResult::Skipped => {
                    debug!(key = requirement.key(), "Optional target left unfilled");
                }
                SlotResult::Failed(reason) => {
                    warn!(key = requirement.key(), "Mandatory target could not be filled: {}", reason);
                    return TargetFill {
                        resolved,
                        failure: Some(FillFailure::Unfillable {
                            key: requirement.key().to_string(),
                            reason,
                        }),
                    };
                }
                SlotResult::Cancelled => {
                    return TargetFill {
                        resolved,
                        failure: Some(FillFailure::Cancelled),
                    };
                }
            }
        }

        TargetFill {
            resolved,
            failure: None,
        }
    }

    async fn fill_slot(
        &self,
        requirement: &TargetRequirement,
        mandatory: bool,
        context: &ValidationContext,
        cancel: &CancellationToken,
        scope: &CancellationToken,
    ) -> SlotResult {
        let key = requirement.key();
        let chooser = self.chooser_for(requirement.role(), context);
        let primary = self.registry.lookup(chooser);
        let mut machine = SlotMachine::new(mandatory, primary.is_fallback, self.config.limits());

        loop {
            // 每次都重新查找：参与者可能在两次尝试之间被注销
            let handle = if machine.on_fallback() {
                self.registry.fallback()
            } else {
                self.registry.lookup(chooser)
            };
            if handle.is_fallback && !machine.on_fallback() {
                debug!(key, "Chooser no longer registered, continuing on fallback strategy");
                machine.mark_on_fallback();
            }
            let attempt = machine.begin();
            let request = SelectionRequest {
                key: key.to_string(),
                description: requirement.description().to_string(),
                role: requirement.role(),
                mandatory,
                chooser,
                context: context.clone(),
                candidates: self.candidates(requirement, context),
                attempt,
                previous_rejection: machine.last_failure().map(str::to_string),
            };

            debug!(
                key,
                attempt,
                strategy = handle.name(),
                candidates = request.candidates.len(),
                "Requesting selection"
            );
            self.publish(SelectionEvent::SelectionStarted {
                key: key.to_string(),
                attempt,
                strategy: handle.name().to_string(),
                chooser,
            });

            let outcome = match self.select_once(&handle, &request, cancel, scope).await {
                Selection::Aborted => {
                    debug!(key, attempt, "Selection cancelled");
                    self.publish(SelectionEvent::SelectionCancelled { key: key.to_string() });
                    return SlotResult::Cancelled;
                }
                Selection::Revoked => {
                    info!(key, attempt, "Strategy unregistered during selection");
                    AttemptOutcome::NoCandidate
                }
                Selection::Chosen(None) => AttemptOutcome::NoCandidate,
                Selection::Chosen(Some(candidate)) => match requirement.validate(candidate, context) {
                    Ok(()) => AttemptOutcome::Valid(candidate),
                    Err(reason) => {
                        debug!(key, attempt, candidate = %candidate, "Candidate rejected: {}", reason);
                        self.publish(SelectionEvent::SelectionRejected {
                            key: key.to_string(),
                            candidate,
                            reason: reason.clone(),
                        });
                        AttemptOutcome::Invalid { candidate, reason }
                    }
                },
                Selection::TimedOut => {
                    debug!(key, attempt, strategy = handle.name(), "Selection timed out");
                    AttemptOutcome::TimedOut
                }
                Selection::Errored(reason) => {
                    warn!(key, attempt, strategy = handle.name(), "Selection strategy failed: {}", reason);
                    AttemptOutcome::Errored(reason)
                }
            };

            match machine.record(outcome) {
                Transition::Succeed(chosen) => {
                    self.publish(SelectionEvent::SelectionCompleted {
                        key: key.to_string(),
                        chosen,
                    });
                    return SlotResult::Filled(chosen);
                }
                Transition::Retry => continue,
                Transition::EscalateToFallback => {
                    warn!(
                        key,
                        from = handle.name(),
                        attempts = machine.total_attempts(),
                        "Escalating mandatory target to fallback strategy"
                    );
                    self.publish(SelectionEvent::FallbackEscalated {
                        key: key.to_string(),
                        from: handle.name().to_string(),
                    });
                }
                Transition::Skip => return SlotResult::Skipped,
                Transition::Fail(reason) => return SlotResult::Failed(reason),
            }
        }
    }

    /// 一次选择：超时 / 外部取消 / 解析器取消 / 注销四者竞争
    async fn select_once(
        &self,
        handle: &StrategyHandle,
        request: &SelectionRequest,
        cancel: &CancellationToken,
        scope: &CancellationToken,
    ) -> Selection {
        let attempt_token = CancellationToken::new();
        // 尝试结束（任一分支胜出）即通知选择器
        let _attempt_guard = attempt_token.clone().drop_guard();
        let revoked = handle
            .registration
            .clone()
            .unwrap_or_else(CancellationToken::new);

        let selection = AssertUnwindSafe(handle.strategy.select_target(request, attempt_token))
            .catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Selection::Aborted,
            _ = scope.cancelled() => Selection::Aborted,
            _ = revoked.cancelled() => Selection::Revoked,
            result = tokio::time::timeout(self.config.attempt_timeout, selection) => match result {
                Err(_) => Selection::TimedOut,
                Ok(Err(panic)) => Selection::Errored(format!("strategy panicked: {}", panic_message(panic.as_ref()))),
                Ok(Ok(Err(SelectionError::Cancelled))) if revoked.is_cancelled() => Selection::Revoked,
                Ok(Ok(Err(err))) => Selection::Errored(err.to_string()),
                Ok(Ok(Ok(choice))) => Selection::Chosen(choice),
            },
        }
    }

    /// 决定由哪个参与者选择
    fn chooser_for(&self, role: SelectionRole, context: &ValidationContext) -> Option<ControllerId> {
        match role {
            SelectionRole::Initiator => context.controller,
            SelectionRole::Opponent => context.opponent,
            SelectionRole::AnyParticipant | SelectionRole::AllParticipants => {
                let seats = self.battlefield.controllers();
                let start = context
                    .controller
                    .and_then(|c| seats.iter().position(|seat| *seat == c))
                    .unwrap_or(0);
                (0..seats.len())
                    .map(|offset| seats[(start + offset) % seats.len()])
                    .find(|seat| self.registry.is_registered(*seat))
            }
        }
    }

    /// 场上通过谓词的实体
    fn candidates(&self, requirement: &TargetRequirement, context: &ValidationContext) -> Vec<EntityId> {
        self.battlefield
            .entities()
            .into_iter()
            .filter(|entity| requirement.validate(*entity, context).is_ok())
            .collect()
    }

    fn publish(&self, event: SelectionEvent) {
        let _ = self.events.send(event);
    }
}
