//! 选择器：每个参与者一个（交互 / AI），外加进程级兜底（随机）
//!
//! 选择器可能很慢（等待玩家点击），解析器负责超时与取消；选择器只需在令牌触发时尽快返回。

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{EntityId, SelectionError, SelectionRequest};

/// 为一个目标槽位挑选候选
#[async_trait]
pub trait SelectionStrategy: Send + Sync {
    /// 名称（用于日志）
    fn name(&self) -> &str;

    /// 返回 Ok(None) 表示放弃选择
    async fn select_target(
        &self,
        request: &SelectionRequest,
        cancel: CancellationToken,
    ) -> Result<Option<EntityId>, SelectionError>;
}

/// 随机兜底：在合法候选中均匀随机，种子固定时可复现
pub struct RandomStrategy {
    rng: Mutex<ChaCha8Rng>,
}

impl RandomStrategy {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }
}

#[async_trait]
impl SelectionStrategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    async fn select_target(
        &self,
        request: &SelectionRequest,
        _cancel: CancellationToken,
    ) -> Result<Option<EntityId>, SelectionError> {
        let mut rng = self.rng.lock();
        let choice = request.candidates.choose(&mut *rng).copied();
        Ok(choice)
    }
}

/// 发往 UI 层的一次选择提示；UI 通过 `respond` 回复
#[derive(Debug)]
pub struct SelectionPrompt {
    pub request: SelectionRequest,
    reply: oneshot::Sender<Option<EntityId>>,
}

impl SelectionPrompt {
    /// 回复选择结果；请求方已放弃（超时/取消）时返回 false
    pub fn respond(self, choice: Option<EntityId>) -> bool {
        self.reply.send(choice).is_ok()
    }

    pub fn decline(self) -> bool {
        self.respond(None)
    }

    /// 请求方是否已不再等待
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// 人类玩家：把请求转发给 UI 并等待点击结果
pub struct InteractiveStrategy {
    name: String,
    prompts: mpsc::UnboundedSender<SelectionPrompt>,
}

impl InteractiveStrategy {
    /// 返回选择器与 UI 侧的提示接收端
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<SelectionPrompt>) {
        let (prompts, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                prompts,
            },
            rx,
        )
    }
}

#[async_trait]
impl SelectionStrategy for InteractiveStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn select_target(
        &self,
        request: &SelectionRequest,
        cancel: CancellationToken,
    ) -> Result<Option<EntityId>, SelectionError> {
        let (reply, answer) = oneshot::channel();
        self.prompts
            .send(SelectionPrompt {
                request: request.clone(),
                reply,
            })
            .map_err(|_| SelectionError::ChannelClosed)?;

        tokio::select! {
            choice = answer => choice.map_err(|_| SelectionError::ChannelClosed),
            _ = cancel.cancelled() => Err(SelectionError::Cancelled),
        }
    }
}

/// AI：给每个合法候选打分，选最高分（同分取先出现者）
pub struct ScoringStrategy<F> {
    name: String,
    score: F,
}

impl<F> ScoringStrategy<F> {
    pub fn new(name: impl Into<String>, score: F) -> Self
    where
        F: Fn(EntityId, &SelectionRequest) -> i64 + Send + Sync,
    {
        Self {
            name: name.into(),
            score,
        }
    }
}

#[async_trait]
impl<F> SelectionStrategy for ScoringStrategy<F>
where
    F: Fn(EntityId, &SelectionRequest) -> i64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn select_target(
        &self,
        request: &SelectionRequest,
        _cancel: CancellationToken,
    ) -> Result<Option<EntityId>, SelectionError> {
        let mut best: Option<(EntityId, i64)> = None;
        for candidate in &request.candidates {
            let score = (self.score)(*candidate, request);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((*candidate, score));
            }
        }
        Ok(best.map(|(entity, _)| entity))
    }
}
