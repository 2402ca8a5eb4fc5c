//! 选择器注册表
//!
//! 按 `ControllerId` 存储 Arc<dyn SelectionStrategy>，参与者加入时注册、被击败/断线时注销。
//! 每次注册附带一个令牌；注销（或被新注册替换）时触发，正在进行的选择据此按「无候选」处理。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ControllerId, SelectionStrategy};

struct Registration {
    strategy: Arc<dyn SelectionStrategy>,
    token: CancellationToken,
}

/// 一次查找的结果
#[derive(Clone)]
pub struct StrategyHandle {
    pub strategy: Arc<dyn SelectionStrategy>,
    /// 注册令牌；兜底选择器没有
    pub registration: Option<CancellationToken>,
    pub is_fallback: bool,
    pub controller: Option<ControllerId>,
}

impl StrategyHandle {
    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    /// 所属注册是否已失效（注销或被替换）
    pub fn is_revoked(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

/// 选择器注册表：参与者选择器 + 进程级兜底
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<ControllerId, Registration>>,
    fallback: Arc<dyn SelectionStrategy>,
}

impl StrategyRegistry {
    pub fn new(fallback: Arc<dyn SelectionStrategy>) -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// 注册（或替换）参与者的选择器；被替换的注册立即失效
    pub fn register(&self, controller: ControllerId, strategy: Arc<dyn SelectionStrategy>) {
        let name = strategy.name().to_string();
        let previous = self.strategies.write().insert(
            controller,
            Registration {
                strategy,
                token: CancellationToken::new(),
            },
        );
        if let Some(previous) = previous {
            debug!(controller = %controller, replaced = previous.strategy.name(), "Replacing strategy");
            previous.token.cancel();
        }
        info!(controller = %controller, strategy = %name, "Strategy registered");
    }

    /// 注销；返回是否存在过注册
    pub fn unregister(&self, controller: ControllerId) -> bool {
        match self.strategies.write().remove(&controller) {
            Some(registration) => {
                registration.token.cancel();
                info!(controller = %controller, "Strategy unregistered");
                true
            }
            None => false,
        }
    }

    /// 查找参与者的选择器；未注册（或 controller 为 None）时返回兜底
    pub fn lookup(&self, controller: Option<ControllerId>) -> StrategyHandle {
        let found = controller.and_then(|id| {
            self.strategies.read().get(&id).map(|registration| StrategyHandle {
                strategy: Arc::clone(&registration.strategy),
                registration: Some(registration.token.clone()),
                is_fallback: false,
                controller: Some(id),
            })
        });
        found.unwrap_or_else(|| StrategyHandle {
            controller,
            ..self.fallback()
        })
    }

    pub fn fallback(&self) -> StrategyHandle {
        StrategyHandle {
            strategy: Arc::clone(&self.fallback),
            registration: None,
            is_fallback: true,
            controller: None,
        }
    }

    pub fn is_registered(&self, controller: ControllerId) -> bool {
        self.strategies.read().contains_key(&controller)
    }

    pub fn registered_controllers(&self) -> Vec<ControllerId> {
        let mut controllers: Vec<_> = self.strategies.read().keys().copied().collect();
        controllers.sort();
        controllers
    }
}
