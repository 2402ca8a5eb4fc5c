//! Duel - 卡牌对战客户端核心演示
//!
//! 入口：加载配置、初始化日志，让两个 AI 互相攻击几个回合，走完「目标解析 → 构造任务 → 串行调度」全流程。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use duel::config::load_config;
use duel::core::{
    ExecutionResult, FnOperation, FnTask, OperationExecutor, SchedulerEvent, Task, TaskError,
    TaskScheduler,
};
use duel::targeting::{
    Battlefield, ControllerId, EntityId, RandomStrategy, ScoringStrategy, Seating, SelectionRole,
    TargetRequirement, TargetResolver,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

const ALICE: ControllerId = ControllerId(0);
const BOB: ControllerId = ControllerId(1);

type Health = Arc<Mutex<HashMap<EntityId, i64>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    duel::observability::init();

    let config = load_config(None).context("Failed to load configuration")?;

    let seating = Arc::new(Seating::new([ALICE, BOB]));
    let health: Health = Arc::new(Mutex::new(HashMap::new()));
    for (entity, owner, hp) in [
        (EntityId(1), ALICE, 20),
        (EntityId(2), ALICE, 3),
        (EntityId(11), BOB, 20),
        (EntityId(12), BOB, 4),
    ] {
        seating.place(entity, owner);
        health.lock().insert(entity, hp);
    }

    let resolver = Arc::new(TargetResolver::new(
        Arc::clone(&seating) as Arc<dyn Battlefield>,
        Arc::new(RandomStrategy::new(7)),
        config.targeting_config(),
    ));
    // AI：优先打血量最低的目标
    for controller in [ALICE, BOB] {
        let health = Arc::clone(&health);
        resolver.register_strategy(
            controller,
            Arc::new(ScoringStrategy::new(format!("ai-{}", controller.0), move |entity, _req| {
                -health.lock().get(&entity).copied().unwrap_or(i64::MAX / 2)
            })),
        );
    }

    let scheduler: TaskScheduler = TaskScheduler::new(config.scheduler_config());
    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SchedulerEvent::TaskCompleted { description, result, .. } = event {
                info!(result = %result, "Completed: {}", description);
            }
        }
    });

    let executor = OperationExecutor::new(scheduler.clone(), resolver);
    let cancel = CancellationToken::new();

    for (turn, attacker) in [EntityId(1), EntityId(11), EntityId(2), EntityId(12)]
        .into_iter()
        .enumerate()
    {
        let strike = strike_operation(&seating, &health, attacker);
        let result = executor.execute(&strike, attacker, &cancel).await;
        info!(turn = turn + 1, attacker = %attacker, result = %result, "Turn finished");
        if let ExecutionResult::Failure(reason) = &result {
            info!("Turn skipped: {}", reason);
        }
    }

    let report = scheduler.cancel_all().await;
    info!(
        queued = report.cancelled_queued,
        abandoned = report.abandoned,
        "Duel over"
    );
    for (entity, hp) in health.lock().iter() {
        info!(entity = %entity, hp, "Final health");
    }
    Ok(())
}

/// 对一个敌方单位造成 2 点伤害；阵亡单位离场
fn strike_operation(seating: &Arc<Seating>, health: &Health, attacker: EntityId) -> FnOperation {
    let victim = {
        let seating = Arc::clone(seating);
        TargetRequirement::new("victim", SelectionRole::Initiator, move |entity, ctx| {
            if seating.controller_of(entity) == ctx.opponent {
                Ok(())
            } else {
                Err("can only strike enemies".to_string())
            }
        })
        .with_description("Choose an enemy to strike")
    };

    let seating = Arc::clone(seating);
    let health = Arc::clone(health);
    FnOperation::new(format!("strike from {attacker}"), move |ctx| {
        let seating = Arc::clone(&seating);
        let health = Arc::clone(&health);
        let victim = ctx.targets.get("victim");
        Arc::new(FnTask::new(format!("{attacker} strikes"), move |_cancel| {
            let seating = Arc::clone(&seating);
            let health = Arc::clone(&health);
            async move {
                let Some(victim) = victim else {
                    return Err(TaskError::failed("no victim chosen"));
                };
                let mut health = health.lock();
                let hp = health.entry(victim).or_insert(0);
                *hp -= 2;
                info!(victim = %victim, hp = *hp, "Strike lands");
                if *hp <= 0 {
                    seating.remove(victim);
                    info!(victim = %victim, "Unit destroyed");
                }
                Ok(())
            }
        })) as Arc<dyn Task>
    })
    .with_requirement(victim)
}
