//! 目标解析的数据类型
//!
//! 实体与控制者都用稳定的数值 ID 表示；解析结果只引用实体，不持有它们。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// 场上实体（角色、随从、卡牌……）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// 参与者（玩家或 AI）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ControllerId(pub u32);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller#{}", self.0)
    }
}

/// 由谁来做选择
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SelectionRole {
    /// 发起者（来源实体的控制者）
    Initiator,
    /// 来源控制者当前的对手
    Opponent,
    /// 座次中第一个已注册选择器的参与者（从发起者开始）
    AnyParticipant,
    /// 同 AnyParticipant；用于「所有参与者都可响应」的槽位
    AllParticipants,
}

/// 校验上下文：谁在发起、对手是谁、本次已解析的目标
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub source: EntityId,
    pub controller: Option<ControllerId>,
    pub opponent: Option<ControllerId>,
    pub resolved: ResolvedTargetSet,
}

pub type TargetPredicate =
    Arc<dyn Fn(EntityId, &ValidationContext) -> Result<(), String> + Send + Sync>;

/// 操作需要填充的一个目标槽位
#[derive(Clone)]
pub struct TargetRequirement {
    key: String,
    description: String,
    role: SelectionRole,
    mandatory: bool,
    predicate: TargetPredicate,
}

impl TargetRequirement {
    /// 创建必填槽位；谓词返回 Err(reason) 表示候选不合法
    pub fn new<F>(key: impl Into<String>, role: SelectionRole, predicate: F) -> Self
    where
        F: Fn(EntityId, &ValidationContext) -> Result<(), String> + Send + Sync + 'static,
    {
        let key = key.into();
        Self {
            description: key.clone(),
            key,
            role,
            mandatory: true,
            predicate: Arc::new(predicate),
        }
    }

    /// 接受任意实体的槽位
    pub fn any(key: impl Into<String>, role: SelectionRole) -> Self {
        Self::new(key, role, |_, _| Ok(()))
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn role(&self) -> SelectionRole {
        self.role
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    pub fn validate(&self, candidate: EntityId, context: &ValidationContext) -> Result<(), String> {
        (self.predicate)(candidate, context)
    }
}

impl fmt::Debug for TargetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRequirement")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

/// 已解析目标：槽位 key -> 实体，按解析顺序保存，只增不改
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTargetSet {
    entries: Vec<(String, EntityId)>,
}

impl ResolvedTargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个目标；key 已存在时保留原值并返回 false
    pub fn insert(&mut self, key: impl Into<String>, entity: EntityId) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, entity));
        true
    }

    pub fn get(&self, key: &str) -> Option<EntityId> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, entity)| *entity)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// 是否已有任一槽位指向该实体
    pub fn targets(&self, entity: EntityId) -> bool {
        self.entries.iter().any(|(_, e)| *e == entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, EntityId)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), *e))
    }
}

/// 交给选择器的一次选择请求
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub key: String,
    pub description: String,
    pub role: SelectionRole,
    pub mandatory: bool,
    /// 由谁选择；None 表示找不到对应参与者（走兜底）
    pub chooser: Option<ControllerId>,
    pub context: ValidationContext,
    /// 当前通过谓词的候选
    pub candidates: Vec<EntityId>,
    /// 从 1 开始
    pub attempt: u32,
    /// 上一次候选被拒绝的原因（UI 提示用）
    pub previous_rejection: Option<String>,
}

/// 解析器对场面的只读视图
pub trait Battlefield: Send + Sync {
    fn controller_of(&self, entity: EntityId) -> Option<ControllerId>;

    fn opponent_of(&self, controller: ControllerId) -> Option<ControllerId>;

    /// 座次顺序的全部参与者
    fn controllers(&self) -> Vec<ControllerId>;

    /// 所有可作为目标的实体
    fn entities(&self) -> Vec<EntityId>;
}

/// 简单的内存座次表：参与者按座次排列，对手为下一个座位
#[derive(Debug, Default)]
pub struct Seating {
    seats: Vec<ControllerId>,
    owners: RwLock<HashMap<EntityId, ControllerId>>,
}

impl Seating {
    pub fn new(seats: impl IntoIterator<Item = ControllerId>) -> Self {
        Self {
            seats: seats.into_iter().collect(),
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// 实体进场（或换控制者）
    pub fn place(&self, entity: EntityId, controller: ControllerId) {
        self.owners.write().insert(entity, controller);
    }

    /// 实体离场
    pub fn remove(&self, entity: EntityId) -> bool {
        self.owners.write().remove(&entity).is_some()
    }
}

impl Battlefield for Seating {
    fn controller_of(&self, entity: EntityId) -> Option<ControllerId> {
        self.owners.read().get(&entity).copied()
    }

    fn opponent_of(&self, controller: ControllerId) -> Option<ControllerId> {
        if self.seats.len() < 2 {
            return None;
        }
        let seat = self.seats.iter().position(|c| *c == controller)?;
        Some(self.seats[(seat + 1) % self.seats.len()])
    }

    fn controllers(&self) -> Vec<ControllerId> {
        self.seats.clone()
    }

    fn entities(&self) -> Vec<EntityId> {
        let mut entities: Vec<_> = self.owners.read().keys().copied().collect();
        entities.sort();
        entities
    }
}
