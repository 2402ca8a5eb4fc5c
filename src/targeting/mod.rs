//! 目标解析：目标槽位、选择器、注册表、单槽位状态机、解析器

pub mod attempt;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod strategy;
pub mod types;

pub use attempt::{AttemptLimits, AttemptOutcome, SlotMachine, SlotState, Transition};
pub use error::{FillFailure, SelectionError};
pub use registry::{StrategyHandle, StrategyRegistry};
pub use resolver::{SelectionEvent, TargetFill, TargetResolver, TargetingConfig};
pub use strategy::{
    InteractiveStrategy, RandomStrategy, ScoringStrategy, SelectionPrompt, SelectionStrategy,
};
pub use types::{
    Battlefield, ControllerId, EntityId, ResolvedTargetSet, SelectionRequest, SelectionRole,
    Seating, TargetPredicate, TargetRequirement, ValidationContext,
};
