//! The grid engine core.
//!
//! Four tightly coupled subsystems around one price ladder:
//!
//! - `model` - the geometric ladder, the boundary pivot, and role assignment
//! - `strategy` - the boundary crawl that turns fills into an action plan
//! - `accountant` - optimistic fund tracking with drift detection
//! - `planner` / `reconciler` - copy-on-write planning, the commit gate,
//!   startup sync, and recovery
//!
//! `engine` owns all of them as one actor per bot.

pub mod accountant;
pub mod engine;
pub mod model;
pub mod planner;
pub mod reconciler;
pub mod snapshot;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use accountant::{Accountant, DriftFinding, RecalcReport};
pub use engine::{EngineCounters, EngineEvent, EngineSummary, GridEngine};
pub use model::{Grid, GridGeometry};
pub use planner::{commit, CommitRejection, FundShortfall, WorkingGrid};
pub use reconciler::{
    plan_reconciliation, sync_from_chain, RecoveryDenied, RecoveryState, SyncReport,
};
pub use snapshot::{
    ConfigFingerprint, GridSnapshot, SnapshotFlags, SnapshotStore, TradeLog,
};
pub use strategy::CrawlStrategy;
pub use types::{
    ActionPlan, Fill, GridSlot, PlanAction, SlotId, SlotRole, SlotState,
};
