//! Copy-on-write working grid and the commit gate.
//!
//! Planning never touches the master grid. A working clone captures the
//! master at a version; the strategy and the projection mutate the clone;
//! commit swaps the clone in only if the master has not moved underneath it.

use log::{debug, warn};

use crate::units::{tolerance_units, Side, SideMap};

use super::accountant::Accountant;
use super::model::Grid;
use super::types::{ActionPlan, GridSlot, PlanAction, SlotId, SlotState};

/// Why a plan was refused at the commit gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRejection {
    /// The master advanced while the plan was being built.
    Stale { master: u64, base: u64 },
    /// The working grid is identical to the master; nothing to do.
    EmptyDelta,
    /// A CREATE targets a slot that still holds a live on-book order the
    /// same plan does not release.
    SlotOccupied(SlotId),
}

impl std::fmt::Display for CommitRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitRejection::Stale { master, base } => {
                write!(f, "stale plan: master v{master}, planned against v{base}")
            }
            CommitRejection::EmptyDelta => write!(f, "empty delta"),
            CommitRejection::SlotOccupied(id) => {
                write!(f, "create targets occupied slot {id}")
            }
        }
    }
}

/// Per-side shortfall found during fund validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundShortfall {
    pub side: Side,
    pub required: u64,
    pub available: u64,
}

/// A cheap clone of the master grid captured at plan start.
#[derive(Debug, Clone)]
pub struct WorkingGrid {
    pub grid: Grid,
    pub base_version: u64,
}

impl WorkingGrid {
    /// Capture the master under the grid lock.
    pub fn capture(master: &Grid) -> Self {
        Self {
            grid: master.clone(),
            base_version: master.version,
        }
    }

    /// Project a plan's actions onto the working slots.
    ///
    /// CREATE leaves the slot Virtual (it only turns Active once the
    /// exchange confirms an id). CANCEL resets to the Spread placeholder.
    /// A rotation moves state and order id to the new slot in one step; the
    /// preserved slot's size comes from the action, never synthesized from
    /// the target ladder.
    pub fn project(&mut self, plan: &ActionPlan) {
        for action in &plan.actions {
            match action {
                PlanAction::Create {
                    slot, side, size, ..
                } => {
                    if let Ok(s) = self.grid.slot_mut(*slot) {
                        s.set_virtual_size(*size, *side);
                    }
                }
                PlanAction::Cancel { slot, .. } => {
                    if let Ok(s) = self.grid.slot_mut(*slot) {
                        s.reset_to_spread();
                    }
                }
                PlanAction::Move {
                    from,
                    to,
                    order_id,
                    side,
                    size,
                    ..
                } => {
                    if from == to {
                        // In-place resize: the order stays put; a Partial
                        // stays Partial until the exchange confirms.
                        if let Ok(s) = self.grid.slot_mut(*from) {
                            s.size = *size;
                            s.committed_side = Some(*side);
                        }
                        continue;
                    }
                    let (state, oid) = match self.grid.slot(*from) {
                        Ok(s) => (s.state, s.order_id.clone()),
                        Err(_) => (SlotState::Virtual, None),
                    };
                    let oid = oid.or_else(|| Some(order_id.clone()));
                    if let Ok(s) = self.grid.slot_mut(*from) {
                        s.reset_to_spread();
                    }
                    if let Ok(s) = self.grid.slot_mut(*to) {
                        s.set_book_state(state, *size, oid, *side);
                    }
                }
            }
        }
    }

    /// Funds the working grid requires per side, including virtual
    /// allocations that are about to be placed.
    pub fn required_funds(&self) -> SideMap<u64> {
        let mut required = SideMap::<u64>::default();
        for slot in self.grid.slots() {
            if let Some(side) = slot.committed_side {
                required[side] += slot.size;
            }
        }
        required
    }

    /// Check required amounts against the whole-side totals.
    ///
    /// The plan replaces existing on-book commitments with new ones of the
    /// same asset, so the bound is `chain_total`, not the liquid remainder.
    pub fn validate_funds(&self, funds: &Accountant) -> Result<(), Vec<FundShortfall>> {
        let required = self.required_funds();
        let mut shortfalls = Vec::new();
        for side in [Side::Buy, Side::Sell] {
            let total = funds.chain_total[side];
            let slack = tolerance_units(total.max(required[side]));
            if required[side] > total + slack {
                shortfalls.push(FundShortfall {
                    side,
                    required: required[side],
                    available: total,
                });
            }
        }
        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(shortfalls)
        }
    }
}

/// Validate and apply a working grid to the master. Caller holds the grid
/// lock; broadcast happens after, outside the lock.
pub fn commit(
    work: WorkingGrid,
    plan: &ActionPlan,
    master: &mut Grid,
) -> Result<(), CommitRejection> {
    if master.version != work.base_version {
        warn!(
            "plan rejected: master at v{}, plan base v{}",
            master.version, work.base_version
        );
        return Err(CommitRejection::Stale {
            master: master.version,
            base: work.base_version,
        });
    }

    if work.grid.slots() == master.slots() && work.grid.boundary == master.boundary {
        return Err(CommitRejection::EmptyDelta);
    }

    for action in &plan.actions {
        if let PlanAction::Create { slot, .. } = action {
            let current = match master.slot(*slot) {
                Ok(s) => s,
                Err(_) => continue,
            };
            if current.is_on_book() && current.order_id.is_some() && !plan_releases(plan, *slot) {
                return Err(CommitRejection::SlotOccupied(*slot));
            }
        }
    }

    let boundary = work.grid.boundary;
    let slots: Vec<GridSlot> = work.grid.slots().to_vec();
    master.install(slots, boundary);
    debug!("plan committed: master now v{}", master.version);
    Ok(())
}

fn plan_releases(plan: &ActionPlan, slot: SlotId) -> bool {
    plan.actions.iter().any(|a| a.releases() == Some(slot))
}
