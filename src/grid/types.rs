//! Core data types for the price-ladder grid.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::units::{AssetAmount, Side};

/// Stable identity of a ladder slot, assigned at grid construction and never
/// reused. The wire form is `slot-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Role of a slot relative to the boundary pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotRole {
    Buy,
    Sell,
    /// In the gap around the market; must hold nothing.
    Spread,
}

impl SlotRole {
    /// The order side this role trades on, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            SlotRole::Buy => Some(Side::Buy),
            SlotRole::Sell => Some(Side::Sell),
            SlotRole::Spread => None,
        }
    }
}

/// On-book state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// Not on the book.
    Virtual,
    /// On the book at full size.
    Active,
    /// On the book with remaining size strictly below full.
    Partial,
}

impl SlotState {
    pub fn is_on_book(&self) -> bool {
        matches!(self, SlotState::Active | SlotState::Partial)
    }
}

/// One rung of the ladder.
///
/// Price and id are fixed for the session; role, state, size, and the
/// exchange order id evolve as the boundary crawls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSlot {
    pub id: SlotId,
    /// Quote per 1 base, fixed at construction.
    pub price: f64,
    pub role: SlotRole,
    pub state: SlotState,
    /// Remaining size in units of the asset sold by `committed_side`.
    pub size: u64,
    /// On-book id while `state` is Active or Partial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Side the current capital commitment is held against. Sticky across a
    /// Spread reassignment until the slot next goes Virtual with zero size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_side: Option<Side>,
}

impl GridSlot {
    /// A fresh, empty slot at a fixed price.
    pub fn new(id: SlotId, price: f64) -> Self {
        Self {
            id,
            price,
            role: SlotRole::Spread,
            state: SlotState::Virtual,
            size: 0,
            order_id: None,
            committed_side: None,
        }
    }

    pub fn is_on_book(&self) -> bool {
        self.state.is_on_book()
    }

    /// Whether this slot is a phantom: on-book state without an id or size.
    pub fn is_phantom(&self) -> bool {
        self.is_on_book() && (self.order_id.is_none() || self.size == 0)
    }

    /// Apply a book-state transition, coercing phantoms.
    ///
    /// Every construction site routes through here: an on-book state without
    /// an order id (or with zero size) is rewritten to Virtual / size 0 and
    /// logged as an attempted phantom.
    pub fn set_book_state(
        &mut self,
        state: SlotState,
        size: u64,
        order_id: Option<String>,
        side: Side,
    ) {
        if state.is_on_book() && (order_id.is_none() || size == 0) {
            warn!(
                "{}: attempted phantom ({:?} size={} id={:?}); coercing to virtual",
                self.id, state, size, order_id
            );
            self.state = SlotState::Virtual;
            self.size = 0;
            self.order_id = None;
            self.committed_side = None;
            return;
        }
        self.state = state;
        self.size = size;
        self.order_id = order_id;
        self.committed_side = if size > 0 || state.is_on_book() {
            Some(side)
        } else {
            None
        };
    }

    /// Allocate size to a slot that stays off-book (a planned placement).
    pub fn set_virtual_size(&mut self, size: u64, side: Side) {
        self.state = SlotState::Virtual;
        self.size = size;
        self.order_id = None;
        self.committed_side = if size > 0 { Some(side) } else { None };
    }

    /// Reset to the empty Spread placeholder, releasing any commitment.
    pub fn reset_to_spread(&mut self) {
        self.role = SlotRole::Spread;
        self.state = SlotState::Virtual;
        self.size = 0;
        self.order_id = None;
        self.committed_side = None;
    }

    /// Clear book presence but keep the slot's role.
    pub fn clear_to_virtual(&mut self) {
        self.state = SlotState::Virtual;
        self.size = 0;
        self.order_id = None;
        self.committed_side = None;
    }
}

/// A fill reported by the exchange, already resolved against the pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// On-book id of the order that was (partially) consumed.
    pub order_id: String,
    /// Side of the bot's resting order.
    pub side: Side,
    /// Filled amount in units of the asset sold by `side`.
    pub size: u64,
    /// Execution price, quote per base.
    pub price: f64,
    pub is_partial: bool,
    /// Maker unless the source explicitly flags the fill as taker.
    pub is_maker: bool,
    /// What the bot gave up.
    pub pays: AssetAmount,
    /// What the bot gained, before market fees.
    pub receives: AssetAmount,
}

/// A single executable step of an action plan.
///
/// A rotation is one atomic `Move` carrying both the released and the
/// acquired slot, never a cancel/create pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanAction {
    Create {
        slot: SlotId,
        side: Side,
        price: f64,
        size: u64,
    },
    Cancel {
        slot: SlotId,
        order_id: String,
    },
    Move {
        from: SlotId,
        to: SlotId,
        order_id: String,
        side: Side,
        price: f64,
        size: u64,
    },
}

impl PlanAction {
    /// Slot whose book presence this action releases, if any.
    pub fn releases(&self) -> Option<SlotId> {
        match self {
            PlanAction::Create { .. } => None,
            PlanAction::Cancel { slot, .. } => Some(*slot),
            PlanAction::Move { from, .. } => Some(*from),
        }
    }

    /// Slot this action installs an order into, if any.
    pub fn installs(&self) -> Option<SlotId> {
        match self {
            PlanAction::Create { slot, .. } => Some(*slot),
            PlanAction::Cancel { .. } => None,
            PlanAction::Move { to, .. } => Some(*to),
        }
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanAction::Create {
                slot,
                side,
                price,
                size,
            } => write!(f, "create {side} {slot} px={price} sz={size}"),
            PlanAction::Cancel { slot, order_id } => {
                write!(f, "cancel {slot} oid={order_id}")
            }
            PlanAction::Move {
                from,
                to,
                order_id,
                side,
                price,
                size,
            } => write!(
                f,
                "move {side} {from}->{to} oid={order_id} px={price} sz={size}"
            ),
        }
    }
}

/// Output of one strategy cycle: the actions to execute against the master
/// grid version they were planned from.
#[derive(Debug, Clone, Default)]
pub struct ActionPlan {
    pub base_version: u64,
    pub actions: Vec<PlanAction>,
}

impl ActionPlan {
    pub fn empty(base_version: u64) -> Self {
        Self {
            base_version,
            actions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phantom_coercion_on_missing_id() {
        let mut slot = GridSlot::new(SlotId(3), 1.5);
        slot.set_book_state(SlotState::Active, 100, None, Side::Buy);
        assert_eq!(slot.state, SlotState::Virtual);
        assert_eq!(slot.size, 0);
        assert!(slot.order_id.is_none());
        assert!(slot.committed_side.is_none());
    }

    #[test]
    fn test_phantom_coercion_on_zero_size() {
        let mut slot = GridSlot::new(SlotId(3), 1.5);
        slot.set_book_state(SlotState::Partial, 0, Some("o-1".into()), Side::Sell);
        assert_eq!(slot.state, SlotState::Virtual);
        assert!(!slot.is_phantom());
    }

    #[test]
    fn test_valid_book_state_sticks() {
        let mut slot = GridSlot::new(SlotId(0), 2.0);
        slot.set_book_state(SlotState::Active, 500, Some("o-9".into()), Side::Sell);
        assert_eq!(slot.state, SlotState::Active);
        assert_eq!(slot.committed_side, Some(Side::Sell));
        assert!(slot.is_on_book());
        assert!(!slot.is_phantom());
    }

    #[test]
    fn test_reset_releases_commitment() {
        let mut slot = GridSlot::new(SlotId(0), 2.0);
        slot.set_book_state(SlotState::Active, 500, Some("o-9".into()), Side::Sell);
        slot.reset_to_spread();
        assert_eq!(slot.role, SlotRole::Spread);
        assert_eq!(slot.state, SlotState::Virtual);
        assert_eq!(slot.size, 0);
        assert!(slot.committed_side.is_none());
    }

    #[test]
    fn test_action_release_install() {
        let mv = PlanAction::Move {
            from: SlotId(1),
            to: SlotId(4),
            order_id: "o".into(),
            side: Side::Sell,
            price: 1.0,
            size: 10,
        };
        assert_eq!(mv.releases(), Some(SlotId(1)));
        assert_eq!(mv.installs(), Some(SlotId(4)));
    }
}
