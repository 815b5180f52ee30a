//! Ladder geometry, the boundary pivot, and role assignment.

use log::{debug, info};

use crate::consts::{MIN_SPREAD_FACTOR, MIN_SPREAD_ORDERS};
use crate::errors::{EngineError, EngineResult};
use crate::units::Side;

use super::types::{GridSlot, SlotId, SlotRole, SlotState};

/// Runaway guard for degenerate increment / range combinations.
const MAX_SLOTS: usize = 5_000;

/// Immutable ladder parameters, validated at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    /// Ladder center; the spread gap straddles this price.
    pub start_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    /// Geometric step between rungs, in percent.
    pub increment_percent: f64,
    /// Desired physical spread, in percent; floored at
    /// `increment_percent * MIN_SPREAD_FACTOR`.
    pub target_spread_percent: f64,
}

impl GridGeometry {
    /// Multiplicative step factor between adjacent rungs.
    pub fn step(&self) -> f64 {
        1.0 + self.increment_percent / 100.0
    }

    /// Effective target spread after the increment floor.
    pub fn effective_spread(&self) -> f64 {
        self.target_spread_percent
            .max(self.increment_percent * MIN_SPREAD_FACTOR)
    }

    /// Width of the spread gap in slots.
    ///
    /// Guarantees the physical spread between the innermost BUY and SELL is
    /// at least the effective target spread.
    pub fn gap_slots(&self) -> usize {
        let spread = self.effective_spread();
        let needed = ((1.0 + spread / 100.0).ln() / self.step().ln()).ceil() as usize;
        needed.max(MIN_SPREAD_ORDERS)
    }

    /// Fatal-at-startup validation.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.start_price.is_finite() || self.start_price <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "start_price must be finite and positive, got {}",
                self.start_price
            )));
        }
        if self.min_price >= self.max_price {
            return Err(EngineError::InvalidConfig(format!(
                "min_price {} must be below max_price {}",
                self.min_price, self.max_price
            )));
        }
        if self.min_price <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "min_price must be positive".into(),
            ));
        }
        if self.start_price < self.min_price || self.start_price > self.max_price {
            return Err(EngineError::InvalidConfig(format!(
                "start_price {} outside [{}, {}]",
                self.start_price, self.min_price, self.max_price
            )));
        }
        if self.increment_percent <= 0.0 || self.increment_percent >= 100.0 {
            return Err(EngineError::InvalidConfig(format!(
                "increment_percent must be in (0, 100), got {}",
                self.increment_percent
            )));
        }
        Ok(())
    }
}

/// The master grid: an ordered ladder of slots plus the boundary pivot.
///
/// Slot prices and ids are fixed for the session. `version` advances on every
/// committed mutation and is what the commit gate compares plans against.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    slots: Vec<GridSlot>,
    pub boundary: usize,
    pub gap: usize,
    pub version: u64,
}

impl Grid {
    /// Build the ladder covering `[min_price, max_price]`.
    ///
    /// Levels extend from `start_price * sqrt(step)` upward and
    /// `start_price / sqrt(step)` downward so that a slot gap, not a slot,
    /// sits on the start price.
    pub fn build(geometry: &GridGeometry) -> EngineResult<Self> {
        geometry.validate()?;

        let step = geometry.step();
        let half_step = step.sqrt();

        let mut levels = Vec::new();
        let mut price = geometry.start_price * half_step;
        while price <= geometry.max_price {
            levels.push(price);
            price *= step;
            if levels.len() > MAX_SLOTS {
                return Err(EngineError::GridConstruction(format!(
                    "more than {MAX_SLOTS} slots; widen increment_percent or narrow the range"
                )));
            }
        }
        let first_upper = levels.len();

        price = geometry.start_price / half_step;
        while price >= geometry.min_price {
            levels.push(price);
            price /= step;
            if levels.len() > MAX_SLOTS {
                return Err(EngineError::GridConstruction(format!(
                    "more than {MAX_SLOTS} slots; widen increment_percent or narrow the range"
                )));
            }
        }

        if levels.len() < 2 {
            return Err(EngineError::GridConstruction(
                "price range too narrow for even two slots".into(),
            ));
        }

        levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let slots: Vec<GridSlot> = levels
            .iter()
            .enumerate()
            .map(|(i, &p)| GridSlot::new(SlotId(i as u32), p))
            .collect();

        let gap = geometry.gap_slots();

        // First level at or above start_price: everything below it came from
        // the downward sweep.
        let first_at_or_above = slots.len() - first_upper;
        let boundary = first_at_or_above
            .saturating_sub(gap / 2)
            .saturating_sub(1)
            .min(slots.len() - 1);

        let mut grid = Self {
            slots,
            boundary,
            gap,
            version: 0,
        };
        grid.assign_roles();

        info!(
            "grid built: {} slots [{:.8} .. {:.8}], gap={}, boundary={}",
            grid.slots.len(),
            grid.slots[0].price,
            grid.slots[grid.slots.len() - 1].price,
            gap,
            boundary
        );

        Ok(grid)
    }

    /// Rebuild a grid from previously persisted slots.
    pub fn from_parts(slots: Vec<GridSlot>, boundary: usize, gap: usize) -> EngineResult<Self> {
        if slots.is_empty() {
            return Err(EngineError::GridConstruction("no slots".into()));
        }
        let boundary = boundary.min(slots.len() - 1);
        Ok(Self {
            slots,
            boundary,
            gap,
            version: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[GridSlot] {
        &self.slots
    }

    pub fn slot(&self, id: SlotId) -> EngineResult<&GridSlot> {
        self.slots
            .get(id.index())
            .ok_or_else(|| EngineError::SlotNotFound(id.to_string()))
    }

    pub(crate) fn slot_mut(&mut self, id: SlotId) -> EngineResult<&mut GridSlot> {
        self.slots
            .get_mut(id.index())
            .ok_or_else(|| EngineError::SlotNotFound(id.to_string()))
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [GridSlot] {
        &mut self.slots
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Replace the slot set wholesale (commit path); bumps the version.
    pub(crate) fn install(&mut self, slots: Vec<GridSlot>, boundary: usize) {
        debug_assert_eq!(slots.len(), self.slots.len());
        self.slots = slots;
        self.boundary = boundary.min(self.slots.len() - 1);
        self.bump_version();
    }

    /// Target role of a slot index under the current boundary and gap.
    pub fn role_for_index(&self, index: usize) -> SlotRole {
        if index <= self.boundary {
            SlotRole::Buy
        } else if index <= self.boundary + self.gap {
            SlotRole::Spread
        } else {
            SlotRole::Sell
        }
    }

    /// Shift the boundary by one step per full fill, clamped to the ladder.
    ///
    /// A SELL fill moves the ladder up (+1); a BUY fill moves it down (-1).
    pub fn shift_boundary(&mut self, delta: i64) {
        let max = self.slots.len() as i64 - 1;
        let shifted = (self.boundary as i64 + delta).clamp(0, max);
        if shifted as usize != self.boundary {
            debug!("boundary {} -> {}", self.boundary, shifted);
            self.boundary = shifted as usize;
        }
    }

    /// Re-derive slot roles from the boundary.
    ///
    /// Slots that should become Spread but still hold an on-book order are
    /// left on their current role; the strategy plans a cancel before the
    /// role flips. Returns the ids of those deferred conversions.
    pub fn assign_roles(&mut self) -> Vec<SlotId> {
        let mut deferred = Vec::new();
        for index in 0..self.slots.len() {
            let target = self.role_for_index(index);
            let slot = &mut self.slots[index];
            match target {
                SlotRole::Spread => {
                    if slot.is_on_book() {
                        deferred.push(slot.id);
                    } else {
                        slot.reset_to_spread();
                    }
                }
                role => {
                    slot.role = role;
                    // Ex-spread placeholders keep their empty state; sized
                    // slots keep their sticky committed side.
                    if slot.state == SlotState::Virtual
                        && slot.size == 0
                        && slot.committed_side.is_none()
                    {
                        slot.order_id = None;
                    }
                }
            }
        }
        deferred
    }

    /// In-target slot indices for a side, market-closest first.
    ///
    /// BUY walks down from the boundary; SELL walks up from the far edge of
    /// the gap. `target` is the configured active-order count for the side.
    pub fn target_window(&self, side: Side, target: usize) -> Vec<usize> {
        let mut window = Vec::with_capacity(target);
        match side {
            Side::Buy => {
                let mut i = self.boundary as i64;
                while i >= 0 && window.len() < target {
                    window.push(i as usize);
                    i -= 1;
                }
            }
            Side::Sell => {
                let mut i = self.boundary + self.gap + 1;
                while i < self.slots.len() && window.len() < target {
                    window.push(i);
                    i += 1;
                }
            }
        }
        window
    }

    /// Sum of on-book sizes committed to a side.
    pub fn committed_on_book(&self, side: Side) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.is_on_book() && s.committed_side == Some(side))
            .map(|s| s.size)
            .sum()
    }

    /// Count of on-book orders committed to a side.
    pub fn on_book_count(&self, side: Side) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_on_book() && s.committed_side == Some(side))
            .count()
    }

    /// Debug-time structural invariant check (P1..P3).
    pub fn check_invariants(&self) -> EngineResult<()> {
        for slot in &self.slots {
            if slot.is_phantom() {
                return Err(EngineError::InvalidState(format!(
                    "{} is a phantom: {:?} without id/size",
                    slot.id, slot.state
                )));
            }
            if slot.role == SlotRole::Spread
                && (slot.state != SlotState::Virtual || slot.size != 0)
            {
                return Err(EngineError::InvalidState(format!(
                    "{} is SPREAD but not empty",
                    slot.id
                )));
            }
        }
        for (index, slot) in self.slots.iter().enumerate() {
            let target = self.role_for_index(index);
            // An empty Spread placeholder may sit anywhere until the next
            // role pass; a trade role on the wrong side of the gap may not.
            let contradictory = matches!(
                (slot.role, target),
                (SlotRole::Buy, SlotRole::Sell) | (SlotRole::Sell, SlotRole::Buy)
            );
            if contradictory && !slot.is_on_book() {
                return Err(EngineError::InvalidState(format!(
                    "{} role {:?} diverges from target {:?}",
                    slot.id, slot.role, target
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> GridGeometry {
        GridGeometry {
            start_price: 0.02,
            min_price: 0.01,
            max_price: 0.04,
            increment_percent: 1.0,
            target_spread_percent: 2.0,
        }
    }

    #[test]
    fn test_validation_rejects_bad_inputs() {
        let mut g = geometry();
        g.increment_percent = 0.0;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.start_price = 0.5;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.min_price = 0.05;
        assert!(g.validate().is_err());

        let mut g = geometry();
        g.start_price = f64::NAN;
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_gap_meets_target_spread() {
        let g = geometry();
        let gap = g.gap_slots();
        assert!(gap >= MIN_SPREAD_ORDERS);
        // Crossing `gap` rungs must span at least the effective spread.
        let spanned = g.step().powi(gap as i32);
        assert!(spanned >= 1.0 + g.effective_spread() / 100.0);
    }

    #[test]
    fn test_spread_floor_applies() {
        let mut g = geometry();
        g.target_spread_percent = 0.5; // below increment * MIN_SPREAD_FACTOR
        assert!((g.effective_spread() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ladder_is_sorted_and_in_range() {
        let grid = Grid::build(&geometry()).unwrap();
        let slots = grid.slots();
        assert!(slots.len() > 10);
        for pair in slots.windows(2) {
            assert!(pair[0].price < pair[1].price);
        }
        assert!(slots[0].price >= geometry().min_price);
        assert!(slots[slots.len() - 1].price <= geometry().max_price);
        // sqrt-offset: no slot sits on the start price
        for slot in slots {
            assert!((slot.price - 0.02).abs() > 1e-9);
        }
    }

    #[test]
    fn test_gap_straddles_start_price() {
        let grid = Grid::build(&geometry()).unwrap();
        let below = grid.slot(SlotId(grid.boundary as u32)).unwrap();
        let first_sell = grid
            .slot(SlotId((grid.boundary + grid.gap + 1) as u32))
            .unwrap();
        assert!(below.price < 0.02);
        assert!(first_sell.price > 0.02);
    }

    #[test]
    fn test_role_partitioning() {
        let grid = Grid::build(&geometry()).unwrap();
        for (i, slot) in grid.slots().iter().enumerate() {
            if i <= grid.boundary {
                assert_eq!(slot.role, SlotRole::Buy);
            } else if i <= grid.boundary + grid.gap {
                assert_eq!(slot.role, SlotRole::Spread);
                assert_eq!(slot.state, SlotState::Virtual);
                assert_eq!(slot.size, 0);
            } else {
                assert_eq!(slot.role, SlotRole::Sell);
            }
        }
        grid.check_invariants().unwrap();
    }

    #[test]
    fn test_boundary_clamps_at_edges() {
        let mut grid = Grid::build(&geometry()).unwrap();
        for _ in 0..10_000 {
            grid.shift_boundary(-1);
        }
        assert_eq!(grid.boundary, 0);
        for _ in 0..10_000 {
            grid.shift_boundary(1);
        }
        assert_eq!(grid.boundary, grid.len() - 1);
    }

    #[test]
    fn test_spread_conversion_deferred_for_on_book() {
        let mut grid = Grid::build(&geometry()).unwrap();
        // Put an order on the innermost buy slot, then shift the boundary
        // down so the slot falls into the gap.
        let id = SlotId(grid.boundary as u32);
        grid.slot_mut(id)
            .unwrap()
            .set_book_state(SlotState::Active, 1_000, Some("o-1".into()), Side::Buy);
        grid.shift_boundary(-1);
        let deferred = grid.assign_roles();
        assert_eq!(deferred, vec![id]);
        let slot = grid.slot(id).unwrap();
        assert!(slot.is_on_book());
        assert_ne!(slot.role, SlotRole::Spread);
    }

    #[test]
    fn test_target_window_ordering() {
        let grid = Grid::build(&geometry()).unwrap();
        let buys = grid.target_window(Side::Buy, 3);
        assert_eq!(buys[0], grid.boundary);
        assert!(buys.windows(2).all(|w| w[0] > w[1]));
        let sells = grid.target_window(Side::Sell, 3);
        assert_eq!(sells[0], grid.boundary + grid.gap + 1);
        assert!(sells.windows(2).all(|w| w[0] < w[1]));
    }
}
