//! Boundary-crawl strategy: converts fills into place/update/cancel actions.
//!
//! The strategy is pure planning. It mutates only the working grid it is
//! handed (boundary shift and role reassignment) and emits an [`ActionPlan`];
//! the commit pipeline decides whether the plan ever touches the master.

use std::collections::HashSet;

use log::debug;

use crate::consts::DUST_THRESHOLD_PCT;
use crate::units::{Side, SideMap};

use super::accountant::Accountant;
use super::model::Grid;
use super::types::{ActionPlan, Fill, PlanAction, SlotState};

/// Per-session strategy parameters.
#[derive(Debug, Clone)]
pub struct CrawlStrategy {
    /// Target count of on-book orders per side.
    pub active_orders: SideMap<usize>,
    /// Geometric size-taper exponent per side, in `[0, 1]`.
    pub weight: SideMap<f64>,
    /// Ladder increment, used as the taper base.
    pub increment_percent: f64,
}

/// One side's classification pass, kept for the emit phase.
struct SideView {
    window: Vec<usize>,
    ideals: Vec<u64>,
    /// In-window on-book slots below the dust threshold (Partial or Active).
    dust_residents: Vec<usize>,
    /// In-window partials at or above the dust threshold.
    healthy_partials: Vec<usize>,
    /// In-window slots with no on-book order, closest to market first.
    shortages: Vec<usize>,
    /// On-book slots outside the window, rotation candidates.
    surpluses: Vec<usize>,
    has_dust_partial: bool,
}

impl CrawlStrategy {
    /// Ideal size per in-window slot: a normalized geometric weight of the
    /// side's whole budget, rounded through integer units so every ideal is
    /// exactly representable.
    fn ideal_sizes(&self, window: &[usize], side: Side, budget: u64) -> Vec<u64> {
        if window.is_empty() || budget == 0 {
            return vec![0; window.len()];
        }
        let base = 1.0 - self.increment_percent / 100.0;
        let w = self.weight[side].clamp(0.0, 1.0);
        let weights: Vec<f64> = (0..window.len())
            .map(|k| base.powf(k as f64 * w))
            .collect();
        let sum: f64 = weights.iter().sum();
        weights
            .iter()
            .map(|wk| ((budget as f64) * wk / sum).round() as u64)
            .collect()
    }

    fn dust_floor(ideal: u64) -> u64 {
        ((ideal as f64) * DUST_THRESHOLD_PCT / 100.0).round() as u64
    }

    /// Classify one side of the working grid against its ideal ladder.
    fn survey(&self, work: &Grid, funds: &Accountant, side: Side) -> SideView {
        let window = work.target_window(side, self.active_orders[side]);
        let ideals = self.ideal_sizes(&window, side, funds.total_budget(side));
        let in_window: HashSet<usize> = window.iter().copied().collect();

        let mut dust_residents = Vec::new();
        let mut healthy_partials = Vec::new();
        let mut shortages = Vec::new();
        let mut has_dust_partial = false;

        for (pos, &index) in window.iter().enumerate() {
            let slot = &work.slots()[index];
            let committed_here = slot.is_on_book() && slot.committed_side == Some(side);
            if !committed_here {
                shortages.push(index);
                continue;
            }
            if slot.size < Self::dust_floor(ideals[pos]) {
                dust_residents.push(index);
                if slot.state == SlotState::Partial {
                    has_dust_partial = true;
                }
            } else if slot.state == SlotState::Partial {
                healthy_partials.push(index);
            }
            // At or above dust and Active: healthy, left alone.
        }

        // Every on-book order committed to this side that sits outside the
        // window is surplus, including deferred spread conversions.
        let mut surpluses: Vec<usize> = work
            .slots()
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                s.is_on_book() && s.committed_side == Some(side) && !in_window.contains(i)
            })
            .map(|(i, _)| i)
            .collect();

        // Partial before Active, then market-farthest first.
        surpluses.sort_by_key(|&i| {
            let slot = &work.slots()[i];
            let partial_rank = if slot.state == SlotState::Partial { 0 } else { 1 };
            let distance_rank = match side {
                Side::Buy => i as i64,                       // lowest price = farthest
                Side::Sell => -(i as i64),                   // highest price = farthest
            };
            (partial_rank, distance_rank)
        });

        SideView {
            window,
            ideals,
            dust_residents,
            healthy_partials,
            shortages,
            surpluses,
            has_dust_partial,
        }
    }

    fn ideal_at(view: &SideView, index: usize) -> u64 {
        view.window
            .iter()
            .position(|&i| i == index)
            .map(|pos| view.ideals[pos])
            .unwrap_or(0)
    }

    /// Adjacent slot one step closer to the market.
    fn inner_neighbor(work: &Grid, side: Side, index: usize) -> Option<usize> {
        match side {
            Side::Buy => {
                let next = index + 1;
                (next <= work.boundary).then_some(next)
            }
            Side::Sell => {
                let first_sell = work.boundary + work.gap + 1;
                (index > first_sell).then_some(index - 1)
            }
        }
    }

    /// Emit one side's actions, spending the side's reaction budget.
    fn emit_side(
        &self,
        work: &Grid,
        funds: &Accountant,
        side: Side,
        view: &SideView,
        cap: usize,
        actions: &mut Vec<PlanAction>,
    ) {
        let mut handled: HashSet<usize> = HashSet::new();
        let slots = work.slots();

        // Partial handling before rotation. Dust residents are merged back
        // to full size in place; healthy partials are rebased to ideal with
        // the residual pushed one slot inward.
        for &index in &view.dust_residents {
            let slot = &slots[index];
            let Some(order_id) = slot.order_id.clone() else {
                continue;
            };
            let ideal = Self::ideal_at(view, index);
            actions.push(PlanAction::Move {
                from: slot.id,
                to: slot.id,
                order_id,
                side,
                price: slot.price,
                size: ideal + slot.size,
            });
            handled.insert(index);
        }

        for &index in &view.healthy_partials {
            let slot = &slots[index];
            let Some(order_id) = slot.order_id.clone() else {
                continue;
            };
            let ideal = Self::ideal_at(view, index);
            let residual = slot.size;
            actions.push(PlanAction::Move {
                from: slot.id,
                to: slot.id,
                order_id,
                side,
                price: slot.price,
                size: ideal,
            });
            if let Some(inner) = Self::inner_neighbor(work, side, index) {
                let neighbor = &slots[inner];
                if neighbor.state == SlotState::Virtual && neighbor.order_id.is_none() {
                    actions.push(PlanAction::Create {
                        slot: neighbor.id,
                        side,
                        price: neighbor.price,
                        size: residual,
                    });
                    handled.insert(inner);
                } else {
                    debug!(
                        "{}: residual target {} not virtual; skipping to avoid capital leak",
                        slot.id, neighbor.id
                    );
                }
            }
            handled.insert(index);
        }

        let mut budget = cap;

        // Rotation: pair market-closest shortages with market-farthest
        // surpluses; each pair is one atomic on-wire move.
        let mut surplus_iter = view
            .surpluses
            .iter()
            .filter(|i| !handled.contains(i))
            .copied()
            .collect::<Vec<_>>()
            .into_iter();
        let mut unfilled_shortages = Vec::new();
        for &shortage in &view.shortages {
            if handled.contains(&shortage) {
                continue;
            }
            if budget == 0 {
                unfilled_shortages.push(shortage);
                continue;
            }
            match surplus_iter.next() {
                Some(surplus) => {
                    let from = &slots[surplus];
                    let to = &slots[shortage];
                    let Some(order_id) = from.order_id.clone() else {
                        continue;
                    };
                    actions.push(PlanAction::Move {
                        from: from.id,
                        to: to.id,
                        order_id,
                        side,
                        price: to.price,
                        size: Self::ideal_at(view, shortage),
                    });
                    handled.insert(surplus);
                    handled.insert(shortage);
                    budget -= 1;
                }
                None => unfilled_shortages.push(shortage),
            }
        }

        // Placement: remaining shortages, farthest from market first, capped
        // by an equal share of the liquid pool. Virtual allocations already
        // held by the slot do not draw from the pool; only the increase does.
        let mut pool = funds.available_pool(side);
        let mut remaining = unfilled_shortages.clone();
        remaining.reverse();
        let mut left = remaining.len();
        for index in remaining {
            if budget == 0 {
                break;
            }
            let slot = &slots[index];
            let ideal = Self::ideal_at(view, index);
            let share = if left > 0 { pool / left as u64 } else { 0 };
            left = left.saturating_sub(1);
            let increase = ideal.saturating_sub(slot.size).min(share);
            let size = slot.size + increase;
            if size == 0 {
                continue;
            }
            pool -= increase;
            actions.push(PlanAction::Create {
                slot: slot.id,
                side,
                price: slot.price,
                size,
            });
            budget -= 1;
        }

        // Cancellation: surplus not consumed by rotation.
        for surplus in surplus_iter {
            if handled.contains(&surplus) {
                continue;
            }
            let slot = &slots[surplus];
            if let Some(order_id) = slot.order_id.clone() {
                actions.push(PlanAction::Cancel {
                    slot: slot.id,
                    order_id,
                });
            }
        }
    }

    /// Produce the cycle's action plan.
    ///
    /// `work` is the working grid (a clone of the master); fills are the
    /// exchange-ordered batch observed since the last cycle.
    pub fn plan_cycle(&self, work: &mut Grid, funds: &Accountant, fills: &[Fill]) -> ActionPlan {
        let base_version = work.version;

        let full_fills: Vec<&Fill> = fills.iter().filter(|f| !f.is_partial).collect();
        for fill in &full_fills {
            work.shift_boundary(match fill.side {
                Side::Sell => 1,
                Side::Buy => -1,
            });
        }
        work.assign_roles();

        let buy_view = self.survey(work, funds, Side::Buy);
        let sell_view = self.survey(work, funds, Side::Sell);

        // No fills and no simultaneous two-sided dust: nothing to react to.
        if full_fills.is_empty() && !(buy_view.has_dust_partial && sell_view.has_dust_partial) {
            return ActionPlan::empty(base_version);
        }

        // Each full fill buys one atomic restructuring unit per side; a
        // dust-triggered cycle gets a floor of one.
        let cap = full_fills.len().max(1);

        let mut actions = Vec::new();
        self.emit_side(work, funds, Side::Buy, &buy_view, cap, &mut actions);
        self.emit_side(work, funds, Side::Sell, &sell_view, cap, &mut actions);

        debug!(
            "cycle planned: {} full fills, cap {}, {} actions",
            full_fills.len(),
            cap,
            actions.len()
        );

        ActionPlan {
            base_version,
            actions,
        }
    }

    /// Plan an uncapped rebalance toward the target ladder.
    ///
    /// Used by startup reconciliation and post-recovery consolidation,
    /// where the reaction cap does not apply.
    pub fn plan_full(&self, work: &mut Grid, funds: &Accountant) -> ActionPlan {
        let base_version = work.version;
        work.assign_roles();
        let buy_view = self.survey(work, funds, Side::Buy);
        let sell_view = self.survey(work, funds, Side::Sell);
        let mut actions = Vec::new();
        self.emit_side(work, funds, Side::Buy, &buy_view, usize::MAX, &mut actions);
        self.emit_side(work, funds, Side::Sell, &sell_view, usize::MAX, &mut actions);
        ActionPlan {
            base_version,
            actions,
        }
    }

    /// Whether both sides show dust partials (the consolidation trigger).
    pub fn dual_dust(&self, grid: &Grid, funds: &Accountant) -> bool {
        self.survey(grid, funds, Side::Buy).has_dust_partial
            && self.survey(grid, funds, Side::Sell).has_dust_partial
    }
}
