//! Startup reconciliation against authoritative open orders, and the
//! serialized recovery state machine.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::consts::{RECOVERY_COOLDOWN_MS, RECOVERY_DECAY_WINDOW_MS, RECOVERY_MAX_ATTEMPTS};
use crate::exchange::OpenOrder;
use crate::units::{within_tolerance, Pair, Side};

use super::accountant::Accountant;
use super::model::Grid;
use super::strategy::CrawlStrategy;
use super::types::{ActionPlan, PlanAction, SlotState};

/// Outcome of matching persisted slots against the chain's open orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Slots whose order was found on chain and refreshed.
    pub matched: u32,
    /// Slots whose order was gone; reset to virtual.
    pub orphaned: u32,
    /// Slots adopted by (side, price, size) matching.
    pub adopted: u32,
    /// Phantoms corrected during the pass.
    pub phantoms: u32,
    /// Chain orders that belong to no slot.
    pub unmatched_chain: Vec<String>,
}

/// Align the grid with the authoritative open-order list.
///
/// Matching is by exchange order id first; only when nothing matches at all
/// does a second pass adopt orders by side, price, and size within
/// tolerance. Phantoms are reset along the way.
pub fn sync_from_chain(grid: &mut Grid, open_orders: &[OpenOrder], pair: &Pair) -> SyncReport {
    let mut report = SyncReport::default();

    let mut claimed: Vec<bool> = vec![false; open_orders.len()];

    // Pass 1: by order id.
    for slot in grid.slots_mut() {
        if slot.is_phantom() {
            slot.clear_to_virtual();
            report.phantoms += 1;
            continue;
        }
        let Some(oid) = slot.order_id.clone() else {
            continue;
        };
        match open_orders.iter().position(|o| o.id == oid) {
            Some(pos) => {
                let order = &open_orders[pos];
                claimed[pos] = true;
                let side = order.side(pair).unwrap_or(Side::Buy);
                let state = if order.for_sale < slot.size {
                    SlotState::Partial
                } else {
                    SlotState::Active
                };
                slot.set_book_state(state, order.for_sale, Some(oid), side);
                report.matched += 1;
            }
            None => {
                debug!("{}: order {} gone from chain; resetting", slot.id, oid);
                slot.clear_to_virtual();
                report.orphaned += 1;
            }
        }
    }

    // Pass 2: no id matched anything - adopt by (side, price, size).
    if report.matched == 0 {
        for (pos, order) in open_orders.iter().enumerate() {
            if claimed[pos] {
                continue;
            }
            let Some(side) = order.side(pair) else {
                continue;
            };
            let Some(price) = order.price(pair) else {
                continue;
            };
            let candidate = grid
                .slots()
                .iter()
                .filter(|s| {
                    !s.is_on_book()
                        && s.role.side() == Some(side)
                        && price_close(s.price, price)
                        && (s.size == 0 || within_tolerance(s.size, order.for_sale))
                })
                .map(|s| s.id)
                .next();
            if let Some(id) = candidate {
                if let Ok(slot) = grid.slot_mut(id) {
                    slot.set_book_state(
                        SlotState::Active,
                        order.for_sale,
                        Some(order.id.clone()),
                        side,
                    );
                    claimed[pos] = true;
                    report.adopted += 1;
                }
            }
        }
    }

    for (pos, order) in open_orders.iter().enumerate() {
        if !claimed[pos] && order.side(pair).is_some() {
            report.unmatched_chain.push(order.id.clone());
        }
    }

    info!(
        "sync: {} matched, {} adopted, {} orphaned, {} phantoms, {} unmatched on chain",
        report.matched,
        report.adopted,
        report.orphaned,
        report.phantoms,
        report.unmatched_chain.len()
    );
    report
}

fn price_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= a.abs() * 0.001
}

/// Plan the reconciliation toward the per-side active-order targets.
///
/// Prefers moving existing on-book orders into the desired slots, creates
/// what is missing, and cancels the worst excess. When the plan cannot be
/// funded, the single largest out-of-place order is cancelled first to
/// release maximum liquidity; creation of its replacement happens on the
/// next pass against the refreshed balances.
pub fn plan_reconciliation(
    strategy: &CrawlStrategy,
    work: &mut Grid,
    funds: &Accountant,
) -> ActionPlan {
    let plan = strategy.plan_full(work, funds);

    // Updates enlarge on-book orders in place; the enlargement draws liquid
    // balance the way a placement does. When the liquid pool cannot cover
    // it, cancel the single largest out-of-place order instead: maximum
    // liquidity released, replacement created on the next pass.
    for side in [Side::Buy, Side::Sell] {
        let draw: u64 = plan
            .actions
            .iter()
            .filter_map(|a| match a {
                PlanAction::Move {
                    from,
                    side: s,
                    size,
                    ..
                } if *s == side => {
                    let current = work.slot(*from).map(|sl| sl.size).unwrap_or(0);
                    Some(size.saturating_sub(current))
                }
                _ => None,
            })
            .sum();
        if draw <= funds.available_pool(side) {
            continue;
        }
        warn!(
            "reconciliation underfunded on {side}: update draw {draw} vs pool {}",
            funds.available_pool(side)
        );
        let window = work.target_window(side, strategy.active_orders[side]);
        let largest = work
            .slots()
            .iter()
            .filter(|s| {
                s.is_on_book()
                    && s.committed_side == Some(side)
                    && !window.contains(&s.id.index())
            })
            .max_by_key(|s| s.size);
        if let Some(slot) = largest {
            if let Some(order_id) = slot.order_id.clone() {
                info!(
                    "cancelling largest out-of-place {side} order {order_id} to release liquidity"
                );
                return ActionPlan {
                    base_version: plan.base_version,
                    actions: vec![PlanAction::Cancel {
                        slot: slot.id,
                        order_id,
                    }],
                };
            }
        }
    }

    plan
}

/// Why a recovery attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDenied {
    /// Another attempt ran too recently.
    Cooldown,
    /// The per-cycle attempt cap is exhausted.
    Exhausted,
}

impl std::fmt::Display for RecoveryDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryDenied::Cooldown => write!(f, "recovery cooling down"),
            RecoveryDenied::Exhausted => write!(f, "recovery attempts exhausted"),
        }
    }
}

/// Serialized recovery bookkeeping: one attempt in flight, cooldown between
/// attempts, a hard cap, and counter decay after a quiescent window.
#[derive(Debug)]
pub struct RecoveryState {
    attempts: u32,
    last_attempt: Option<Instant>,
    /// Lifetime attempts, for the state summary.
    pub total_attempts: u64,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            last_attempt: None,
            total_attempts: 0,
        }
    }

    /// Try to reserve the right to run one recovery attempt now.
    pub fn try_begin(&mut self, now: Instant) -> Result<(), RecoveryDenied> {
        if let Some(last) = self.last_attempt {
            let elapsed = now.duration_since(last);
            if elapsed >= Duration::from_millis(RECOVERY_DECAY_WINDOW_MS) {
                // Quiescent long enough; the counter resets.
                self.attempts = 0;
            } else if elapsed < Duration::from_millis(RECOVERY_COOLDOWN_MS) {
                return Err(RecoveryDenied::Cooldown);
            }
        }
        if self.attempts >= RECOVERY_MAX_ATTEMPTS {
            return Err(RecoveryDenied::Exhausted);
        }
        self.attempts += 1;
        self.total_attempts += 1;
        self.last_attempt = Some(now);
        Ok(())
    }

    /// A clean cycle resets the attempt counter immediately.
    pub fn mark_recovered(&mut self) {
        self.attempts = 0;
    }
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::model::GridGeometry;
    use crate::grid::types::SlotId;
    use crate::units::{Asset, SideMap};

    fn pair() -> Pair {
        Pair::new(
            Asset::new("1.3.1", "COIN", 5),
            Asset::new("1.3.0", "BTS", 5),
        )
    }

    fn grid() -> Grid {
        Grid::build(&GridGeometry {
            start_price: 0.02,
            min_price: 0.01,
            max_price: 0.04,
            increment_percent: 1.0,
            target_spread_percent: 2.0,
        })
        .unwrap()
    }

    fn sell_order(id: &str, base_units: u64, price: f64) -> OpenOrder {
        OpenOrder {
            id: id.into(),
            for_sale: base_units,
            sell_asset_id: "1.3.1".into(),
            receive_asset_id: "1.3.0".into(),
            sell_amount: base_units,
            receive_amount: (base_units as f64 * price).round() as u64,
        }
    }

    #[test]
    fn test_sync_matches_by_id_and_detects_partial() {
        let mut g = grid();
        let index = g.boundary + g.gap + 1;
        let id = g.slots()[index].id;
        g.slot_mut(id)
            .unwrap()
            .set_book_state(SlotState::Active, 1_000, Some("1.7.1".into()), Side::Sell);

        let orders = vec![sell_order("1.7.1", 400, g.slots()[index].price)];
        let report = sync_from_chain(&mut g, &orders, &pair());

        assert_eq!(report.matched, 1);
        let slot = g.slot(id).unwrap();
        assert_eq!(slot.state, SlotState::Partial);
        assert_eq!(slot.size, 400);
    }

    #[test]
    fn test_sync_resets_orphans() {
        let mut g = grid();
        let index = g.boundary;
        let id = g.slots()[index].id;
        g.slot_mut(id)
            .unwrap()
            .set_book_state(SlotState::Active, 1_000, Some("1.7.9".into()), Side::Buy);

        let report = sync_from_chain(&mut g, &[], &pair());
        assert_eq!(report.orphaned, 1);
        assert_eq!(g.slot(id).unwrap().state, SlotState::Virtual);
    }

    #[test]
    fn test_sync_adopts_by_price_when_no_id_matches() {
        let mut g = grid();
        let index = g.boundary + g.gap + 1;
        let price = g.slots()[index].price;

        let orders = vec![sell_order("1.7.55", 1_000, price)];
        let report = sync_from_chain(&mut g, &orders, &pair());

        assert_eq!(report.matched, 0);
        assert_eq!(report.adopted, 1);
        let slot = &g.slots()[index];
        assert_eq!(slot.order_id.as_deref(), Some("1.7.55"));
        assert_eq!(slot.state, SlotState::Active);
    }

    #[test]
    fn test_sync_reports_unmatched_chain_orders() {
        let mut g = grid();
        // Price far off any rung within tolerance... use a price between rungs.
        let orders = vec![sell_order("1.7.77", 1_000, 0.9)];
        let report = sync_from_chain(&mut g, &orders, &pair());
        assert_eq!(report.unmatched_chain, vec!["1.7.77".to_string()]);
    }

    #[test]
    fn test_reconciliation_places_cold_start_orders() {
        let mut g = grid();
        let strategy = CrawlStrategy {
            active_orders: SideMap::new(3, 3),
            weight: SideMap::new(0.5, 0.5),
            increment_percent: 1.0,
        };
        let mut funds = Accountant::new(None, 0);
        funds.apply_balances(
            SideMap::new(100_000_000, 5_000_000_000),
            SideMap::new(100_000_000, 5_000_000_000),
        );
        funds.recalculate(&mut g);

        let plan = plan_reconciliation(&strategy, &mut g, &funds);
        let creates = plan
            .actions
            .iter()
            .filter(|a| matches!(a, PlanAction::Create { .. }))
            .count();
        assert!(creates > 0 && creates <= 6);
        assert!(!plan
            .actions
            .iter()
            .any(|a| matches!(a, PlanAction::Cancel { .. })));
    }

    #[test]
    fn test_reconciliation_cancels_largest_when_underfunded() {
        let mut g = grid();
        let strategy = CrawlStrategy {
            active_orders: SideMap::new(1, 1),
            weight: SideMap::new(0.5, 0.5),
            increment_percent: 1.0,
        };

        // One stray sell order far from the window. Owed native fees pin the
        // liquid pool near zero, so the rotation's enlargement to ideal size
        // cannot be funded by a simple update.
        let stray_index = g.len() - 1;
        let stray = g.slots()[stray_index].id;
        g.slot_mut(stray).unwrap().set_book_state(
            SlotState::Active,
            50_000,
            Some("1.7.40".into()),
            Side::Sell,
        );

        let mut funds = Accountant::new(Some(Side::Sell), 0);
        funds.apply_balances(
            SideMap::new(0, 100_000),
            SideMap::new(0, 150_000),
        );
        funds.native_fees_owed = 99_000;
        funds.recalculate(&mut g);
        assert_eq!(funds.available_pool(Side::Sell), 1_000);

        let plan = plan_reconciliation(&strategy, &mut g, &funds);
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(
            &plan.actions[0],
            PlanAction::Cancel { slot, .. } if *slot == stray
        ));
    }

    #[test]
    fn test_recovery_cooldown_and_cap() {
        let mut state = RecoveryState::new();
        let t0 = Instant::now();
        assert!(state.try_begin(t0).is_ok());
        // Immediate retry is refused.
        assert_eq!(
            state.try_begin(t0 + Duration::from_millis(10)),
            Err(RecoveryDenied::Cooldown)
        );
        // After cooldown, attempts continue until the cap.
        let mut t = t0;
        for _ in 1..RECOVERY_MAX_ATTEMPTS {
            t += Duration::from_millis(RECOVERY_COOLDOWN_MS + 1);
            assert!(state.try_begin(t).is_ok());
        }
        t += Duration::from_millis(RECOVERY_COOLDOWN_MS + 1);
        assert_eq!(state.try_begin(t), Err(RecoveryDenied::Exhausted));
    }

    #[test]
    fn test_recovery_counter_decays_after_quiet_window() {
        let mut state = RecoveryState::new();
        let t0 = Instant::now();
        for i in 0..RECOVERY_MAX_ATTEMPTS {
            let t = t0 + Duration::from_millis(i as u64 * (RECOVERY_COOLDOWN_MS + 1));
            state.try_begin(t).unwrap();
        }
        let quiet = t0 + Duration::from_millis(10 * RECOVERY_DECAY_WINDOW_MS);
        assert!(state.try_begin(quiet).is_ok());
    }

    #[test]
    fn test_sync_marks_unknown_slot_state() {
        // A phantom in the persisted grid is corrected by sync.
        let mut g = grid();
        let id = SlotId(g.boundary as u32);
        {
            let slot = g.slot_mut(id).unwrap();
            slot.state = SlotState::Active;
            slot.size = 500;
            slot.order_id = None;
            slot.committed_side = Some(Side::Buy);
        }
        let report = sync_from_chain(&mut g, &[], &pair());
        assert_eq!(report.phantoms, 1);
        assert_eq!(g.slot(id).unwrap().state, SlotState::Virtual);
    }
}
