//! Optimistic fund tracking with drift detection.
//!
//! The ledger mirrors the exchange's balances per side (a side's funds are
//! denominated in the asset that side sells), overlays the grid's committed
//! and planned sizes, and verifies after every recalculation that the two
//! views still agree within precision tolerance.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::fees::FeeTable;
use crate::units::{tolerance_units, Pair, Side, SideMap};

use super::model::Grid;
use super::types::{Fill, SlotState};

/// One detected divergence between tracked and authoritative funds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub side: Side,
    pub description: String,
}

/// Outcome of a recalculation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecalcReport {
    /// Slots coerced to Virtual because they were on-book without an id.
    pub phantoms_coerced: u32,
    /// Whether the pass ran (false while recalculation is paused).
    pub ran: bool,
}

/// Fund state for one bot.
///
/// `chain_free` / `chain_total` are authoritative (last exchange read plus
/// optimistic fill deltas); everything else is derived by [`recalculate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Accountant {
    /// Authoritative free balance, per side's sold asset.
    pub chain_free: SideMap<u64>,
    /// Authoritative total balance, per side's sold asset.
    pub chain_total: SideMap<u64>,
    /// Sum of on-book slot sizes per side.
    pub committed_chain: SideMap<u64>,
    /// Sum of all slot sizes per side, including virtual allocations.
    pub committed_grid: SideMap<u64>,
    /// `committed_grid - committed_chain`: allocated but not yet on book.
    pub virtual_funds: SideMap<u64>,
    /// Funds free for new placements after reservations.
    pub available: SideMap<u64>,
    /// Proceeds from opposite-side fills plus rotation surplus, earmarked
    /// for refilling this side's ladder.
    pub cache_funds: SideMap<u64>,
    /// Accumulated operation fees pending settlement, in native units.
    pub native_fees_owed: u64,
    /// Side whose sold asset is the native fee asset, if either.
    pub native_side: Option<Side>,
    /// Native units held back from `available` for future operation fees.
    pub native_fee_reservation: u64,
    /// Recalculation pause depth; writes pause around multi-step commits.
    #[serde(skip)]
    paused: u32,
    /// Lifetime count of attempted-phantom corrections (auditing).
    #[serde(default)]
    pub phantom_audits: u64,
}

impl Accountant {
    pub fn new(native_side: Option<Side>, native_fee_reservation: u64) -> Self {
        Self {
            native_side,
            native_fee_reservation,
            ..Default::default()
        }
    }

    /// Overwrite the authoritative balances from an exchange read.
    pub fn apply_balances(&mut self, free: SideMap<u64>, total: SideMap<u64>) {
        self.chain_free = free;
        self.chain_total = total;
        debug!(
            "balances applied: free buy={} sell={}, total buy={} sell={}",
            free.buy, free.sell, total.buy, total.sell
        );
    }

    fn reservation_for(&self, side: Side) -> u64 {
        if self.native_side == Some(side) {
            self.native_fee_reservation
        } else {
            0
        }
    }

    /// Native fees that weigh on a side's free balance.
    fn fees_applicable(&self, side: Side) -> u64 {
        if self.native_side == Some(side) {
            self.native_fees_owed
        } else {
            0
        }
    }

    /// Pause recalculation around a multi-step transition.
    pub fn pause_recalc(&mut self) {
        self.paused += 1;
    }

    /// Resume recalculation; the caller runs a pass right after.
    pub fn resume_recalc(&mut self) {
        self.paused = self.paused.saturating_sub(1);
    }

    /// Single-source-of-truth recompute of every derived fund view.
    ///
    /// Iterates the grid once. Phantom slots (on-book state without an id)
    /// violate system sanity and are corrected in place before the pass
    /// completes. Idempotent; safe after every state mutation.
    pub fn recalculate(&mut self, grid: &mut Grid) -> RecalcReport {
        if self.paused > 0 {
            return RecalcReport {
                ran: false,
                ..Default::default()
            };
        }

        let mut report = RecalcReport {
            ran: true,
            ..Default::default()
        };
        let mut committed_chain = SideMap::<u64>::default();
        let mut committed_grid = SideMap::<u64>::default();
        let mut virtual_funds = SideMap::<u64>::default();

        for slot in grid.slots_mut() {
            if slot.is_phantom() {
                warn!("{}: phantom detected during recalc; coercing", slot.id);
                slot.clear_to_virtual();
                report.phantoms_coerced += 1;
                self.phantom_audits += 1;
                continue;
            }
            let Some(side) = slot.committed_side else {
                continue;
            };
            if slot.size == 0 {
                continue;
            }
            committed_grid[side] += slot.size;
            match slot.state {
                SlotState::Active | SlotState::Partial => committed_chain[side] += slot.size,
                SlotState::Virtual => virtual_funds[side] += slot.size,
            }
        }

        self.committed_chain = committed_chain;
        self.committed_grid = committed_grid;
        self.virtual_funds = virtual_funds;

        for side in [Side::Buy, Side::Sell] {
            let reserved = self.virtual_funds[side]
                + self.fees_applicable(side)
                + self.reservation_for(side);
            self.available[side] = self.chain_free[side].saturating_sub(reserved);
        }

        report
    }

    /// Liquid pool a side may draw for new placements.
    pub fn available_pool(&self, side: Side) -> u64 {
        self.available[side] + self.cache_funds[side]
    }

    /// Whole-side budget used for ideal-size distribution.
    pub fn total_budget(&self, side: Side) -> u64 {
        (self.chain_free[side] + self.committed_chain[side])
            .saturating_sub(self.reservation_for(side))
    }

    /// Post a fill against the ledger; returns the market fee charged on the
    /// proceeds, for the trade export.
    ///
    /// The grid-side transition (shrinking or virtualizing the slot) happens
    /// in the commit pipeline and must not re-refund the committed amount;
    /// only the balance deltas live here.
    pub fn post_fill(&mut self, fill: &Fill, pair: &Pair, fees: &FeeTable) -> u64 {
        let pays_side = fill.side;
        let recv_side = fill.side.opposite();

        // The paid funds were committed on book: authoritative free never
        // held them, so only the total drops.
        self.chain_total[pays_side] = self.chain_total[pays_side].saturating_sub(fill.pays.amount);

        let recv_asset = pair.asset_sold(recv_side);
        let market_fee = match fees.get(&recv_asset.id) {
            Some(params) => params.market_fee_on(fill.receives.amount, fill.is_maker),
            None if fees.is_native(&recv_asset.id) => {
                fees.native().market_fee_on(fill.receives.amount, fill.is_maker)
            }
            None => {
                // Graceful degradation: use raw proceeds and keep going.
                info!(
                    "no fee parameters cached for {}; using raw proceeds",
                    recv_asset.symbol
                );
                0
            }
        };
        let net_proceeds = fill.receives.amount.saturating_sub(market_fee);

        // Proceeds in the native asset are recorded raw: the maker refund
        // arrives as a separate event, never synthesized here.
        self.chain_total[recv_side] += net_proceeds;
        self.chain_free[recv_side] += net_proceeds;
        self.cache_funds[recv_side] += net_proceeds;

        // Operation fees accrue in native units per fill.
        let native = fees.native();
        self.native_fees_owed += if fill.is_maker {
            native.maker_net_fee()
        } else {
            native.taker_net_fee()
        };

        debug!(
            "fill posted: {} {} sz={} px={} maker={} fee={} owed={}",
            fill.side, fill.order_id, fill.size, fill.price, fill.is_maker, market_fee,
            self.native_fees_owed
        );
        market_fee
    }

    /// Attempt to settle accumulated operation fees.
    ///
    /// Draws from the native side's cache first, then free balance. When the
    /// free balance cannot cover the owed amount, settlement is deferred
    /// until it grows.
    pub fn settle_fees(&mut self) {
        if self.native_fees_owed == 0 {
            return;
        }
        let Some(side) = self.native_side else {
            debug!(
                "native asset not in pair; {} fee units remain deferred",
                self.native_fees_owed
            );
            return;
        };
        let owed = self.native_fees_owed;
        if self.chain_free[side] < owed {
            debug!(
                "fee settlement deferred: owed {} exceeds free {}",
                owed, self.chain_free[side]
            );
            return;
        }
        let from_cache = owed.min(self.cache_funds[side]);
        self.cache_funds[side] -= from_cache;
        self.chain_free[side] -= owed;
        self.chain_total[side] = self.chain_total[side].saturating_sub(owed);
        self.native_fees_owed = 0;
        info!(
            "settled {} native fee units ({} from cache)",
            owed, from_cache
        );
    }

    /// Verify the fund invariants against the authoritative balances.
    ///
    /// Tolerance per side is one smallest unit or 0.1% of the larger amount,
    /// whichever is greater. Violations trigger recovery at the caller.
    pub fn check_drift(&self) -> Vec<DriftFinding> {
        let mut findings = Vec::new();
        for side in [Side::Buy, Side::Sell] {
            let tracked = self.chain_free[side] + self.committed_chain[side];
            let total = self.chain_total[side];
            if total.abs_diff(tracked) > tolerance_units(total.max(tracked)) {
                findings.push(DriftFinding {
                    side,
                    description: format!(
                        "{side}: total {} vs free+committed {} (free {}, committed {})",
                        total, tracked, self.chain_free[side], self.committed_chain[side]
                    ),
                });
            }
            let cache = self.cache_funds[side];
            let free = self.chain_free[side];
            if cache > free + tolerance_units(cache.max(free)) {
                findings.push(DriftFinding {
                    side,
                    description: format!("{side}: cache {} exceeds free {}", cache, free),
                });
            }
        }
        findings
    }

    /// Consume cache funds when a placement draws on them; pairs with the
    /// grid mutation that justifies the draw in one committed step.
    pub fn consume_for_placement(&mut self, side: Side, amount: u64) {
        let from_cache = amount.min(self.cache_funds[side]);
        self.cache_funds[side] -= from_cache;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::FeeParams;
    use crate::grid::model::GridGeometry;
    use crate::grid::types::SlotId;
    use crate::units::Asset;

    fn test_pair() -> Pair {
        Pair::new(
            Asset::new("1.3.1", "COIN", 5),
            Asset::new("1.3.0", "BTS", 5),
        )
    }

    fn test_fees() -> FeeTable {
        let mut table = FeeTable::new("1.3.0");
        table.insert(
            "1.3.0",
            FeeParams {
                create_fee: 50,
                cancel_fee: 5,
                update_fee: 50,
                maker_fee_percent: 0.1,
                taker_fee_percent: 0.2,
            },
        );
        table
    }

    fn test_grid() -> Grid {
        Grid::build(&GridGeometry {
            start_price: 0.02,
            min_price: 0.01,
            max_price: 0.04,
            increment_percent: 1.0,
            target_spread_percent: 2.0,
        })
        .unwrap()
    }

    #[test]
    fn test_recalc_sums_by_state() {
        let mut grid = test_grid();
        let b = grid.boundary;
        grid.slot_mut(SlotId(b as u32))
            .unwrap()
            .set_book_state(SlotState::Active, 1_000, Some("o-1".into()), Side::Buy);
        grid.slot_mut(SlotId((b - 1) as u32))
            .unwrap()
            .set_virtual_size(400, Side::Buy);
        grid.slot_mut(SlotId((b + grid.gap + 1) as u32)).unwrap().set_book_state(
            SlotState::Partial,
            250,
            Some("o-2".into()),
            Side::Sell,
        );

        let mut acct = Accountant::new(Some(Side::Buy), 0);
        acct.apply_balances(SideMap::new(10_000, 5_000), SideMap::new(11_000, 5_250));
        let report = acct.recalculate(&mut grid);

        assert!(report.ran);
        assert_eq!(report.phantoms_coerced, 0);
        assert_eq!(acct.committed_chain.buy, 1_000);
        assert_eq!(acct.committed_chain.sell, 250);
        assert_eq!(acct.committed_grid.buy, 1_400);
        assert_eq!(acct.virtual_funds.buy, 400);
        assert_eq!(acct.available.buy, 10_000 - 400);
        assert_eq!(acct.available.sell, 5_000);
        assert!(acct.check_drift().is_empty());
    }

    #[test]
    fn test_recalc_coerces_phantom() {
        let mut grid = test_grid();
        let b = grid.boundary as u32;
        // Forge a phantom directly; recalc must fix it before finishing.
        {
            let slot = grid.slot_mut(SlotId(b)).unwrap();
            slot.state = SlotState::Active;
            slot.size = 900;
            slot.order_id = None;
            slot.committed_side = Some(Side::Buy);
        }
        let mut acct = Accountant::new(None, 0);
        let report = acct.recalculate(&mut grid);
        assert_eq!(report.phantoms_coerced, 1);
        assert_eq!(acct.phantom_audits, 1);
        assert_eq!(acct.committed_chain.buy, 0);
        assert_eq!(grid.slot(SlotId(b)).unwrap().state, SlotState::Virtual);
    }

    #[test]
    fn test_recalc_paused_is_noop() {
        let mut grid = test_grid();
        let mut acct = Accountant::new(None, 0);
        acct.pause_recalc();
        assert!(!acct.recalculate(&mut grid).ran);
        acct.resume_recalc();
        assert!(acct.recalculate(&mut grid).ran);
    }

    #[test]
    fn test_post_fill_maker_credits_cache() {
        let pair = test_pair();
        let fees = test_fees();
        let mut acct = Accountant::new(Some(Side::Buy), 0);
        // Sell side committed 1_000 base on book; totals include it.
        acct.apply_balances(SideMap::new(50_000, 0), SideMap::new(50_000, 1_000));
        acct.committed_chain.sell = 1_000;

        let fill = Fill {
            order_id: "o-7".into(),
            side: Side::Sell,
            size: 1_000,
            price: 0.021,
            is_partial: false,
            is_maker: true,
            pays: crate::units::AssetAmount::new("1.3.1", 1_000),
            receives: crate::units::AssetAmount::new("1.3.0", 21),
        };
        acct.post_fill(&fill, &pair, &fees);

        // Sell total dropped by the paid base amount.
        assert_eq!(acct.chain_total.sell, 0);
        // Buy side gained net proceeds in free, total, and cache.
        assert_eq!(acct.chain_total.buy, 50_021);
        assert_eq!(acct.chain_free.buy, 50_021);
        assert_eq!(acct.cache_funds.buy, 21);
        // Maker regime: residual creation fee accrues.
        assert_eq!(acct.native_fees_owed, 10);
    }

    #[test]
    fn test_post_fill_taker_owes_full_fee() {
        let pair = test_pair();
        let fees = test_fees();
        let mut acct = Accountant::new(Some(Side::Buy), 0);
        acct.apply_balances(SideMap::new(50_000, 0), SideMap::new(50_000, 1_000));

        let fill = Fill {
            order_id: "o-8".into(),
            side: Side::Sell,
            size: 1_000,
            price: 0.021,
            is_partial: false,
            is_maker: false,
            pays: crate::units::AssetAmount::new("1.3.1", 1_000),
            receives: crate::units::AssetAmount::new("1.3.0", 21),
        };
        acct.post_fill(&fill, &pair, &fees);
        assert_eq!(acct.native_fees_owed, 50);
    }

    #[test]
    fn test_settle_fees_draws_cache_first() {
        let mut acct = Accountant::new(Some(Side::Buy), 0);
        acct.chain_free.buy = 1_000;
        acct.chain_total.buy = 1_000;
        acct.cache_funds.buy = 30;
        acct.native_fees_owed = 40;

        acct.settle_fees();
        assert_eq!(acct.native_fees_owed, 0);
        assert_eq!(acct.cache_funds.buy, 0);
        assert_eq!(acct.chain_free.buy, 960);
        assert_eq!(acct.chain_total.buy, 960);
    }

    #[test]
    fn test_settle_fees_defers_when_broke() {
        let mut acct = Accountant::new(Some(Side::Buy), 0);
        acct.chain_free.buy = 10;
        acct.native_fees_owed = 40;
        acct.settle_fees();
        assert_eq!(acct.native_fees_owed, 40);
        assert_eq!(acct.chain_free.buy, 10);
    }

    #[test]
    fn test_drift_detection_on_injected_deposit() {
        let mut grid = test_grid();
        let mut acct = Accountant::new(None, 0);
        acct.apply_balances(SideMap::new(10_000, 5_000), SideMap::new(10_000, 5_000));
        acct.recalculate(&mut grid);
        assert!(acct.check_drift().is_empty());

        // Simulate an external deposit the tracker has not seen.
        acct.chain_free.buy += 500;
        let findings = acct.check_drift();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].side, Side::Buy);
    }

    #[test]
    fn test_cache_bound_violation_detected() {
        let mut acct = Accountant::new(None, 0);
        acct.chain_free.sell = 100;
        acct.chain_total.sell = 100;
        acct.cache_funds.sell = 500;
        let findings = acct.check_drift();
        assert!(findings.iter().any(|f| f.side == Side::Sell));
    }

    #[test]
    fn test_native_reservation_reduces_available() {
        let mut grid = test_grid();
        let mut acct = Accountant::new(Some(Side::Buy), 1_000);
        acct.apply_balances(SideMap::new(10_000, 5_000), SideMap::new(10_000, 5_000));
        acct.recalculate(&mut grid);
        assert_eq!(acct.available.buy, 9_000);
        assert_eq!(acct.available.sell, 5_000);
        assert_eq!(acct.total_budget(Side::Buy), 9_000);
    }
}
