//! The engine actor: owns the master grid, the fund ledger, the strategy,
//! and the recovery state for one bot.
//!
//! Subsystems never hold back-references to each other; the engine passes
//! them to one another per call and drains a typed event channel inside its
//! own loop. All cross-task state sits behind FIFO async locks; the lock
//! order is grid before funds everywhere.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;

use crate::config::BotConfig;
use crate::consts::{
    CYCLE_TICK_SECS, FEE_RESERVE_OPS, MAX_CONSECUTIVE_ERRORS, SNAPSHOT_INTERVAL_SECS,
};
use crate::errors::{EngineError, EngineResult};
use crate::exchange::{with_retry, AssetBalance, CreateOrder, Exchange, UpdateOrder};
use crate::fees::FeeTable;
use crate::units::{Side, SideMap};

use super::accountant::Accountant;
use super::model::Grid;
use super::planner::{self, WorkingGrid};
use super::reconciler::{self, RecoveryState};
use super::snapshot::{ConfigFingerprint, GridSnapshot, SnapshotFlags, SnapshotStore, TradeLog};
use super::strategy::CrawlStrategy;
use super::types::{ActionPlan, Fill, PlanAction, SlotId, SlotState};

/// Cross-subsystem notifications, drained inside the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The accountant found the ledger out of tolerance.
    DriftDetected,
    /// At least one action of a committed plan failed to broadcast.
    BroadcastFailed,
}

/// Session counters for the state summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCounters {
    pub fills: u64,
    pub cycles: u64,
    pub creates: u64,
    pub updates: u64,
    pub cancels: u64,
    pub plan_rejections: u64,
    pub drift_events: u64,
    pub recoveries: u64,
}

/// Point-in-time engine summary for logging.
#[derive(Debug, Clone)]
pub struct EngineSummary {
    pub boundary: usize,
    pub version: u64,
    pub on_book: SideMap<usize>,
    pub cache_funds: SideMap<u64>,
    pub native_fees_owed: u64,
    pub counters: EngineCounters,
}

/// One bot's engine. Generic over the exchange client.
pub struct GridEngine<E: Exchange> {
    config: BotConfig,
    fingerprint: ConfigFingerprint,
    strategy: CrawlStrategy,
    exchange: Arc<E>,
    fees: FeeTable,
    /// Per-side bankroll caps resolved at startup; None = use all free.
    allocation: SideMap<Option<u64>>,
    grid: Mutex<Grid>,
    funds: Mutex<Accountant>,
    /// At most one fill cycle in flight.
    fill_lock: Mutex<()>,
    recovery: Mutex<RecoveryState>,
    store: Option<SnapshotStore>,
    trade_log: Option<TradeLog>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<EngineEvent>>,
    counters: Mutex<EngineCounters>,
}

impl<E: Exchange> GridEngine<E> {
    /// Build the engine: freeze the fee cache, resolve the ladder, restore
    /// or construct the grid, and size the bankroll.
    pub async fn bootstrap(config: BotConfig, exchange: Arc<E>) -> EngineResult<Self> {
        config.validate()?;

        let mut fees = FeeTable::new(config.native_asset.id.clone());
        for asset in [&config.native_asset, &config.pair.base, &config.pair.quote] {
            let fetched = with_retry("fee_params", || {
                let exchange = exchange.clone();
                let asset_id = asset.id.clone();
                async move { exchange.fee_params(&asset_id).await }
            })
            .await;
            match fetched {
                Ok(params) => fees.insert(asset.id.clone(), params),
                Err(e) => warn!(
                    "fee parameters unavailable for {} ({e}); proceeding with raw proceeds",
                    asset.symbol
                ),
            }
        }

        let geometry = config.resolve_geometry(exchange.as_ref()).await?;
        let fingerprint = ConfigFingerprint::new(&config.pair, &geometry);
        let store = config.snapshot_path.clone().map(SnapshotStore::new);
        let trade_log = config.trade_log_path.clone().map(TradeLog::new);

        let native_side = config.pair.side_selling(&config.native_asset.id);
        let reservation = if native_side.is_some() {
            fees.native().create_fee * FEE_RESERVE_OPS
        } else {
            0
        };
        let mut funds = Accountant::new(native_side, reservation);

        let mut restored = None;
        if let Some(store) = &store {
            if let Some(snapshot) = store.load() {
                match snapshot.restore(&fingerprint) {
                    Ok(grid) => {
                        funds.cache_funds = snapshot.cache_funds;
                        funds.native_fees_owed = snapshot.native_fees_owed;
                        restored = Some(grid);
                    }
                    Err(e) => warn!("persisted grid unusable: {e}"),
                }
            }
        }
        let grid = match restored {
            Some(grid) => grid,
            None => Grid::build(&geometry)?,
        };

        let balances = with_retry("read_account_totals", || {
            let exchange = exchange.clone();
            async move { exchange.read_account_totals().await }
        })
        .await?;
        let mut raw_free = SideMap::<u64>::default();
        for side in [Side::Buy, Side::Sell] {
            let asset = config.pair.asset_sold(side);
            raw_free[side] = balances
                .iter()
                .find(|b| b.asset_id == asset.id)
                .map(|b| b.free)
                .unwrap_or(0);
        }
        let allocation = config.resolve_allocation(raw_free);

        let strategy = CrawlStrategy {
            active_orders: config.active_orders,
            weight: config.weight_distribution,
            increment_percent: config.increment_percent,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            config,
            fingerprint,
            strategy,
            exchange,
            fees,
            allocation,
            grid: Mutex::new(grid),
            funds: Mutex::new(funds),
            fill_lock: Mutex::new(()),
            recovery: Mutex::new(RecoveryState::new()),
            store,
            trade_log,
            events_tx,
            events_rx: Mutex::new(events_rx),
            counters: Mutex::new(EngineCounters::default()),
        };

        engine.apply_ledger_view(&balances).await;
        {
            let mut grid = engine.grid.lock().await;
            let mut funds = engine.funds.lock().await;
            funds.recalculate(&mut grid);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Map raw exchange balances into the per-side ledger view, applying
    /// the bankroll caps.
    async fn apply_ledger_view(&self, balances: &[AssetBalance]) {
        let committed = {
            let grid = self.grid.lock().await;
            SideMap::new(
                grid.committed_on_book(Side::Buy),
                grid.committed_on_book(Side::Sell),
            )
        };
        let mut free = SideMap::<u64>::default();
        let mut total = SideMap::<u64>::default();
        for side in [Side::Buy, Side::Sell] {
            let asset = self.config.pair.asset_sold(side);
            let raw = balances
                .iter()
                .find(|b| b.asset_id == asset.id)
                .map(|b| b.free)
                .unwrap_or(0);
            let capped = match self.allocation[side] {
                Some(alloc) => raw.min(alloc.saturating_sub(committed[side])),
                None => raw,
            };
            free[side] = capped;
            total[side] = capped + committed[side];
        }
        let mut funds = self.funds.lock().await;
        funds.apply_balances(free, total);
    }

    /// Read balances with retry and refresh the ledger view.
    async fn refresh_balances(&self) -> EngineResult<()> {
        let exchange = self.exchange.clone();
        let balances = with_retry("read_account_totals", move || {
            let exchange = exchange.clone();
            async move { exchange.read_account_totals().await }
        })
        .await?;
        self.apply_ledger_view(&balances).await;
        let mut grid = self.grid.lock().await;
        let mut funds = self.funds.lock().await;
        funds.recalculate(&mut grid);
        Ok(())
    }

    /// Align with the chain and walk the ladder to its target shape.
    ///
    /// Runs the sync, then bounded reconciliation passes (each pass is one
    /// committed plan), then a consolidation rebalance if both sides ended
    /// in dust.
    pub async fn startup_reconcile(&self) -> EngineResult<()> {
        let exchange = self.exchange.clone();
        let open = with_retry("read_open_orders", move || {
            let exchange = exchange.clone();
            async move { exchange.read_open_orders().await }
        })
        .await?;
        {
            let mut grid = self.grid.lock().await;
            let report = reconciler::sync_from_chain(&mut grid, &open, &self.config.pair);
            if !report.unmatched_chain.is_empty() {
                warn!(
                    "{} open orders belong to no slot; they will be treated as excess",
                    report.unmatched_chain.len()
                );
            }
        }
        self.refresh_balances().await?;

        for pass in 0..3 {
            let (work, plan) = {
                let grid = self.grid.lock().await;
                let funds = self.funds.lock().await;
                let mut work = WorkingGrid::capture(&grid);
                let plan = reconciler::plan_reconciliation(&self.strategy, &mut work.grid, &funds);
                (work, plan)
            };
            if plan.is_empty() {
                break;
            }
            debug!("reconciliation pass {pass}: {} actions", plan.len());
            if !self.execute_plan(work, plan).await? {
                break;
            }
            self.refresh_balances().await?;
        }

        let consolidate = {
            let grid = self.grid.lock().await;
            let funds = self.funds.lock().await;
            self.strategy.dual_dust(&grid, &funds)
        };
        if consolidate {
            info!("both sides in dust after reconciliation; running full rebalance");
            let (work, plan) = {
                let grid = self.grid.lock().await;
                let funds = self.funds.lock().await;
                let mut work = WorkingGrid::capture(&grid);
                let plan = self.strategy.plan_full(&mut work.grid, &funds);
                (work, plan)
            };
            self.execute_plan(work, plan).await?;
        }

        let summary = self.summary().await;
        info!(
            "startup reconciled: boundary={} on-book buy={} sell={}",
            summary.boundary, summary.on_book.buy, summary.on_book.sell
        );
        Ok(())
    }

    /// Ingest one exchange-ordered fill batch and run a full cycle.
    pub async fn process_fills(&self, batch: Vec<Fill>) -> EngineResult<()> {
        let _cycle = self.fill_lock.lock().await;
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut counters = self.counters.lock().await;
            counters.fills += batch.len() as u64;
        }

        // Apply fill transitions to the master and post the balances, with
        // recalculation paused across the compound mutation.
        {
            let mut grid = self.grid.lock().await;
            let mut funds = self.funds.lock().await;
            funds.pause_recalc();
            for fill in &batch {
                let slot_id = grid
                    .slots()
                    .iter()
                    .find(|s| s.order_id.as_deref() == Some(fill.order_id.as_str()))
                    .map(|s| s.id);
                match slot_id.and_then(|id| grid.slot_mut(id).ok()) {
                    Some(slot) => {
                        let id = slot.id;
                        let remaining = slot.size.saturating_sub(fill.size);
                        if fill.is_partial && remaining > 0 {
                            let oid = slot.order_id.clone();
                            let side = slot.committed_side.unwrap_or(fill.side);
                            slot.set_book_state(SlotState::Partial, remaining, oid, side);
                        } else {
                            // Full fill, or a partial that consumed the
                            // whole remainder.
                            slot.clear_to_virtual();
                        }
                        info!(
                            "fill: {} {} at {} size {} ({}){}",
                            fill.side,
                            id,
                            fill.price,
                            fill.size,
                            if fill.is_maker { "maker" } else { "taker" },
                            if fill.is_partial { " partial" } else { "" },
                        );
                    }
                    None => warn!("fill for unknown order {}", fill.order_id),
                }
                let fee = funds.post_fill(fill, &self.config.pair, &self.fees);
                if let Some(log) = &self.trade_log {
                    if let Err(e) = log.record(fill, &self.config.pair, fee) {
                        warn!("trade export failed: {e}");
                    }
                }
            }
            grid.bump_version();
            funds.resume_recalc();
            funds.recalculate(&mut grid);
        }

        // Plan against a working clone and push it through the gate.
        let (work, plan) = {
            let grid = self.grid.lock().await;
            let funds = self.funds.lock().await;
            let mut work = WorkingGrid::capture(&grid);
            let plan = self.strategy.plan_cycle(&mut work.grid, &funds, &batch);
            (work, plan)
        };
        if !plan.is_empty() {
            self.execute_plan(work, plan).await?;
        }

        {
            let mut funds = self.funds.lock().await;
            funds.settle_fees();
        }
        self.recalculate_and_check().await;
        self.save_snapshot().await;
        let mut counters = self.counters.lock().await;
        counters.cycles += 1;
        Ok(())
    }

    /// Quiet-cycle maintenance: recalc, drift check, fee settlement, and a
    /// dust-consolidation pass when both sides call for it.
    async fn idle_cycle(&self) -> EngineResult<()> {
        self.recalculate_and_check().await;
        {
            let mut funds = self.funds.lock().await;
            funds.settle_fees();
        }
        let (work, plan) = {
            let grid = self.grid.lock().await;
            let funds = self.funds.lock().await;
            let mut work = WorkingGrid::capture(&grid);
            let plan = self.strategy.plan_cycle(&mut work.grid, &funds, &[]);
            (work, plan)
        };
        if !plan.is_empty() {
            self.execute_plan(work, plan).await?;
        }
        Ok(())
    }

    /// Project, validate, commit, broadcast, and apply one plan.
    ///
    /// Returns whether the plan made it past the commit gate. Fund
    /// validation failures and gate rejections drop the plan without
    /// broadcasting anything.
    async fn execute_plan(&self, mut work: WorkingGrid, plan: ActionPlan) -> EngineResult<bool> {
        if plan.is_empty() {
            return Ok(false);
        }

        // Sizes and sides as they were before projection; the broadcast
        // application uses them to mirror commitment deltas into the ledger.
        let mut prior: HashMap<SlotId, (u64, Option<Side>)> = HashMap::new();
        for action in &plan.actions {
            let key = match action {
                PlanAction::Create { slot, .. } => *slot,
                PlanAction::Cancel { slot, .. } => *slot,
                PlanAction::Move { from, .. } => *from,
            };
            if let Ok(slot) = work.grid.slot(key) {
                prior.insert(key, (slot.size, slot.committed_side));
            }
        }

        work.project(&plan);

        {
            let funds = self.funds.lock().await;
            if let Err(shortfalls) = work.validate_funds(&funds) {
                for s in &shortfalls {
                    warn!(
                        "plan rejected: {} shortfall, required {} vs total {}",
                        s.side, s.required, s.available
                    );
                }
                self.counters.lock().await.plan_rejections += 1;
                return Ok(false);
            }
        }

        {
            let mut grid = self.grid.lock().await;
            let mut funds = self.funds.lock().await;
            funds.pause_recalc();
            let outcome = planner::commit(work, &plan, &mut grid);
            funds.resume_recalc();
            match outcome {
                Ok(()) => {}
                Err(reason) => {
                    warn!("plan rejected at commit: {reason}");
                    self.counters.lock().await.plan_rejections += 1;
                    return Ok(false);
                }
            }
        }

        if self.config.dry_run {
            info!("dry run: skipping broadcast of {} actions", plan.len());
            return Ok(true);
        }

        let mut any_failure = false;
        for action in &plan.actions {
            info!("broadcast: {action}");
            match self.broadcast(action).await {
                Ok(returned_id) => self.apply_broadcast(action, returned_id, &prior).await,
                Err(e) => {
                    error!("broadcast failed for {action}: {e}");
                    any_failure = true;
                }
            }
        }
        if any_failure {
            let _ = self.events_tx.send(EngineEvent::BroadcastFailed);
        }

        self.recalculate_and_check().await;
        Ok(true)
    }

    /// Convert one plan action into the exchange wire call.
    async fn broadcast(&self, action: &PlanAction) -> EngineResult<Option<String>> {
        let pair = &self.config.pair;
        match action {
            PlanAction::Create {
                side, price, size, ..
            } => {
                let order = CreateOrder {
                    sell_asset_id: pair.asset_sold(*side).id.clone(),
                    sell_amount: *size,
                    receive_asset_id: pair.asset_received(*side).id.clone(),
                    min_receive: min_receive_units(pair, *side, *size, *price),
                };
                Ok(Some(self.exchange.create_order(&order).await?))
            }
            PlanAction::Cancel { order_id, .. } => {
                self.exchange.cancel_order(order_id).await?;
                Ok(None)
            }
            PlanAction::Move {
                order_id,
                side,
                price,
                size,
                ..
            } => {
                let update = UpdateOrder {
                    order_id: order_id.clone(),
                    new_price: *price,
                    sell_amount: *size,
                    min_receive: min_receive_units(pair, *side, *size, *price),
                    side: *side,
                };
                Ok(Some(self.exchange.update_order(&update).await?))
            }
        }
    }

    /// Record a confirmed broadcast: book-state transition plus the paired
    /// ledger delta, one committed step per action.
    async fn apply_broadcast(
        &self,
        action: &PlanAction,
        returned_id: Option<String>,
        prior: &HashMap<SlotId, (u64, Option<Side>)>,
    ) {
        let mut grid = self.grid.lock().await;
        let mut funds = self.funds.lock().await;
        let mut counters = self.counters.lock().await;
        match action {
            PlanAction::Create {
                slot, side, size, ..
            } => {
                if let (Ok(s), Some(oid)) = (grid.slot_mut(*slot), returned_id) {
                    s.set_book_state(SlotState::Active, *size, Some(oid), *side);
                }
                funds.chain_free[*side] = funds.chain_free[*side].saturating_sub(*size);
                funds.consume_for_placement(*side, *size);
                counters.creates += 1;
            }
            PlanAction::Cancel { slot, .. } => {
                if let Some((released, Some(side))) = prior.get(slot) {
                    funds.chain_free[*side] += released;
                }
                counters.cancels += 1;
            }
            PlanAction::Move {
                from,
                to,
                side,
                size,
                ..
            } => {
                if let Ok(s) = grid.slot_mut(*to) {
                    if s.is_on_book() {
                        if let Some(oid) = returned_id {
                            s.order_id = Some(oid);
                        }
                        // The exchange confirmed the rebased order at full
                        // size; a lingering Partial becomes Active here.
                        s.state = SlotState::Active;
                    }
                }
                let (old_size, _) = prior.get(from).copied().unwrap_or((0, None));
                if *size >= old_size {
                    let draw = *size - old_size;
                    funds.chain_free[*side] = funds.chain_free[*side].saturating_sub(draw);
                    funds.consume_for_placement(*side, draw);
                } else {
                    // Rotation surplus: released liquidity stays earmarked
                    // for this side's refills.
                    let released = old_size - *size;
                    funds.chain_free[*side] += released;
                    funds.cache_funds[*side] += released;
                }
                counters.updates += 1;
            }
        }
    }

    /// Recompute derived fund state and raise a drift event on violation.
    async fn recalculate_and_check(&self) {
        let mut grid = self.grid.lock().await;
        let mut funds = self.funds.lock().await;
        funds.recalculate(&mut grid);
        let findings = funds.check_drift();
        if !findings.is_empty() {
            for finding in &findings {
                error!("drift detected: {}", finding.description);
            }
            self.counters.lock().await.drift_events += 1;
            let _ = self.events_tx.send(EngineEvent::DriftDetected);
        }
    }

    /// Handle queued events; drift and broadcast failures both resolve
    /// through recovery.
    async fn drain_events(&self) {
        loop {
            let event = {
                let mut rx = self.events_rx.lock().await;
                match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                }
            };
            debug!("engine event: {event:?}");
            match event {
                EngineEvent::DriftDetected | EngineEvent::BroadcastFailed => {
                    if let Err(e) = self.recover().await {
                        warn!("recovery not run: {e}");
                    }
                }
            }
        }
    }

    /// Refetch authoritative state, resync the grid, and reconcile.
    ///
    /// Serialized: one attempt in flight, cooldown between attempts, a hard
    /// cap per cycle window, decay after quiet time.
    pub async fn recover(&self) -> EngineResult<()> {
        {
            let mut state = self.recovery.lock().await;
            state
                .try_begin(Instant::now())
                .map_err(|denied| EngineError::RecoveryDenied(denied.to_string()))?;
        }
        self.counters.lock().await.recoveries += 1;
        info!("recovery: refetching authoritative state");

        let exchange = self.exchange.clone();
        let open = with_retry("read_open_orders", move || {
            let exchange = exchange.clone();
            async move { exchange.read_open_orders().await }
        })
        .await?;
        {
            let mut grid = self.grid.lock().await;
            reconciler::sync_from_chain(&mut grid, &open, &self.config.pair);
        }
        self.refresh_balances().await?;

        let (work, plan) = {
            let grid = self.grid.lock().await;
            let funds = self.funds.lock().await;
            let mut work = WorkingGrid::capture(&grid);
            let plan = reconciler::plan_reconciliation(&self.strategy, &mut work.grid, &funds);
            (work, plan)
        };
        if !plan.is_empty() {
            self.execute_plan(work, plan).await?;
        }

        let clean = {
            let mut grid = self.grid.lock().await;
            let mut funds = self.funds.lock().await;
            funds.recalculate(&mut grid);
            funds.check_drift().is_empty()
        };
        if clean {
            self.recovery.lock().await.mark_recovered();
            info!("recovery complete; ledger back in tolerance");
        } else {
            warn!("ledger still out of tolerance after recovery sync");
        }
        Ok(())
    }

    /// Persist the current grid and fund earmarks.
    async fn save_snapshot(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = {
            let grid = self.grid.lock().await;
            let funds = self.funds.lock().await;
            GridSnapshot::capture(
                &grid,
                &self.config.pair,
                self.fingerprint.clone(),
                funds.cache_funds,
                funds.native_fees_owed,
                SnapshotFlags {
                    dry_run: self.config.dry_run,
                    active: self.config.active,
                },
            )
        };
        if let Err(e) = store.save(&snapshot) {
            warn!("snapshot save failed: {e}");
        }
    }

    /// Point-in-time summary for logs and shutdown reporting.
    pub async fn summary(&self) -> EngineSummary {
        let grid = self.grid.lock().await;
        let funds = self.funds.lock().await;
        let counters = self.counters.lock().await;
        EngineSummary {
            boundary: grid.boundary,
            version: grid.version,
            on_book: SideMap::new(
                grid.on_book_count(Side::Buy),
                grid.on_book_count(Side::Sell),
            ),
            cache_funds: funds.cache_funds,
            native_fees_owed: funds.native_fees_owed,
            counters: *counters,
        }
    }

    /// The bot loop: fills, the inter-cycle timer, autosave, shutdown.
    ///
    /// External errors never crash the loop; a failed cycle is dropped and
    /// the next tick continues, up to the consecutive-error bound.
    pub async fn run(
        &self,
        mut fills: mpsc::Receiver<Fill>,
        mut shutdown: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        if !self.config.active {
            info!("bot disabled by config; not running");
            return Ok(());
        }
        self.startup_reconcile().await?;

        let mut tick = interval(Duration::from_secs(CYCLE_TICK_SECS));
        let mut autosave = interval(Duration::from_secs(SNAPSHOT_INTERVAL_SECS));
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested");
                        break;
                    }
                }
                maybe_fill = fills.recv() => {
                    match maybe_fill {
                        Some(first) => {
                            let mut batch = vec![first];
                            while let Ok(fill) = fills.try_recv() {
                                batch.push(fill);
                            }
                            match self.process_fills(batch).await {
                                Ok(()) => consecutive_errors = 0,
                                Err(e) => {
                                    error!("fill cycle failed: {e}");
                                    consecutive_errors += 1;
                                }
                            }
                        }
                        None => {
                            info!("fill stream closed");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    match self.idle_cycle().await {
                        Ok(()) => consecutive_errors = 0,
                        Err(e) => {
                            warn!("idle cycle failed: {e}");
                            consecutive_errors += 1;
                        }
                    }
                }
                _ = autosave.tick() => {
                    self.save_snapshot().await;
                }
            }

            self.drain_events().await;

            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                error!("too many consecutive errors; stopping");
                self.save_snapshot().await;
                return Err(EngineError::InvalidState(
                    "consecutive error bound exceeded".into(),
                ));
            }
        }

        // Resting orders stay on book; the next session re-adopts them.
        self.save_snapshot().await;
        let summary = self.summary().await;
        info!(
            "stopped: v{} boundary={} on-book buy={} sell={} fills={} creates={} updates={} cancels={}",
            summary.version,
            summary.boundary,
            summary.on_book.buy,
            summary.on_book.sell,
            summary.counters.fills,
            summary.counters.creates,
            summary.counters.updates,
            summary.counters.cancels,
        );
        Ok(())
    }
}

/// Minimum acceptable proceeds for an order of `size` at `price`.
fn min_receive_units(pair: &crate::units::Pair, side: Side, size: u64, price: f64) -> u64 {
    match side {
        // Selling base: receive quote = base * price.
        Side::Sell => pair
            .quote
            .to_units(pair.base.to_display(size) * price),
        // Selling quote: receive base = quote / price.
        Side::Buy => pair
            .base
            .to_units(pair.quote.to_display(size) / price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FundSpec, PriceBound, StartPriceSpec};
    use crate::exchange::mock::MockExchange;
    use crate::fees::FeeParams;
    use crate::units::{Asset, AssetAmount, Pair};

    fn fee_params() -> FeeParams {
        FeeParams {
            create_fee: 50,
            cancel_fee: 5,
            update_fee: 50,
            maker_fee_percent: 0.1,
            taker_fee_percent: 0.2,
        }
    }

    fn bot_config(dry_run: bool) -> BotConfig {
        BotConfig {
            pair: Pair::new(
                Asset::new("1.3.1", "COIN", 5),
                Asset::new("1.3.0", "BTS", 5),
            ),
            native_asset: Asset::new("1.3.0", "BTS", 5),
            start_price: StartPriceSpec::Absolute(0.02),
            min_price: PriceBound::Absolute(0.01),
            max_price: PriceBound::Absolute(0.04),
            increment_percent: 1.0,
            target_spread_percent: 2.0,
            active_orders: SideMap::new(3, 3),
            bot_funds: SideMap::new(FundSpec::All, FundSpec::All),
            weight_distribution: SideMap::new(1.0, 1.0),
            dry_run,
            active: true,
            snapshot_path: None,
            trade_log_path: None,
        }
    }

    async fn cold_engine(dry_run: bool) -> (GridEngine<MockExchange>, Arc<MockExchange>) {
        let exchange = Arc::new(MockExchange::new());
        // 1000 quote and 50000 base, both at precision 5.
        exchange.set_balance("1.3.0", 100_000_000, 100_000_000).await;
        exchange
            .set_balance("1.3.1", 5_000_000_000, 5_000_000_000)
            .await;
        exchange.set_fee_params("1.3.0", fee_params()).await;
        exchange.set_fee_params("1.3.1", fee_params()).await;

        let engine = GridEngine::bootstrap(bot_config(dry_run), exchange.clone())
            .await
            .unwrap();
        (engine, exchange)
    }

    fn innermost_sell_fill(grid: &Grid, pair: &Pair) -> Fill {
        let index = grid.boundary + grid.gap + 1;
        let slot = &grid.slots()[index];
        let proceeds = pair
            .quote
            .to_units(pair.base.to_display(slot.size) * slot.price);
        Fill {
            order_id: slot.order_id.clone().unwrap(),
            side: Side::Sell,
            size: slot.size,
            price: slot.price,
            is_partial: false,
            is_maker: true,
            pays: AssetAmount::new("1.3.1", slot.size),
            receives: AssetAmount::new("1.3.0", proceeds),
        }
    }

    #[tokio::test]
    async fn test_cold_start_places_initial_ladder() {
        let (engine, exchange) = cold_engine(false).await;
        engine.startup_reconcile().await.unwrap();

        let created = exchange.created.lock().await.len();
        assert!(created > 0 && created <= 6, "created {created} orders");
        assert!(exchange.updated.lock().await.is_empty());
        assert!(exchange.cancelled.lock().await.is_empty());

        let grid = engine.grid.lock().await;
        assert_eq!(grid.on_book_count(Side::Buy), 3);
        assert_eq!(grid.on_book_count(Side::Sell), 3);
        grid.check_invariants().unwrap();
        assert!(grid.gap >= 2);

        let funds = engine.funds.lock().await;
        assert!(funds.check_drift().is_empty());
    }

    #[tokio::test]
    async fn test_sell_fill_crawls_boundary() {
        let (engine, exchange) = cold_engine(false).await;
        engine.startup_reconcile().await.unwrap();

        let (fill, old_boundary) = {
            let grid = engine.grid.lock().await;
            (
                innermost_sell_fill(&grid, &engine.config.pair),
                grid.boundary,
            )
        };
        // The chain consumed the resting order: mirror it in the mock.
        exchange.cancel_order(&fill.order_id).await.unwrap();
        exchange.cancelled.lock().await.clear();

        engine.process_fills(vec![fill]).await.unwrap();

        let grid = engine.grid.lock().await;
        assert_eq!(grid.boundary, old_boundary + 1);
        // A new on-book buy sits at the new innermost buy slot.
        assert!(grid.slots()[grid.boundary].is_on_book());
        assert_eq!(
            grid.slots()[grid.boundary].committed_side,
            Some(Side::Buy)
        );
        grid.check_invariants().unwrap();
        drop(grid);

        let funds = engine.funds.lock().await;
        assert!(funds.cache_funds.buy > 0);
        assert!(funds.check_drift().is_empty());

        let counters = engine.counters.lock().await;
        assert_eq!(counters.fills, 1);
    }

    #[tokio::test]
    async fn test_injected_drift_triggers_recovery() {
        let (engine, _exchange) = cold_engine(false).await;
        engine.startup_reconcile().await.unwrap();

        // An external deposit the tracker has not seen.
        {
            let mut funds = engine.funds.lock().await;
            funds.chain_free.buy += 500_000;
        }
        engine.recalculate_and_check().await;
        engine.drain_events().await;

        let funds = engine.funds.lock().await;
        assert!(funds.check_drift().is_empty());
        drop(funds);

        let counters = engine.counters.lock().await;
        assert!(counters.drift_events >= 1);
        assert!(counters.recoveries >= 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_broadcasts() {
        let (engine, exchange) = cold_engine(true).await;
        engine.startup_reconcile().await.unwrap();

        assert!(exchange.created.lock().await.is_empty());
        let grid = engine.grid.lock().await;
        assert!(grid.slots().iter().all(|s| !s.is_on_book()));
        // Capital is still allocated virtually so the planner is exercised.
        assert!(grid.slots().iter().any(|s| s.size > 0));
    }

    #[tokio::test]
    async fn test_stale_plan_is_dropped_without_broadcast() {
        let (engine, exchange) = cold_engine(false).await;
        engine.startup_reconcile().await.unwrap();
        let created_before = exchange.created.lock().await.len();

        let (work, plan) = {
            let grid = engine.grid.lock().await;
            let funds = engine.funds.lock().await;
            let mut work = WorkingGrid::capture(&grid);
            let fill = innermost_sell_fill(&grid, &engine.config.pair);
            let plan = engine.strategy.plan_cycle(&mut work.grid, &funds, &[fill]);
            (work, plan)
        };
        assert!(!plan.is_empty());

        // An unrelated mutation advances the master before commit.
        engine.grid.lock().await.bump_version();

        let committed = engine.execute_plan(work, plan).await.unwrap();
        assert!(!committed);
        assert_eq!(exchange.created.lock().await.len(), created_before);
        assert_eq!(engine.counters.lock().await.plan_rejections, 1);
    }

    #[tokio::test]
    async fn test_run_loop_shuts_down_cleanly() {
        let (engine, _exchange) = cold_engine(false).await;
        let engine = Arc::new(engine);

        let (_fill_tx, fill_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run(fill_rx, shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let summary = engine.summary().await;
        assert_eq!(summary.on_book.buy, 3);
    }

    #[tokio::test]
    async fn test_broadcast_failure_raises_event_and_recovers() {
        let (engine, exchange) = cold_engine(false).await;
        engine.startup_reconcile().await.unwrap();

        let (fill, _) = {
            let grid = engine.grid.lock().await;
            (
                innermost_sell_fill(&grid, &engine.config.pair),
                grid.boundary,
            )
        };
        exchange.cancel_order(&fill.order_id).await.unwrap();
        exchange.cancelled.lock().await.clear();

        // Every broadcast of the reaction plan fails.
        exchange.set_should_fail(true).await;
        engine.process_fills(vec![fill]).await.unwrap();
        exchange.set_should_fail(false).await;

        engine.drain_events().await;

        // Recovery resynced against the chain; the ledger closed again.
        let funds = engine.funds.lock().await;
        assert!(funds.check_drift().is_empty());
        drop(funds);
        let grid = engine.grid.lock().await;
        grid.check_invariants().unwrap();
        assert!(engine.counters.lock().await.recoveries >= 1);
    }
}
