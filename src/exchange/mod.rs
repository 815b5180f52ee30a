//! Exchange abstraction - the engine's only window onto the chain.
//!
//! The real client (broadcast, balance reads, order book reads) lives
//! outside this crate; everything here is the trait the engine drives plus a
//! mock implementation for tests.

mod price;

pub use price::{derive_price, PriceMode};

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::consts::{IO_TIMEOUT_MS, MAX_IO_RETRIES, RETRY_BASE_DELAY_MS};
use crate::errors::{EngineError, EngineResult};
use crate::fees::FeeParams;
use crate::units::{Pair, Side};

/// Free and total balance of one asset, integer units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset_id: String,
    pub free: u64,
    pub total: u64,
}

/// An order resting on the book, as the exchange reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    /// Remaining amount offered, in units of the sold asset.
    pub for_sale: u64,
    pub sell_asset_id: String,
    pub receive_asset_id: String,
    /// Original offer, defining the price ratio together with
    /// `receive_amount`.
    pub sell_amount: u64,
    pub receive_amount: u64,
}

impl OpenOrder {
    /// Which side of the pair this order trades, if it belongs to the pair.
    pub fn side(&self, pair: &Pair) -> Option<Side> {
        pair.side_selling(&self.sell_asset_id)
    }

    /// Price as quote per base, if the order belongs to the pair.
    pub fn price(&self, pair: &Pair) -> Option<f64> {
        let side = self.side(pair)?;
        if self.sell_amount == 0 || self.receive_amount == 0 {
            return None;
        }
        let sell = pair.asset_sold(side).to_display(self.sell_amount);
        let receive = pair.asset_received(side).to_display(self.receive_amount);
        Some(match side {
            // Selling base for quote: price = quote / base.
            Side::Sell => receive / sell,
            // Selling quote for base: price = quote / base.
            Side::Buy => sell / receive,
        })
    }
}

/// A new limit order to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub sell_asset_id: String,
    pub sell_amount: u64,
    pub receive_asset_id: String,
    pub min_receive: u64,
}

/// An on-wire move of an existing order to a new price and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOrder {
    pub order_id: String,
    pub new_price: f64,
    pub sell_amount: u64,
    pub min_receive: u64,
    pub side: Side,
}

/// AMM pool reserves for the pair, if a pool exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReserves {
    pub base: u64,
    pub quote: u64,
}

/// Best-of-book and last-trade quotes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BookTicker {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub last_trade: Option<f64>,
}

/// Exchange operations the engine requires. Mockable for tests.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Authoritative balances for the bot account.
    async fn read_account_totals(&self) -> EngineResult<Vec<AssetBalance>>;

    /// All open orders for the bot account.
    async fn read_open_orders(&self) -> EngineResult<Vec<OpenOrder>>;

    /// Broadcast a new limit order; returns the on-book id.
    async fn create_order(&self, order: &CreateOrder) -> EngineResult<String>;

    /// Move an existing order; returns the (possibly new) on-book id.
    async fn update_order(&self, update: &UpdateOrder) -> EngineResult<String>;

    /// Cancel an order by id.
    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;

    /// Pool reserves for a pair, if an AMM pool exists for it.
    async fn pool_reserves(&self, base_id: &str, quote_id: &str)
        -> EngineResult<Option<PoolReserves>>;

    /// Order-book quotes for a pair.
    async fn book_ticker(&self, base_id: &str, quote_id: &str) -> EngineResult<BookTicker>;

    /// Fee parameters for one asset.
    async fn fee_params(&self, asset_id: &str) -> EngineResult<FeeParams>;
}

/// Run a read-side operation with timeout and exponential backoff.
pub async fn with_retry<T, F, Fut>(label: &str, operation: F) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempts = 0;
    let mut last_error = EngineError::Exchange("no attempt made".into());

    while attempts < MAX_IO_RETRIES {
        let attempt = tokio::time::timeout(Duration::from_millis(IO_TIMEOUT_MS), operation());
        match attempt.await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = EngineError::Timeout(IO_TIMEOUT_MS),
        }
        attempts += 1;
        if attempts < MAX_IO_RETRIES {
            let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempts - 1);
            warn!(
                "{label} failed (attempt {attempts}/{MAX_IO_RETRIES}), retrying in {delay}ms: {last_error}"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    Err(last_error)
}

// ============================================================================
// Mock implementation for testing
// ============================================================================

/// In-memory exchange for driving the engine in tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Mock exchange recording every broadcast.
    pub struct MockExchange {
        pub balances: Arc<Mutex<Vec<AssetBalance>>>,
        pub open_orders: Arc<Mutex<Vec<OpenOrder>>>,
        pub created: Arc<Mutex<Vec<CreateOrder>>>,
        pub updated: Arc<Mutex<Vec<UpdateOrder>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub fees: Arc<Mutex<HashMap<String, FeeParams>>>,
        pub pool: Arc<Mutex<Option<PoolReserves>>>,
        pub ticker: Arc<Mutex<BookTicker>>,
        pub should_fail: Arc<Mutex<bool>>,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new() -> Self {
            Self {
                balances: Arc::new(Mutex::new(Vec::new())),
                open_orders: Arc::new(Mutex::new(Vec::new())),
                created: Arc::new(Mutex::new(Vec::new())),
                updated: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                fees: Arc::new(Mutex::new(HashMap::new())),
                pool: Arc::new(Mutex::new(None)),
                ticker: Arc::new(Mutex::new(BookTicker::default())),
                should_fail: Arc::new(Mutex::new(false)),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_balance(&self, asset_id: &str, free: u64, total: u64) {
            let mut balances = self.balances.lock().await;
            balances.retain(|b| b.asset_id != asset_id);
            balances.push(AssetBalance {
                asset_id: asset_id.to_string(),
                free,
                total,
            });
        }

        pub async fn set_fee_params(&self, asset_id: &str, params: FeeParams) {
            self.fees.lock().await.insert(asset_id.to_string(), params);
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        async fn check_failure(&self) -> EngineResult<()> {
            if *self.should_fail.lock().await {
                Err(EngineError::Exchange("mock failure".into()))
            } else {
                Ok(())
            }
        }

        /// Mirror what the chain does to the free balance when commitments
        /// move on or off the book. Totals stay put.
        async fn adjust_free(&self, asset_id: &str, delta: i64) {
            let mut balances = self.balances.lock().await;
            if let Some(balance) = balances.iter_mut().find(|b| b.asset_id == asset_id) {
                balance.free = (balance.free as i64 + delta).max(0) as u64;
            }
        }
    }

    impl Default for MockExchange {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn read_account_totals(&self) -> EngineResult<Vec<AssetBalance>> {
            self.check_failure().await?;
            Ok(self.balances.lock().await.clone())
        }

        async fn read_open_orders(&self) -> EngineResult<Vec<OpenOrder>> {
            self.check_failure().await?;
            Ok(self.open_orders.lock().await.clone())
        }

        async fn create_order(&self, order: &CreateOrder) -> EngineResult<String> {
            self.check_failure().await?;
            let oid = format!("1.7.{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            self.created.lock().await.push(order.clone());
            self.open_orders.lock().await.push(OpenOrder {
                id: oid.clone(),
                for_sale: order.sell_amount,
                sell_asset_id: order.sell_asset_id.clone(),
                receive_asset_id: order.receive_asset_id.clone(),
                sell_amount: order.sell_amount,
                receive_amount: order.min_receive,
            });
            self.adjust_free(&order.sell_asset_id, -(order.sell_amount as i64))
                .await;
            Ok(oid)
        }

        async fn update_order(&self, update: &UpdateOrder) -> EngineResult<String> {
            self.check_failure().await?;
            self.updated.lock().await.push(update.clone());
            let mut delta = 0i64;
            let mut asset = None;
            {
                let mut orders = self.open_orders.lock().await;
                if let Some(order) = orders.iter_mut().find(|o| o.id == update.order_id) {
                    delta = order.for_sale as i64 - update.sell_amount as i64;
                    asset = Some(order.sell_asset_id.clone());
                    order.for_sale = update.sell_amount;
                    order.sell_amount = update.sell_amount;
                    order.receive_amount = update.min_receive;
                }
            }
            if let Some(asset) = asset {
                self.adjust_free(&asset, delta).await;
            }
            Ok(update.order_id.clone())
        }

        async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
            self.check_failure().await?;
            self.cancelled.lock().await.push(order_id.to_string());
            let released = {
                let mut orders = self.open_orders.lock().await;
                let released = orders
                    .iter()
                    .find(|o| o.id == order_id)
                    .map(|o| (o.sell_asset_id.clone(), o.for_sale));
                orders.retain(|o| o.id != order_id);
                released
            };
            if let Some((asset, amount)) = released {
                self.adjust_free(&asset, amount as i64).await;
            }
            Ok(())
        }

        async fn pool_reserves(
            &self,
            _base_id: &str,
            _quote_id: &str,
        ) -> EngineResult<Option<PoolReserves>> {
            self.check_failure().await?;
            Ok(*self.pool.lock().await)
        }

        async fn book_ticker(&self, _base_id: &str, _quote_id: &str) -> EngineResult<BookTicker> {
            self.check_failure().await?;
            Ok(*self.ticker.lock().await)
        }

        async fn fee_params(&self, asset_id: &str) -> EngineResult<FeeParams> {
            self.check_failure().await?;
            self.fees
                .lock()
                .await
                .get(asset_id)
                .copied()
                .ok_or_else(|| EngineError::FeeScheduleMissing(asset_id.to_string()))
        }
    }
}
