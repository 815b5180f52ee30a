//! Reference-price derivation from pool reserves or the order book.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::units::Pair;

use super::Exchange;

/// Where the starting reference price comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceMode {
    /// AMM pool reserve ratio.
    Pool,
    /// Best-bid/best-ask midpoint, falling back to the last trade.
    Market,
    /// Pool first, then market.
    Auto,
}

impl std::str::FromStr for PriceMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pool" => Ok(PriceMode::Pool),
            "market" => Ok(PriceMode::Market),
            "auto" => Ok(PriceMode::Auto),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown price mode '{other}' (expected pool, market, or auto)"
            ))),
        }
    }
}

/// Derive a quote-per-base price for the pair.
pub async fn derive_price<E: Exchange + ?Sized>(
    exchange: &E,
    pair: &Pair,
    mode: PriceMode,
) -> EngineResult<f64> {
    match mode {
        PriceMode::Pool => pool_price(exchange, pair).await,
        PriceMode::Market => market_price(exchange, pair).await,
        PriceMode::Auto => match pool_price(exchange, pair).await {
            Ok(price) => Ok(price),
            Err(e) => {
                debug!("pool price unavailable ({e}); falling back to market");
                market_price(exchange, pair).await
            }
        },
    }
}

async fn pool_price<E: Exchange + ?Sized>(exchange: &E, pair: &Pair) -> EngineResult<f64> {
    let reserves = exchange
        .pool_reserves(&pair.base.id, &pair.quote.id)
        .await?
        .ok_or_else(|| {
            EngineError::PriceDerivation(format!(
                "no pool for {}/{}",
                pair.base.symbol, pair.quote.symbol
            ))
        })?;
    if reserves.base == 0 {
        return Err(EngineError::PriceDerivation("pool has empty base reserve".into()));
    }
    let base = pair.base.to_display(reserves.base);
    let quote = pair.quote.to_display(reserves.quote);
    let price = quote / base;
    info!(
        "pool price for {}/{}: {price}",
        pair.base.symbol, pair.quote.symbol
    );
    Ok(price)
}

async fn market_price<E: Exchange + ?Sized>(exchange: &E, pair: &Pair) -> EngineResult<f64> {
    let ticker = exchange.book_ticker(&pair.base.id, &pair.quote.id).await?;
    let price = match (ticker.best_bid, ticker.best_ask) {
        (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => (bid + ask) / 2.0,
        _ => ticker.last_trade.ok_or_else(|| {
            EngineError::PriceDerivation(format!(
                "no book or ticker data for {}/{}",
                pair.base.symbol, pair.quote.symbol
            ))
        })?,
    };
    if !price.is_finite() || price <= 0.0 {
        return Err(EngineError::PriceDerivation(format!(
            "derived market price {price} is not usable"
        )));
    }
    info!(
        "market price for {}/{}: {price}",
        pair.base.symbol, pair.quote.symbol
    );
    Ok(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::MockExchange;
    use crate::exchange::{BookTicker, PoolReserves};
    use crate::units::Asset;

    fn pair() -> Pair {
        Pair::new(
            Asset::new("1.3.1", "COIN", 5),
            Asset::new("1.3.0", "BTS", 5),
        )
    }

    #[tokio::test]
    async fn test_pool_price_from_reserves() {
        let exchange = MockExchange::new();
        // 1000 base vs 20 quote => 0.02 quote per base.
        *exchange.pool.lock().await = Some(PoolReserves {
            base: 100_000_000,
            quote: 2_000_000,
        });
        let price = derive_price(&exchange, &pair(), PriceMode::Pool)
            .await
            .unwrap();
        assert!((price - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_market_midpoint_and_fallback() {
        let exchange = MockExchange::new();
        *exchange.ticker.lock().await = BookTicker {
            best_bid: Some(0.019),
            best_ask: Some(0.021),
            last_trade: Some(0.05),
        };
        let price = derive_price(&exchange, &pair(), PriceMode::Market)
            .await
            .unwrap();
        assert!((price - 0.02).abs() < 1e-9);

        // One-sided book falls back to last trade.
        *exchange.ticker.lock().await = BookTicker {
            best_bid: Some(0.019),
            best_ask: None,
            last_trade: Some(0.05),
        };
        let price = derive_price(&exchange, &pair(), PriceMode::Market)
            .await
            .unwrap();
        assert!((price - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_auto_prefers_pool_then_market() {
        let exchange = MockExchange::new();
        *exchange.ticker.lock().await = BookTicker {
            best_bid: Some(0.03),
            best_ask: Some(0.05),
            last_trade: None,
        };
        // No pool: auto uses market.
        let price = derive_price(&exchange, &pair(), PriceMode::Auto)
            .await
            .unwrap();
        assert!((price - 0.04).abs() < 1e-9);

        *exchange.pool.lock().await = Some(PoolReserves {
            base: 100_000_000,
            quote: 2_000_000,
        });
        let price = derive_price(&exchange, &pair(), PriceMode::Auto)
            .await
            .unwrap();
        assert!((price - 0.02).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_data_is_an_error() {
        let exchange = MockExchange::new();
        assert!(derive_price(&exchange, &pair(), PriceMode::Auto)
            .await
            .is_err());
    }
}
