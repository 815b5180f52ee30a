//! Precision-aware money math.
//!
//! All amounts are transported and stored as integers in units of `10^-p`
//! where `p` is the asset's precision. Floats exist only at the display
//! boundary and inside price arithmetic; everything the ledger sums or
//! compares is integer-exact.

use serde::{Deserialize, Serialize};

use crate::consts::DRIFT_EPSILON;

/// An asset known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Opaque chain identifier (e.g. "1.3.0").
    pub id: String,
    /// Display symbol (e.g. "BTS").
    pub symbol: String,
    /// Decimal digits of precision; amounts are integers in `10^-precision`.
    pub precision: u32,
}

impl Asset {
    pub fn new(id: impl Into<String>, symbol: impl Into<String>, precision: u32) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            precision,
        }
    }

    /// Convert a displayed float into chain-native integer units.
    pub fn to_units(&self, amount: f64) -> u64 {
        float_to_units(amount, self.precision)
    }

    /// Convert chain-native integer units into a displayed float.
    pub fn to_display(&self, units: u64) -> f64 {
        units_to_float(units, self.precision)
    }

    /// One smallest representable unit, as a float.
    pub fn precision_slack(&self) -> f64 {
        10f64.powi(-(self.precision as i32))
    }
}

/// The traded pair: `base` (A) is bought and sold against `quote` (B).
///
/// Prices are always quoted as B per 1 A. A BUY sells B to acquire A; a SELL
/// sells A to acquire B, so sizes are denominated in the asset *sold*.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub base: Asset,
    pub quote: Asset,
}

impl Pair {
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    /// The asset a given side gives up when its order fills.
    pub fn asset_sold(&self, side: Side) -> &Asset {
        match side {
            Side::Buy => &self.quote,
            Side::Sell => &self.base,
        }
    }

    /// The asset a given side acquires when its order fills.
    pub fn asset_received(&self, side: Side) -> &Asset {
        match side {
            Side::Buy => &self.base,
            Side::Sell => &self.quote,
        }
    }

    /// Side whose orders sell the given asset id, if it is part of the pair.
    pub fn side_selling(&self, asset_id: &str) -> Option<Side> {
        if asset_id == self.quote.id {
            Some(Side::Buy)
        } else if asset_id == self.base.id {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

/// Order side. BUY acquires base by selling quote; SELL is the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pair of values addressed by [`Side`].
///
/// The fund ledger, budgets, and order-count targets all come in
/// buy/sell pairs; this keeps the indexing uniform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideMap<T> {
    pub buy: T,
    pub sell: T,
}

impl<T> SideMap<T> {
    pub fn new(buy: T, sell: T) -> Self {
        Self { buy, sell }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> SideMap<U> {
        SideMap {
            buy: f(&self.buy),
            sell: f(&self.sell),
        }
    }
}

impl<T> std::ops::Index<Side> for SideMap<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        self.get(side)
    }
}

impl<T> std::ops::IndexMut<Side> for SideMap<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        self.get_mut(side)
    }
}

/// An integer amount tagged with the asset it is denominated in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub asset_id: String,
    pub amount: u64,
}

impl AssetAmount {
    pub fn new(asset_id: impl Into<String>, amount: u64) -> Self {
        Self {
            asset_id: asset_id.into(),
            amount,
        }
    }
}

/// Convert a displayed float to integer units at the given precision.
///
/// Rounds to nearest; negative inputs clamp to zero rather than wrapping.
pub fn float_to_units(amount: f64, precision: u32) -> u64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * 10f64.powi(precision as i32)).round() as u64
}

/// Convert integer units back to a displayed float.
pub fn units_to_float(units: u64, precision: u32) -> f64 {
    units as f64 / 10f64.powi(precision as i32)
}

/// Round a float to what is exactly representable at the given precision.
///
/// `units_to_float(float_to_units(x, p), p) == round_display(x, p)` for all
/// positive finite `x`.
pub fn round_display(amount: f64, precision: u32) -> f64 {
    units_to_float(float_to_units(amount, precision), precision)
}

/// Drift tolerance for an integer amount: one smallest unit, or the relative
/// epsilon of the amount, whichever is larger.
pub fn tolerance_units(amount: u64) -> u64 {
    let relative = (amount as f64 * DRIFT_EPSILON).ceil() as u64;
    relative.max(1)
}

/// Whether two integer amounts agree within [`tolerance_units`] of the larger.
pub fn within_tolerance(a: u64, b: u64) -> bool {
    let tol = tolerance_units(a.max(b));
    a.abs_diff(b) <= tol
}
