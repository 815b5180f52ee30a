//! Per-asset fee parameters, cached once at startup.
//!
//! The table is read from the exchange during engine construction and is
//! read-only afterwards. Operation fees (create/cancel/update) are paid in
//! the native fee asset; market fees are a percentage of fill proceeds in
//! the proceeds asset.

use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};

/// Fee parameters for a single asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeeParams {
    /// Order-creation operation fee, in native-asset units.
    pub create_fee: u64,
    /// Order-cancel operation fee, in native-asset units.
    pub cancel_fee: u64,
    /// Order-update operation fee, in native-asset units.
    pub update_fee: u64,
    /// Market fee applied to maker proceeds, as a percentage.
    pub maker_fee_percent: f64,
    /// Market fee applied to taker proceeds, as a percentage.
    pub taker_fee_percent: f64,
}

impl FeeParams {
    /// Net native fee for a maker fill: the creation fee is refunded by the
    /// chain minus this residual.
    pub fn maker_net_fee(&self) -> u64 {
        // The refund covers all but a fifth of the creation fee.
        self.create_fee / 5
    }

    /// Net native fee for a taker fill: no refund.
    pub fn taker_net_fee(&self) -> u64 {
        self.create_fee
    }

    /// Market fee deducted from proceeds of the given regime.
    pub fn market_fee_on(&self, proceeds: u64, is_maker: bool) -> u64 {
        let pct = if is_maker {
            self.maker_fee_percent
        } else {
            self.taker_fee_percent
        };
        (proceeds as f64 * pct / 100.0).round() as u64
    }
}

/// Frozen per-asset fee table plus the native fee-asset identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTable {
    by_asset: HashMap<String, FeeParams>,
    /// Asset consumed by operation fees (e.g. "1.3.0").
    pub native_asset_id: String,
}

impl FeeTable {
    pub fn new(native_asset_id: impl Into<String>) -> Self {
        Self {
            by_asset: HashMap::new(),
            native_asset_id: native_asset_id.into(),
        }
    }

    /// Insert parameters for an asset during startup population.
    pub fn insert(&mut self, asset_id: impl Into<String>, params: FeeParams) {
        self.by_asset.insert(asset_id.into(), params);
    }

    /// Parameters for the native asset. Missing native parameters are a
    /// construction-time bug, so this falls back to zeroes loudly.
    pub fn native(&self) -> FeeParams {
        match self.by_asset.get(&self.native_asset_id) {
            Some(p) => *p,
            None => {
                warn!(
                    "fee table has no entry for native asset {}",
                    self.native_asset_id
                );
                FeeParams::default()
            }
        }
    }

    /// Parameters for an arbitrary asset, if cached.
    ///
    /// A miss for a non-native asset degrades gracefully: callers use raw
    /// proceeds and the cycle continues.
    pub fn get(&self, asset_id: &str) -> Option<&FeeParams> {
        self.by_asset.get(asset_id)
    }

    pub fn is_native(&self, asset_id: &str) -> bool {
        asset_id == self.native_asset_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FeeParams {
        FeeParams {
            create_fee: 50,
            cancel_fee: 5,
            update_fee: 50,
            maker_fee_percent: 0.1,
            taker_fee_percent: 0.2,
        }
    }

    #[test]
    fn test_maker_refund_is_partial() {
        let p = params();
        assert!(p.maker_net_fee() < p.create_fee);
        assert_eq!(p.taker_net_fee(), p.create_fee);
    }

    #[test]
    fn test_market_fee_regimes() {
        let p = params();
        assert_eq!(p.market_fee_on(100_000, true), 100);
        assert_eq!(p.market_fee_on(100_000, false), 200);
    }

    #[test]
    fn test_table_lookup_and_native_fallback() {
        let mut table = FeeTable::new("1.3.0");
        table.insert("1.3.0", params());
        assert!(table.is_native("1.3.0"));
        assert_eq!(table.native().create_fee, 50);
        assert!(table.get("1.3.5").is_none());

        let empty = FeeTable::new("1.3.0");
        assert_eq!(empty.native().create_fee, 0);
    }
}
