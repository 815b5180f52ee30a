//! Grid snapshot persistence and the CSV trade export.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::units::{Pair, Side, SideMap};

use super::model::{Grid, GridGeometry};
use super::types::{Fill, GridSlot};

/// Ladder fingerprint stored with the snapshot; a mismatch against the live
/// config invalidates the persisted grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFingerprint {
    pub min_price: f64,
    pub max_price: f64,
    pub increment_percent: f64,
    pub base_symbol: String,
    pub quote_symbol: String,
}

impl ConfigFingerprint {
    pub fn new(pair: &Pair, geometry: &GridGeometry) -> Self {
        Self {
            min_price: geometry.min_price,
            max_price: geometry.max_price,
            increment_percent: geometry.increment_percent,
            base_symbol: pair.base.symbol.clone(),
            quote_symbol: pair.quote.symbol.clone(),
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.base_symbol == other.base_symbol
            && self.quote_symbol == other.quote_symbol
            && (self.min_price - other.min_price).abs() < 1e-12
            && (self.max_price - other.max_price).abs() < 1e-12
            && (self.increment_percent - other.increment_percent).abs() < 1e-12
    }
}

/// Operational flags persisted alongside the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFlags {
    pub dry_run: bool,
    pub active: bool,
}

/// One persisted document per bot: the full slot list plus the fund state
/// that cannot be re-derived from the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub slots: Vec<GridSlot>,
    pub boundary: usize,
    pub gap: usize,
    pub cache_funds: SideMap<u64>,
    pub native_fees_owed: u64,
    pub pair: Pair,
    pub flags: SnapshotFlags,
    pub fingerprint: ConfigFingerprint,
    /// Unix millis of the last write.
    pub updated_at: i64,
}

impl GridSnapshot {
    pub fn capture(
        grid: &Grid,
        pair: &Pair,
        fingerprint: ConfigFingerprint,
        cache_funds: SideMap<u64>,
        native_fees_owed: u64,
        flags: SnapshotFlags,
    ) -> Self {
        Self {
            slots: grid.slots().to_vec(),
            boundary: grid.boundary,
            gap: grid.gap,
            cache_funds,
            native_fees_owed,
            pair: pair.clone(),
            flags,
            fingerprint,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild the grid, rejecting snapshots from a different ladder.
    pub fn restore(&self, expected: &ConfigFingerprint) -> EngineResult<Grid> {
        if !self.fingerprint.matches(expected) {
            return Err(EngineError::InvalidConfig(format!(
                "snapshot fingerprint {:?} does not match live config",
                self.fingerprint
            )));
        }
        Grid::from_parts(self.slots.clone(), self.boundary, self.gap)
    }
}

/// Snapshot file store with atomic replace.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted snapshot, if one exists and parses.
    pub fn load(&self) -> Option<GridSnapshot> {
        if !self.path.exists() {
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(snapshot) => {
                    info!("loaded snapshot from {:?}", self.path);
                    Some(snapshot)
                }
                Err(e) => {
                    warn!("snapshot at {:?} unreadable ({e}); starting fresh", self.path);
                    None
                }
            },
            Err(e) => {
                warn!("cannot read snapshot {:?}: {e}", self.path);
                None
            }
        }
    }

    /// Write-then-rename so a crash never leaves a torn document.
    pub fn save(&self, snapshot: &GridSnapshot) -> EngineResult<()> {
        let temp = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, &self.path)?;
        debug!("snapshot saved to {:?}", self.path);
        Ok(())
    }
}

/// One exported row per filled order.
#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    unix: i64,
    price: f64,
    amount: f64,
    side: &'a str,
    fee_asset: &'a str,
    fee_amount: f64,
    order_id: &'a str,
}

/// Append-only CSV export of fills, distinct from the snapshot.
pub struct TradeLog {
    path: PathBuf,
}

impl TradeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one fill. The header is written when the file is created.
    pub fn record(&self, fill: &Fill, pair: &Pair, fee_amount: u64) -> EngineResult<()> {
        let fresh = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);

        let sold = pair.asset_sold(fill.side);
        let fee_asset = pair.asset_received(fill.side);
        writer
            .serialize(TradeRow {
                unix: chrono::Utc::now().timestamp(),
                price: fill.price,
                amount: sold.to_display(fill.size),
                side: match fill.side {
                    Side::Buy => "buy",
                    Side::Sell => "sell",
                },
                fee_asset: &fee_asset.symbol,
                fee_amount: fee_asset.to_display(fee_amount),
                order_id: &fill.order_id,
            })
            .map_err(|e| EngineError::StatePersistence(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| EngineError::StatePersistence(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Asset, AssetAmount};

    fn pair() -> Pair {
        Pair::new(
            Asset::new("1.3.1", "COIN", 5),
            Asset::new("1.3.0", "BTS", 5),
        )
    }

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
    fn test_snapshot_round_trip() {
        let dir = std::env::temp_dir().join("gridcrawl-snap-test");
        std::fs::create_dir_all(&dir).unwrap();
        let store = SnapshotStore::new(dir.join("bot.json"));

        let grid = Grid::build(&geometry()).unwrap();
        let fingerprint = ConfigFingerprint::new(&pair(), &geometry());
        let snapshot = GridSnapshot::capture(
            &grid,
            &pair(),
            fingerprint.clone(),
            SideMap::new(12, 34),
            7,
            SnapshotFlags {
                dry_run: true,
                active: true,
            },
        );
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.cache_funds, SideMap::new(12, 34));
        assert_eq!(loaded.native_fees_owed, 7);
        let restored = loaded.restore(&fingerprint).unwrap();
        assert_eq!(restored.slots(), grid.slots());
        assert_eq!(restored.boundary, grid.boundary);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_snapshot_rejects_changed_ladder() {
        let grid = Grid::build(&geometry()).unwrap();
        let fingerprint = ConfigFingerprint::new(&pair(), &geometry());
        let snapshot = GridSnapshot::capture(
            &grid,
            &pair(),
            fingerprint.clone(),
            SideMap::default(),
            0,
            SnapshotFlags::default(),
        );

        let mut other = geometry();
        other.increment_percent = 2.0;
        let other_print = ConfigFingerprint::new(&pair(), &other);
        assert!(snapshot.restore(&other_print).is_err());
    }

    #[test]
    fn test_trade_log_appends_rows() {
        let dir = std::env::temp_dir().join("gridcrawl-csv-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.csv");
        std::fs::remove_file(&path).ok();

        let log = TradeLog::new(&path);
        let fill = Fill {
            order_id: "1.7.3".into(),
            side: Side::Sell,
            size: 100_000,
            price: 0.021,
            is_partial: false,
            is_maker: true,
            pays: AssetAmount::new("1.3.1", 100_000),
            receives: AssetAmount::new("1.3.0", 2_100),
        };
        log.record(&fill, &pair(), 2).unwrap();
        log.record(&fill, &pair(), 2).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("unix,price,amount,side,fee_asset,fee_amount,order_id"));
        assert!(lines[1].contains("sell"));
        assert!(lines[1].contains("1.7.3"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
