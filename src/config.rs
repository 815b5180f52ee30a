//! Configuration loading and resolution.
//!
//! Settings come from a config file overlaid with `APP_*` environment
//! variables. String forms are resolved here once, at startup: a
//! `start_price` of `"pool"` / `"market"` / `"auto"` selects price
//! derivation, bounds accept `"3x"` multiples of the start price, and fund
//! allocations accept `"40%"` of the free balance. All validation failures
//! are fatal before the engine is built.

use std::path::PathBuf;

use config::{Config, File};
use serde::Deserialize;

use crate::errors::{EngineError, EngineResult};
use crate::exchange::{derive_price, Exchange, PriceMode};
use crate::grid::GridGeometry;
use crate::units::{Asset, Pair, Side, SideMap};

/// Main configuration document.
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Network / account glue handed to the exchange client.
    pub network: NetworkConfig,
    /// Bot parameters, raw string forms included.
    pub bot: BotSettings,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Account name or id the exchange client trades as.
    pub account: String,
    /// Node endpoint for the exchange client.
    pub node_url: String,
    /// Native fee asset identity.
    #[serde(default = "default_native_id")]
    pub native_asset_id: String,
    #[serde(default = "default_native_symbol")]
    pub native_asset_symbol: String,
    #[serde(default = "default_native_precision")]
    pub native_asset_precision: u32,
}

fn default_native_id() -> String {
    "1.3.0".to_string()
}

fn default_native_symbol() -> String {
    "CORE".to_string()
}

fn default_native_precision() -> u32 {
    5
}

#[derive(Debug, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// An asset as configured: chain id, display symbol, precision digits.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetConfig {
    pub id: String,
    pub symbol: String,
    pub precision: u32,
}

impl From<AssetConfig> for Asset {
    fn from(a: AssetConfig) -> Self {
        Asset::new(a.id, a.symbol, a.precision)
    }
}

/// A value that may arrive as a number or a string form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(f64),
    Text(String),
}

/// Raw bot section, before resolution.
#[derive(Debug, Deserialize)]
pub struct BotSettings {
    pub asset_a: AssetConfig,
    pub asset_b: AssetConfig,
    /// Number, or `"pool"` / `"market"` / `"auto"`.
    pub start_price: NumberOrText,
    /// Number, or `"Nx"` meaning `start_price / N`.
    pub min_price: NumberOrText,
    /// Number, or `"Nx"` meaning `start_price * N`.
    pub max_price: NumberOrText,
    pub increment_percent: f64,
    pub target_spread_percent: f64,
    pub active_orders: SidePair<usize>,
    /// Absolute amount in display units, or `"P%"` of the free balance.
    pub bot_funds: SidePair<NumberOrText>,
    #[serde(default = "default_weights")]
    pub weight_distribution: SidePair<f64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Explicit derivation mode; must agree with a string `start_price`.
    #[serde(default)]
    pub price_mode: Option<String>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub trade_log_path: Option<PathBuf>,
}

/// Buy/sell pair as written in the config file.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SidePair<T> {
    pub buy: T,
    pub sell: T,
}

impl<T: Clone> SidePair<T> {
    fn to_side_map(&self) -> SideMap<T> {
        SideMap::new(self.buy.clone(), self.sell.clone())
    }
}

fn default_weights() -> SidePair<f64> {
    SidePair {
        buy: 1.0,
        sell: 1.0,
    }
}

fn default_active() -> bool {
    true
}

impl Settings {
    /// Load from a file plus `APP_*` environment overrides.
    pub fn load(config_path: &str) -> EngineResult<Self> {
        let raw = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        raw.try_deserialize()
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}

/// Where the ladder center comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartPriceSpec {
    Absolute(f64),
    Derived(PriceMode),
}

/// A ladder bound: absolute, or a multiple of the start price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceBound {
    Absolute(f64),
    Multiple(f64),
}

/// A side's capital allocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FundSpec {
    /// Use everything free.
    All,
    /// Absolute amount in display units of the side's sold asset.
    Absolute(f64),
    /// Percentage of the free balance at startup.
    Percent(f64),
}

/// Fully validated bot configuration, ready for the engine.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub pair: Pair,
    pub native_asset: Asset,
    pub start_price: StartPriceSpec,
    pub min_price: PriceBound,
    pub max_price: PriceBound,
    pub increment_percent: f64,
    pub target_spread_percent: f64,
    pub active_orders: SideMap<usize>,
    pub bot_funds: SideMap<FundSpec>,
    pub weight_distribution: SideMap<f64>,
    pub dry_run: bool,
    pub active: bool,
    pub snapshot_path: Option<PathBuf>,
    pub trade_log_path: Option<PathBuf>,
}

impl BotConfig {
    /// Resolve and validate the raw settings.
    pub fn from_settings(settings: &Settings) -> EngineResult<Self> {
        let bot = &settings.bot;
        let pair = Pair::new(bot.asset_a.clone().into(), bot.asset_b.clone().into());
        let native_asset = Asset::new(
            settings.network.native_asset_id.clone(),
            settings.network.native_asset_symbol.clone(),
            settings.network.native_asset_precision,
        );

        let start_price = parse_start_price(&bot.start_price)?;

        // One unambiguous source for price derivation: an explicit
        // price_mode must agree with a string start_price, and a numeric
        // start_price leaves nothing for price_mode to govern.
        if let Some(mode_text) = &bot.price_mode {
            let mode: PriceMode = mode_text.parse()?;
            match start_price {
                StartPriceSpec::Derived(from_start) if from_start != mode => {
                    return Err(EngineError::InvalidConfig(format!(
                        "start_price requests '{from_start:?}' derivation but price_mode says '{mode:?}'"
                    )));
                }
                StartPriceSpec::Absolute(_) => {
                    return Err(EngineError::InvalidConfig(
                        "price_mode set together with a numeric start_price; drop one".into(),
                    ));
                }
                _ => {}
            }
        }

        let config = Self {
            pair,
            native_asset,
            start_price,
            min_price: parse_bound(&bot.min_price, "min_price")?,
            max_price: parse_bound(&bot.max_price, "max_price")?,
            increment_percent: bot.increment_percent,
            target_spread_percent: bot.target_spread_percent,
            active_orders: bot.active_orders.to_side_map(),
            bot_funds: SideMap::new(
                parse_funds(&bot.bot_funds.buy)?,
                parse_funds(&bot.bot_funds.sell)?,
            ),
            weight_distribution: bot.weight_distribution.to_side_map(),
            dry_run: bot.dry_run,
            active: bot.active,
            snapshot_path: bot.snapshot_path.clone(),
            trade_log_path: bot.trade_log_path.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fatal-at-startup checks that do not need the exchange.
    pub fn validate(&self) -> EngineResult<()> {
        if self.pair.base.id == self.pair.quote.id {
            return Err(EngineError::InvalidConfig(
                "asset_a and asset_b must differ".into(),
            ));
        }
        if self.increment_percent <= 0.0 || self.increment_percent >= 100.0 {
            return Err(EngineError::InvalidConfig(format!(
                "increment_percent must be in (0, 100), got {}",
                self.increment_percent
            )));
        }
        if self.target_spread_percent < 0.0 {
            return Err(EngineError::InvalidConfig(
                "target_spread_percent must be non-negative".into(),
            ));
        }
        for side in [Side::Buy, Side::Sell] {
            if self.active_orders[side] == 0 {
                return Err(EngineError::InvalidConfig(format!(
                    "active_orders.{side} must be at least 1"
                )));
            }
            let w = self.weight_distribution[side];
            if !(0.0..=1.0).contains(&w) {
                return Err(EngineError::InvalidConfig(format!(
                    "weight_distribution.{side} must be in [0, 1], got {w}"
                )));
            }
            if let FundSpec::Percent(p) = self.bot_funds[side] {
                if !(0.0..=100.0).contains(&p) {
                    return Err(EngineError::InvalidConfig(format!(
                        "bot_funds.{side} percentage must be in [0, 100], got {p}"
                    )));
                }
            }
            if let FundSpec::Absolute(a) = self.bot_funds[side] {
                if a <= 0.0 {
                    return Err(EngineError::InvalidConfig(format!(
                        "bot_funds.{side} must be positive"
                    )));
                }
            }
        }
        if let StartPriceSpec::Absolute(p) = self.start_price {
            if !p.is_finite() || p <= 0.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "start_price must be finite and positive, got {p}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the ladder geometry, deriving the start price if configured.
    pub async fn resolve_geometry<E: Exchange + ?Sized>(
        &self,
        exchange: &E,
    ) -> EngineResult<GridGeometry> {
        let start_price = match self.start_price {
            StartPriceSpec::Absolute(p) => p,
            StartPriceSpec::Derived(mode) => derive_price(exchange, &self.pair, mode).await?,
        };
        let min_price = match self.min_price {
            PriceBound::Absolute(p) => p,
            PriceBound::Multiple(m) => start_price / m,
        };
        let max_price = match self.max_price {
            PriceBound::Absolute(p) => p,
            PriceBound::Multiple(m) => start_price * m,
        };
        let geometry = GridGeometry {
            start_price,
            min_price,
            max_price,
            increment_percent: self.increment_percent,
            target_spread_percent: self.target_spread_percent,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Resolve capital allocations against the free balances, in units.
    pub fn resolve_allocation(&self, free: SideMap<u64>) -> SideMap<Option<u64>> {
        let mut allocation = SideMap::new(None, None);
        for side in [Side::Buy, Side::Sell] {
            let asset = self.pair.asset_sold(side);
            allocation[side] = match self.bot_funds[side] {
                FundSpec::All => None,
                FundSpec::Absolute(amount) => Some(asset.to_units(amount)),
                FundSpec::Percent(p) => Some(((free[side] as f64) * p / 100.0).round() as u64),
            };
        }
        allocation
    }
}

fn parse_start_price(raw: &NumberOrText) -> EngineResult<StartPriceSpec> {
    match raw {
        NumberOrText::Number(p) => Ok(StartPriceSpec::Absolute(*p)),
        NumberOrText::Text(s) => Ok(StartPriceSpec::Derived(s.parse()?)),
    }
}

fn parse_bound(raw: &NumberOrText, field: &str) -> EngineResult<PriceBound> {
    match raw {
        NumberOrText::Number(p) => {
            if *p <= 0.0 || !p.is_finite() {
                return Err(EngineError::InvalidConfig(format!(
                    "{field} must be finite and positive, got {p}"
                )));
            }
            Ok(PriceBound::Absolute(*p))
        }
        NumberOrText::Text(s) => {
            let trimmed = s.trim();
            let Some(number) = trimmed
                .strip_suffix('x')
                .or_else(|| trimmed.strip_suffix('X'))
            else {
                return Err(EngineError::InvalidConfig(format!(
                    "{field} '{s}' is neither a number nor an 'Nx' multiple"
                )));
            };
            let multiple: f64 = number.parse().map_err(|_| {
                EngineError::InvalidConfig(format!("{field} multiple '{s}' does not parse"))
            })?;
            if multiple <= 1.0 {
                return Err(EngineError::InvalidConfig(format!(
                    "{field} multiple must exceed 1, got {multiple}"
                )));
            }
            Ok(PriceBound::Multiple(multiple))
        }
    }
}

fn parse_funds(raw: &NumberOrText) -> EngineResult<FundSpec> {
    match raw {
        NumberOrText::Number(amount) => Ok(FundSpec::Absolute(*amount)),
        NumberOrText::Text(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("all") {
                return Ok(FundSpec::All);
            }
            let Some(number) = trimmed.strip_suffix('%') else {
                return Err(EngineError::InvalidConfig(format!(
                    "bot_funds '{s}' is neither a number, 'all', nor a percentage"
                )));
            };
            let percent: f64 = number.parse().map_err(|_| {
                EngineError::InvalidConfig(format!("bot_funds percentage '{s}' does not parse"))
            })?;
            Ok(FundSpec::Percent(percent))
        }
    }
}
