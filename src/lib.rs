#![deny(unreachable_pub)]

//! Grid market-making engine for decentralized limit-order exchanges.
//!
//! The engine maintains a dense ladder of on-book limit orders around a
//! moving reference price, reacts to fills by crawling the ladder boundary
//! toward the market, and keeps the union of on-book commitments and free
//! balances reconciled against the authoritative exchange state.

pub mod config;
pub mod consts;
pub mod errors;
pub mod exchange;
pub mod fees;
pub mod grid;
pub mod units;

pub use config::{BotConfig, Settings};
pub use errors::{EngineError, EngineResult};
pub use exchange::{derive_price, Exchange, PriceMode};
pub use fees::{FeeParams, FeeTable};
pub use grid::{Fill, GridEngine};
pub use units::{Asset, Pair, Side, SideMap};
