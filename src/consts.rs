//! Engine-wide tuning constants.
//!
//! Every threshold that appears in more than one subsystem lives here so the
//! strategy, accountant, and reconciler cannot drift apart on what "dust" or
//! "tolerance" means.

/// Minimum width of the spread gap, in slots.
///
/// Consumers: grid model (gap computation), strategy (role reassignment).
pub const MIN_SPREAD_ORDERS: usize = 2;

/// The target spread is floored at `increment_percent * MIN_SPREAD_FACTOR`.
///
/// Consumers: grid model (gap computation), config validation.
pub const MIN_SPREAD_FACTOR: f64 = 2.0;

/// A partial order below this percentage of its ideal size is "dust".
///
/// Dust partials are merged back to ideal instead of being treated as healthy
/// inventory. Consumers: strategy (classification, dual-dust trigger),
/// reconciler (post-sync consolidation check).
pub const DUST_THRESHOLD_PCT: f64 = 5.0;

/// Relative tolerance for fund-ledger drift checks (0.1%).
///
/// Consumers: accountant (I1/I2 checks), reconciler (order matching by size).
pub const DRIFT_EPSILON: f64 = 0.001;

/// Hard cap on recovery attempts within a single cycle window.
pub const RECOVERY_MAX_ATTEMPTS: u32 = 3;

/// Minimum pause between two recovery attempts, in milliseconds.
pub const RECOVERY_COOLDOWN_MS: u64 = 2_000;

/// Quiescent interval after which the recovery attempt counter resets.
pub const RECOVERY_DECAY_WINDOW_MS: u64 = 60_000;

/// Creation fees held back from `available` when one side is the native fee
/// asset, expressed as a number of operations.
pub const FEE_RESERVE_OPS: u64 = 12;

/// Deadline for a single external I/O operation.
pub const IO_TIMEOUT_MS: u64 = 10_000;

/// Read-side exchange calls are retried up to this many times.
pub const MAX_IO_RETRIES: u32 = 5;

/// Base delay for exponential backoff between I/O retries.
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Inter-cycle timer period for the engine run loop, in seconds.
pub const CYCLE_TICK_SECS: u64 = 5;

/// Snapshot autosave period, in seconds.
pub const SNAPSHOT_INTERVAL_SECS: u64 = 30;

/// Consecutive failed cycles before the run loop gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
