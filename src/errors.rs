//! Engine error types.

use thiserror::Error;

/// Errors that can occur anywhere in the engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Grid construction failed: {0}")]
    GridConstruction(String),

    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Exchange operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Recovery unavailable: {0}")]
    RecoveryDenied(String),

    #[error("Price derivation failed: {0}")]
    PriceDerivation(String),

    #[error("Fee schedule missing for asset: {0}")]
    FeeScheduleMissing(String),

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Bot is in invalid state for operation: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::StatePersistence(err.to_string())
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
