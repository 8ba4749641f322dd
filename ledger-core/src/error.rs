//! Error types for the ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Amount was zero, negative or otherwise unusable
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Account key cannot be stored (empty or contains separators)
    #[error("Invalid account: {0}")]
    InvalidAccount(String),

    /// Reservation rejected; nothing was mutated
    #[error("Insufficient funds on {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Account the reservation targeted
        account: String,
        /// Amount requested
        requested: Decimal,
        /// Available balance at the time of the request
        available: Decimal,
    },

    /// Release exceeds frozen funds or the operation's reservation
    #[error("Invalid release: {0}")]
    InvalidRelease(String),

    /// Settle exceeds frozen funds or the operation's reservation
    #[error("Invalid settle: {0}")]
    InvalidSettle(String),

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Invariant violation (frozen above balance, replay mismatch)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
