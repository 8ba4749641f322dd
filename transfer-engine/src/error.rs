//! Error types for the transfer engine

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for transfer engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transfer engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reservation rejected, nothing mutated
    #[error("Insufficient funds on {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Account the reservation targeted
        account: String,
        /// Amount requested (fee included)
        requested: Decimal,
        /// Available balance at the time of the request
        available: Decimal,
    },

    /// Event not accepted from the current status
    #[error("Invalid transition: {kind} cannot {event} from {status}")]
    InvalidTransition {
        /// Operation kind
        kind: &'static str,
        /// Current status
        status: String,
        /// Rejected event
        event: String,
    },

    /// Transition guard returned false
    #[error("Guard {guard} rejected {event} on {kind} in {status}")]
    GuardRejected {
        /// Operation kind
        kind: &'static str,
        /// Current status
        status: String,
        /// Rejected event
        event: String,
        /// Guard name
        guard: &'static str,
    },

    /// External call outcome unknown; operation parked for the sweep
    #[error("Relay outcome ambiguous for operation {0}")]
    RelayAmbiguous(Uuid),

    /// Retry budget exhausted, manual intervention required
    #[error("Permanent failure of operation {operation_id} after {attempts} attempts")]
    PermanentFailure {
        /// Parked operation
        operation_id: Uuid,
        /// Attempts made
        attempts: u32,
    },

    /// Relay already running for this operation
    #[error("Relay already in flight for operation {0}")]
    AlreadyInFlight(Uuid),

    /// Operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),

    /// A hook failed after or before the status write
    #[error("Hook error: {0}")]
    Hook(String),

    /// The transition committed but some of its follow-up work failed; it is
    /// retried by the next settle pass
    #[error("Follow-up of operation {operation_id} failed: {reason}")]
    FollowUpFailed {
        /// Operation whose transition queued the follow-up
        operation_id: Uuid,
        /// First failure
        reason: String,
    },

    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(ledger_core::Error),

    /// Settlement gateway or event publisher failure
    #[error("External error: {0}")]
    External(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::GuardRejected { .. } => "GUARD_REJECTED",
            Error::RelayAmbiguous(_) => "RELAY_AMBIGUOUS",
            Error::PermanentFailure { .. } => "PERMANENT_FAILURE",
            Error::AlreadyInFlight(_) => "ALREADY_IN_FLIGHT",
            Error::OperationNotFound(_) => "OPERATION_NOT_FOUND",
            Error::Hook(_) => "HOOK_ERROR",
            Error::FollowUpFailed { .. } => "FOLLOW_UP_FAILED",
            Error::Ledger(_) => "LEDGER_ERROR",
            Error::External(_) => "EXTERNAL_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Ledger(ledger_core::Error::Storage(_)) | Error::External(_) | Error::Io(_)
        )
    }
}

impl From<ledger_core::Error> for Error {
    fn from(err: ledger_core::Error) -> Self {
        match err {
            ledger_core::Error::InsufficientFunds {
                account,
                requested,
                available,
            } => Error::InsufficientFunds {
                account,
                requested,
                available,
            },
            ledger_core::Error::InvalidAmount(msg) | ledger_core::Error::InvalidAccount(msg) => {
                Error::Validation(msg)
            }
            other => Error::Ledger(other),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
