use thiserror::Error;

use super::stage::FundStage;

pub type FundResult<T> = std::result::Result<T, FundError>;

/// Failures of the fund engine. Every variant leaves the fund untouched.
#[derive(Debug, Error)]
pub enum FundError {
    #[error("cannot {action} from the {from} stage")]
    InvalidStageTransition {
        from: FundStage,
        action: &'static str,
    },

    #[error("{operation} is not allowed while the fund is in the {stage} stage")]
    InvalidStage {
        stage: FundStage,
        operation: &'static str,
    },

    #[error("insufficient shares: requested {requested}, available {available}")]
    InsufficientShares { requested: u64, available: u64 },

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("market adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),
}

impl From<rusqlite::Error> for FundError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            // u64 ids above i64::MAX cannot be bound as SQLite integers
            rusqlite::Error::ToSqlConversionFailure(e) => {
                FundError::Validation(format!("value out of storable range: {e}"))
            }
            other => FundError::Storage(other),
        }
    }
}

/// Taxonomy label carried in structured error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    InvalidStageTransition,
    InvalidStage,
    InsufficientShares,
    InsufficientBalance,
    ValidationError,
    NotFound,
    AdapterUnavailable,
    Internal,
}

impl FundError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FundError::InvalidStageTransition { .. } => ErrorKind::InvalidStageTransition,
            FundError::InvalidStage { .. } => ErrorKind::InvalidStage,
            FundError::InsufficientShares { .. } => ErrorKind::InsufficientShares,
            FundError::InsufficientBalance(_) => ErrorKind::InsufficientBalance,
            FundError::Validation(_) => ErrorKind::ValidationError,
            FundError::NotFound(_) => ErrorKind::NotFound,
            FundError::AdapterUnavailable(_) => ErrorKind::AdapterUnavailable,
            FundError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Only adapter failures are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FundError::AdapterUnavailable(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        FundError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        FundError::NotFound(what.into())
    }
}
