use crate::domain::ids::LessonId;
use crate::domain::payment::PaymentStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Lesson {0} is not available for booking")]
    LessonNotAvailable(LessonId),
    #[error("Invalid payment transition from {from} to {to}")]
    InvalidTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("Card rejected by gateway (code {code})")]
    CardRejected { code: String },
    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds {
        balance: rust_decimal::Decimal,
        requested: rust_decimal::Decimal,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl SettlementError {
    /// Transient failures the caller (or the gateway's redelivery) may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GatewayUnavailable(_) | Self::Storage(_) => true,
            #[cfg(feature = "storage-rocksdb")]
            Self::RocksDb(_) => true,
            _ => false,
        }
    }

    /// Failures that are reported back to the end user as-is.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::StateConflict(_)
                | Self::LessonNotAvailable(_)
                | Self::CardRejected { .. }
                | Self::InsufficientFunds { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SettlementError>;
