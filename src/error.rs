//! Error taxonomy for settlement operations

use rust_decimal::Decimal;
use thiserror::Error;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    /// A stored value that no longer decodes (bad decimal, timestamp, enum tag)
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::FromSqlConversionFailure(column, _, source) => {
                StoreError::Corrupt(format!("column {}: {}", column, source))
            }
            other => StoreError::Sqlite(other),
        }
    }
}

/// Errors surfaced at the operation boundary
#[derive(Error, Debug)]
pub enum TradeError {
    #[error("{0}")]
    Validation(String),

    #[error("Insufficient funds: need {required_usdt} USDT and {required_oil} OIL, have {available_usdt} USDT and {available_oil} OIL")]
    InsufficientFunds {
        required_usdt: Decimal,
        available_usdt: Decimal,
        required_oil: Decimal,
        available_oil: Decimal,
    },

    #[error("Rate limited: at most {max} positions per {window_secs}s, try again shortly")]
    RateLimited { max: u32, window_secs: u64 },

    #[error("Price unavailable for {0}, try again")]
    PriceUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Reward for period {0} already claimed")]
    AlreadyClaimed(String),

    #[error("Claim window is not open yet (opens at {reset_hour:02}:00 UTC)")]
    NotWithinClaimWindow { reset_hour: u32 },

    #[error("No rewards available for period {0}")]
    NoRewardsAvailable(String),

    #[error("Period {requested} is not claimable, the claimable period is {claimable}")]
    PeriodNotClaimable { requested: String, claimable: String },

    #[error("Authentication required")]
    Unauthorized,

    #[error("A linked wallet address is required")]
    WalletNotLinked,

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl TradeError {
    /// Message safe to return to callers; storage internals stay in the log
    pub fn user_message(&self) -> String {
        match self {
            TradeError::Storage(_) => "Internal error, please try again".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradeError::RateLimited { .. } | TradeError::PriceUnavailable(_) | TradeError::Storage(_)
        )
    }
}

impl From<rusqlite::Error> for TradeError {
    fn from(e: rusqlite::Error) -> Self {
        TradeError::Storage(StoreError::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_storage_error_is_masked() {
        let err = TradeError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.user_message(), "Internal error, please try again");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_conversion_failure_is_corrupt_row() {
        let raw = rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            "invalid decimal".into(),
        );
        match StoreError::from(raw) {
            StoreError::Corrupt(msg) => assert_eq!(msg, "column 3: invalid decimal"),
            other => panic!("unexpected {:?}", other),
        }

        let err = TradeError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, TradeError::Storage(StoreError::Sqlite(_))));
        assert_eq!(err.user_message(), "Internal error, please try again");
    }

    #[test]
    fn test_insufficient_funds_reports_amounts() {
        let err = TradeError::InsufficientFunds {
            required_usdt: dec!(100),
            available_usdt: dec!(40),
            required_oil: dec!(1000),
            available_oil: dec!(1000),
        };
        let msg = err.user_message();
        assert!(msg.contains("100 USDT"));
        assert!(msg.contains("40 USDT"));
        assert!(!err.is_retryable());
    }
}
