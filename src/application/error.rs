use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{Cents, StatementId, TransferId, UserId};
use crate::storage::Unavailable;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Statement not found: {0}")]
    StatementNotFound(StatementId),

    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Insufficient funds for user {user_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        user_id: UserId,
        balance: Cents,
        required: Cents,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot transfer to the same user: {0}")]
    SelfTransfer(UserId),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl AppError {
    /// Only transient infrastructure failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_))
    }

    /// Classify a store failure as transient (`StoreUnavailable`) or not (`Database`).
    pub fn from_store(err: anyhow::Error) -> Self {
        if let Some(unavailable) = err.downcast_ref::<Unavailable>() {
            return AppError::StoreUnavailable(unavailable.0.clone());
        }

        if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
            let transient = match sqlx_err {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| is_sqlite_busy(&code)),
                _ => false,
            };
            if transient {
                return AppError::StoreUnavailable(format!("{:#}", err));
            }
        }

        AppError::Database(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::from_store(err)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_sqlite_busy(code: &str) -> bool {
    code.parse::<i32>()
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Reject non-positive amounts before any other check runs.
pub fn ensure_positive(amount_cents: Cents) -> Result<(), AppError> {
    if amount_cents <= 0 {
        return Err(AppError::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount_cents
        )));
    }
    Ok(())
}

/// Run a store operation with an upper bound on how long it may take.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: F) -> Result<T, AppError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result.map_err(AppError::from_store),
        Err(_) => Err(AppError::StoreUnavailable(format!(
            "store did not respond within {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_positive() {
        assert!(ensure_positive(1).is_ok());
        assert!(matches!(ensure_positive(0), Err(AppError::InvalidAmount(_))));
        assert!(matches!(ensure_positive(-10), Err(AppError::InvalidAmount(_))));
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let err = AppError::from_store(Unavailable("offline".into()).into());
        assert!(matches!(err, AppError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_context_is_preserved_when_classifying() {
        let err = anyhow::Error::new(sqlx::Error::PoolTimedOut).context("Failed to list statements");
        assert!(AppError::from_store(err).is_retryable());
    }

    #[test]
    fn test_other_failures_are_not_retryable() {
        let err = AppError::from_store(anyhow::anyhow!("constraint violated"));
        assert!(matches!(err, AppError::Database(_)));
        assert!(!err.is_retryable());
        assert!(!AppError::UserNotFound(uuid::Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn test_sqlite_busy_codes() {
        assert!(is_sqlite_busy("5"));
        assert!(is_sqlite_busy("517"));
        assert!(is_sqlite_busy("6"));
        assert!(!is_sqlite_busy("19"));
        assert!(!is_sqlite_busy("not-a-code"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), AppError> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    }
}
