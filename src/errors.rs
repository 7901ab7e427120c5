use thiserror::Error;

use crate::repositories::store::StoreError;

pub type Result<T> = std::result::Result<T, CreditsError>;

/// Failures that cross the ledger boundary.
#[derive(Debug, Error)]
pub enum CreditsError {
    #[error("insufficient credits for {feature}: cost {cost}")]
    InsufficientFunds { feature: String, cost: u64 },
    #[error("no credit account for user {user_id}")]
    AccountNotFound { user_id: String },
    #[error("rate limit exceeded for user {user_id}")]
    RateLimited { user_id: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a paid call that did not deliver.
///
/// `Operation` carries the wrapped work's own error untouched; a failed
/// refund is logged by the saga and never shows up here.
#[derive(Debug, Error)]
pub enum SagaError<E> {
    #[error(transparent)]
    Credits(#[from] CreditsError),
    #[error("operation failed: {0}")]
    Operation(E),
}
