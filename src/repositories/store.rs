//! Path-addressed document storage with optimistic compare-and-apply.
//!
//! Every document carries a version. A compare-and-apply reads the listed
//! paths, hands their current values to a caller-supplied pure function and
//! commits the function's output only if none of those paths changed in the
//! meantime; on conflict the function runs again against the fresh values.
//! The function may therefore be invoked several times per call and must not
//! have side effects beyond its return value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const DEFAULT_MAX_RETRIES: usize = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed document at {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("gave up on {paths:?} after {attempts} conflicting attempts")]
    Contention { paths: Vec<String>, attempts: usize },
    #[error("invalid path segment: {0:?}")]
    InvalidSegment(String),
    #[error("mutation returned {returned} values for {expected} paths")]
    Arity { expected: usize, returned: usize },
}

/// What a compare-and-apply function wants done with the values it saw.
#[derive(Debug)]
pub enum Apply {
    /// New value per listed path, in order; `None` deletes the path.
    Commit(Vec<Option<Value>>),
    /// Leave everything untouched.
    Abort,
}

#[derive(Debug)]
pub enum Outcome {
    Committed(Vec<Option<Value>>),
    /// Values that made the function abort.
    Aborted(Vec<Option<Value>>),
}

impl Outcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }
}

pub type ApplyFn<'a> = dyn Fn(&[Option<Value>]) -> Result<Apply, StoreError> + Send + Sync + 'a;

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Direct children of `path` as `(key, value)`, ordered by key.
    async fn children(&self, path: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Atomic multi-path write, last committed wins.
    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<(), StoreError>;

    async fn compare_and_apply_many(
        &self,
        paths: &[String],
        apply: &ApplyFn<'_>,
    ) -> Result<Outcome, StoreError>;

    async fn compare_and_apply(
        &self,
        path: &str,
        apply: &ApplyFn<'_>,
    ) -> Result<Outcome, StoreError> {
        self.compare_and_apply_many(&[path.to_string()], apply)
            .await
    }
}

pub fn decode<T: DeserializeOwned>(path: &str, value: Option<&Value>) -> Result<Option<T>, StoreError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|source| StoreError::Serde {
                path: path.to_string(),
                source,
            }),
    }
}

pub fn encode<T: Serialize>(path: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serde {
        path: path.to_string(),
        source,
    })
}

/// Key for an append-only list entry. Keys sort in creation order.
pub fn push_key(now: DateTime<Utc>) -> String {
    format!(
        "{:013}-{}",
        now.timestamp_millis().max(0),
        Uuid::new_v4().simple()
    )
}

/// Rejects identifiers that would escape their place in a path.
pub fn check_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') || segment.chars().any(char::is_control) {
        return Err(StoreError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

pub mod paths {
    pub fn account(user_id: &str) -> String {
        format!("users/{user_id}/account")
    }

    pub fn spending_history(user_id: &str) -> String {
        format!("users/{user_id}/spendingHistory")
    }

    pub fn spending_entry(user_id: &str, key: &str) -> String {
        format!("users/{user_id}/spendingHistory/{key}")
    }

    pub fn referral_stats(user_id: &str) -> String {
        format!("users/{user_id}/referralData")
    }

    pub fn referral_history(user_id: &str) -> String {
        format!("users/{user_id}/referralHistory")
    }

    pub fn referral_history_entry(user_id: &str, key: &str) -> String {
        format!("users/{user_id}/referralHistory/{key}")
    }

    pub fn referral(key: &str) -> String {
        format!("referrals/{key}")
    }

    pub fn referral_index(referred_id: &str) -> String {
        format!("referralsByReferred/{referred_id}")
    }

    pub fn payment_processed(payment_id: &str) -> String {
        format!("payments/{payment_id}/referralProcessed")
    }

    pub fn rate_window(user_id: &str) -> String {
        format!("rateLimits/{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn push_keys_sort_by_time() {
        let earlier = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        assert!(push_key(earlier) < push_key(later));
    }

    #[test]
    fn segments_with_separators_are_rejected() {
        assert!(check_segment("abc123").is_ok());
        assert!(check_segment("").is_err());
        assert!(check_segment("a/b").is_err());
    }

    #[test]
    fn null_decodes_as_absent() {
        let decoded: Option<u64> = decode("x", Some(&Value::Null)).unwrap();
        assert_eq!(decoded, None);
    }
}
