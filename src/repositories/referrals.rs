use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::accounts::Account;
use crate::models::referrals::{ReferralHistoryEntry, ReferralRecord, ReferralStats};
use crate::repositories::store::{
    check_segment, decode, encode, paths, Apply, DocumentStore, Outcome, StoreError,
};

/// Everything a first-payment bonus writes, committed as one unit.
#[derive(Debug)]
pub struct BonusGrant<'a> {
    pub referred_id: &'a str,
    pub payment_id: &'a str,
    pub nickname: &'a str,
    pub credits: u64,
    pub history_key: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReferralRepository {
    store: Arc<dyn DocumentStore>,
}

impl ReferralRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Record key of the referral that brought `referred_id` in, if any.
    pub async fn find_key_by_referred(&self, referred_id: &str) -> Result<Option<String>, StoreError> {
        check_segment(referred_id)?;
        let path = paths::referral_index(referred_id);
        let value = self.store.get(&path).await?;
        decode(&path, value.as_ref())
    }

    pub async fn get_referral(&self, key: &str) -> Result<Option<ReferralRecord>, StoreError> {
        check_segment(key)?;
        let path = paths::referral(key);
        let value = self.store.get(&path).await?;
        decode(&path, value.as_ref())
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<ReferralStats, StoreError> {
        check_segment(user_id)?;
        let path = paths::referral_stats(user_id);
        let value = self.store.get(&path).await?;
        Ok(decode(&path, value.as_ref())?.unwrap_or_default())
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<ReferralHistoryEntry>, StoreError> {
        check_segment(user_id)?;
        let path = paths::referral_history(user_id);

        self.store
            .children(&path)
            .await?
            .into_iter()
            .filter_map(|(key, value)| {
                decode::<ReferralHistoryEntry>(&format!("{path}/{key}"), Some(&value)).transpose()
            })
            .collect()
    }

    /// Writes the uniqueness index, the pending record and the referrer's
    /// indication count together. Returns false, writing nothing, when the
    /// referred user already has a referral.
    pub async fn insert_pending(&self, key: &str, record: &ReferralRecord) -> Result<bool, StoreError> {
        check_segment(key)?;
        check_segment(&record.referrer_id)?;
        check_segment(&record.referred_id)?;

        let targets = [
            paths::referral_index(&record.referred_id),
            paths::referral(key),
            paths::referral_stats(&record.referrer_id),
        ];

        let apply = |values: &[Option<Value>]| -> Result<Apply, StoreError> {
            if !matches!(values[0], None | Some(Value::Null)) {
                return Ok(Apply::Abort);
            }
            let mut stats: ReferralStats = decode(&targets[2], values[2].as_ref())?.unwrap_or_default();
            stats.total_indications += 1;

            Ok(Apply::Commit(vec![
                Some(Value::String(key.to_string())),
                Some(encode(&targets[1], record)?),
                Some(encode(&targets[2], &stats)?),
            ]))
        };

        Ok(self.store.compare_and_apply_many(&targets, &apply).await?.is_committed())
    }

    /// Marks the referral completed and pays both parties in one write.
    /// Returns the completed record, or `None` if it was already completed
    /// (or vanished) by the time the write ran.
    pub async fn complete_first_payment(
        &self,
        key: &str,
        referrer_id: &str,
        grant: &BonusGrant<'_>,
    ) -> Result<Option<ReferralRecord>, StoreError> {
        check_segment(key)?;
        check_segment(referrer_id)?;
        check_segment(grant.referred_id)?;
        check_segment(grant.payment_id)?;
        check_segment(grant.history_key)?;

        let targets = [
            paths::referral(key),
            paths::account(referrer_id),
            paths::referral_stats(referrer_id),
            paths::referral_history_entry(referrer_id, grant.history_key),
            paths::account(grant.referred_id),
            paths::payment_processed(grant.payment_id),
        ];

        let apply = |values: &[Option<Value>]| -> Result<Apply, StoreError> {
            let Some(record) = decode::<ReferralRecord>(&targets[0], values[0].as_ref())? else {
                return Ok(Apply::Abort);
            };
            if record.first_payment || record.referrer_id != referrer_id {
                return Ok(Apply::Abort);
            }

            let mut referrer: Account = decode(&targets[1], values[1].as_ref())?.unwrap_or_default();
            referrer.regular_credits = referrer.regular_credits.saturating_add(grant.credits);

            let mut stats: ReferralStats = decode(&targets[2], values[2].as_ref())?.unwrap_or_default();
            stats.completed_payments += 1;
            stats.total_credits = stats.total_credits.saturating_add(grant.credits);

            let entry = ReferralHistoryEntry {
                nickname: grant.nickname.to_string(),
                timestamp: grant.now,
                credits: grant.credits,
            };

            let mut referred: Account = decode(&targets[4], values[4].as_ref())?.unwrap_or_default();
            referred.regular_credits = referred.regular_credits.saturating_add(grant.credits);

            Ok(Apply::Commit(vec![
                Some(encode(&targets[0], &record.complete())?),
                Some(encode(&targets[1], &referrer)?),
                Some(encode(&targets[2], &stats)?),
                Some(encode(&targets[3], &entry)?),
                Some(encode(&targets[4], &referred)?),
                Some(Value::Bool(true)),
            ]))
        };

        match self.store.compare_and_apply_many(&targets, &apply).await? {
            Outcome::Committed(values) => decode(&targets[0], values[0].as_ref()),
            Outcome::Aborted(_) => Ok(None),
        }
    }
}
