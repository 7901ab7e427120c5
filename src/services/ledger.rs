use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::errors::{CreditsError, Result};
use crate::models::accounts::{
    can_use, Account, BalanceView, Classification, CreditCheck, HistoryKind, PoolType,
    SpendingHistoryEntry,
};
use crate::repositories::accounts::{AccountMutation, AccountRepository};
use crate::repositories::store::push_key;
use crate::settings;

/// Price in credits of each named feature.
#[derive(Clone, Debug)]
pub struct FeatureCosts {
    costs: HashMap<String, u64>,
    default_cost: u64,
}

impl FeatureCosts {
    pub fn new(costs: HashMap<String, u64>, default_cost: u64) -> Self {
        Self {
            costs,
            default_cost,
        }
    }

    pub fn cost(&self, feature: &str) -> u64 {
        self.costs.get(feature).copied().unwrap_or(self.default_cost)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LedgerPolicy {
    pub daily_plan_duration: Duration,
    pub periodic_bonus_amount: u64,
    pub periodic_bonus_interval: Duration,
}

impl TryFrom<&settings::Credits> for LedgerPolicy {
    type Error = config::ConfigError;

    fn try_from(credits: &settings::Credits) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            daily_plan_duration: credits.daily_plan_duration()?,
            periodic_bonus_amount: credits.periodic_bonus_amount,
            periodic_bonus_interval: credits.periodic_bonus_interval()?,
        })
    }
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            daily_plan_duration: Duration::hours(24),
            periodic_bonus_amount: 10,
            periodic_bonus_interval: Duration::days(30),
        }
    }
}

#[derive(Clone)]
pub struct BalanceEngine {
    accounts: AccountRepository,
    costs: Arc<FeatureCosts>,
    clock: Arc<dyn Clock>,
    policy: LedgerPolicy,
}

impl BalanceEngine {
    pub fn new(
        accounts: AccountRepository,
        costs: FeatureCosts,
        clock: Arc<dyn Clock>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            accounts,
            costs: Arc::new(costs),
            clock,
            policy,
        }
    }

    pub fn cost_of(&self, feature: &str) -> u64 {
        self.costs.cost(feature)
    }

    /// Advisory pre-flight check; `deduct` makes the binding decision.
    pub fn can_use(&self, account: &Account, cost: u64) -> CreditCheck {
        can_use(account, cost, self.clock.now())
    }

    pub async fn can_use_feature(&self, user_id: &str, feature: &str) -> Result<CreditCheck> {
        let account = self.accounts.get_account(user_id).await?.unwrap_or_default();
        Ok(self.can_use(&account, self.cost_of(feature)))
    }

    /// Debits `cost` from the pool the selection policy picks, re-deciding the
    /// pool against the value being replaced, and records the debit in the
    /// same commit.
    pub async fn deduct(&self, user_id: &str, cost: u64, feature: &str) -> Result<Classification> {
        if cost == 0 {
            return Ok(Classification::Free);
        }

        let now = self.clock.now();
        let key = push_key(now);
        let mutation = self
            .accounts
            .mutate(user_id, Some(&key), |account| {
                let account = account?;
                let check = can_use(&account, cost, now);
                let pool = check.classification.pool()?;
                if !check.allowed {
                    return None;
                }

                let mut next = account;
                let balance = next.pool_mut(pool);
                *balance = balance.saturating_sub(cost);
                Some((next, Some(SpendingHistoryEntry::debit(cost, pool, feature, now))))
            })
            .await?;

        match mutation {
            AccountMutation::Committed { account, entry } => {
                let classification = match entry.map(|e| e.kind) {
                    Some(HistoryKind::Daily) => Classification::Daily,
                    _ => Classification::Regular,
                };
                log::info!(
                    "Debited {} credits from {} ({:?}) for {}. Balance: regular={}, daily={}.",
                    cost,
                    user_id,
                    classification,
                    feature,
                    account.regular_credits,
                    account.daily_credits
                );
                Ok(classification)
            }
            AccountMutation::Aborted(None) => {
                log::warn!("Debit for {} rejected: no account for {}.", feature, user_id);
                Err(CreditsError::AccountNotFound {
                    user_id: user_id.to_string(),
                })
            }
            AccountMutation::Aborted(Some(account)) => {
                log::warn!(
                    "Insufficient credits for {}: user={}, cost={}, regular={}, daily={} (active: {}).",
                    feature,
                    user_id,
                    cost,
                    account.regular_credits,
                    account.daily_credits,
                    account.is_daily_active(now)
                );
                Err(CreditsError::InsufficientFunds {
                    feature: feature.to_string(),
                    cost,
                })
            }
        }
    }

    /// Unconditional increment of one pool, creating the account if needed.
    pub async fn add(&self, user_id: &str, amount: u64, pool: PoolType) -> Result<Account> {
        let mutation = self
            .accounts
            .mutate(user_id, None, |account| {
                let mut next = account.unwrap_or_default();
                let balance = next.pool_mut(pool);
                *balance = balance.saturating_add(amount);
                Some((next, None))
            })
            .await?;

        Ok(committed(mutation))
    }

    /// Returns `amount` to the regular pool and records the refund.
    pub async fn refund(&self, user_id: &str, amount: u64, feature: &str) -> Result<Account> {
        if amount == 0 {
            return Ok(self.accounts.get_account(user_id).await?.unwrap_or_default());
        }

        let now = self.clock.now();
        let key = push_key(now);
        let mutation = self
            .accounts
            .mutate(user_id, Some(&key), |account| {
                let mut next = account.unwrap_or_default();
                next.regular_credits = next.regular_credits.saturating_add(amount);
                Some((next, Some(SpendingHistoryEntry::refund(amount, feature, now))))
            })
            .await?;

        log::info!("Refunded {} credits to {} for {}.", amount, user_id, feature);
        Ok(committed(mutation))
    }

    /// Resets the daily pool to `amount` and restarts the plan period.
    pub async fn activate_daily_plan(&self, user_id: &str, amount: u64) -> Result<DateTime<Utc>> {
        let expiry = self.clock.now() + self.policy.daily_plan_duration;
        self.accounts
            .mutate(user_id, None, |account| {
                let mut next = account.unwrap_or_default();
                next.daily_credits = amount;
                next.daily_plan_expiry = Some(expiry);
                Some((next, None))
            })
            .await?;

        log::info!("Daily plan for {} activated with {} credits until {}.", user_id, amount, expiry);
        Ok(expiry)
    }

    /// Reports whether the daily plan is active, clearing it the first time it
    /// is seen past its expiry.
    pub async fn check_daily_plan(&self, user_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let Some(account) = self.accounts.get_account(user_id).await? else {
            return Ok(false);
        };
        if account.is_daily_active(now) {
            return Ok(true);
        }
        if !account.is_daily_stale(now) {
            return Ok(false);
        }

        self.accounts
            .mutate(user_id, None, |account| {
                let account = account?;
                if !account.is_daily_stale(now) {
                    return None;
                }
                let mut next = account;
                next.daily_credits = 0;
                next.daily_plan_expiry = None;
                Some((next, None))
            })
            .await?;

        log::info!("Expired daily plan cleared for {}.", user_id);
        Ok(false)
    }

    /// Grants the periodic regular-credit bonus if none was granted within
    /// the configured interval. Returns whether credits were added.
    pub async fn grant_periodic_bonus(&self, user_id: &str) -> Result<bool> {
        let now = self.clock.now();
        let LedgerPolicy {
            periodic_bonus_amount: amount,
            periodic_bonus_interval: interval,
            ..
        } = self.policy;

        let mutation = self
            .accounts
            .mutate(user_id, None, |account| {
                let mut next = account.unwrap_or_default();
                let due = match next.last_bonus_date {
                    None => true,
                    Some(last) => now - last >= interval,
                };
                if !due {
                    return None;
                }
                next.regular_credits = next.regular_credits.saturating_add(amount);
                next.last_bonus_date = Some(now);
                Some((next, None))
            })
            .await?;

        let granted = matches!(mutation, AccountMutation::Committed { .. });
        if granted {
            log::info!("Periodic bonus of {} credits granted to {}.", amount, user_id);
        }
        Ok(granted)
    }

    pub async fn balance(&self, user_id: &str) -> Result<BalanceView> {
        let account = self.accounts.get_account(user_id).await?.unwrap_or_default();
        Ok(BalanceView::of(&account, self.clock.now()))
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<SpendingHistoryEntry>> {
        Ok(self.accounts.history(user_id).await?)
    }

    pub async fn account(&self, user_id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.get_account(user_id).await?)
    }
}

fn committed(mutation: AccountMutation) -> Account {
    match mutation {
        AccountMutation::Committed { account, .. } => account,
        AccountMutation::Aborted(account) => account.unwrap_or_default(),
    }
}
