use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two independent credit balances.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Daily,
    Regular,
}

/// Balance record of one user.
///
/// `daily_credits` only counts while `daily_plan_expiry` lies in the future.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(default)]
    pub regular_credits: u64,
    #[serde(default)]
    pub daily_credits: u64,
    #[serde(default)]
    pub daily_plan_expiry: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_bonus_date: Option<DateTime<Utc>>,
}

impl Account {
    pub fn is_daily_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.daily_plan_expiry, Some(expiry) if expiry > now)
    }

    pub fn effective_daily(&self, now: DateTime<Utc>) -> u64 {
        if self.is_daily_active(now) {
            self.daily_credits
        } else {
            0
        }
    }

    pub fn pool(&self, pool: PoolType) -> u64 {
        match pool {
            PoolType::Daily => self.daily_credits,
            PoolType::Regular => self.regular_credits,
        }
    }

    pub fn pool_mut(&mut self, pool: PoolType) -> &mut u64 {
        match pool {
            PoolType::Daily => &mut self.daily_credits,
            PoolType::Regular => &mut self.regular_credits,
        }
    }

    pub fn is_daily_stale(&self, now: DateTime<Utc>) -> bool {
        matches!(self.daily_plan_expiry, Some(expiry) if expiry <= now)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Free,
    Daily,
    Regular,
}

impl Classification {
    pub fn pool(self) -> Option<PoolType> {
        match self {
            Classification::Free => None,
            Classification::Daily => Some(PoolType::Daily),
            Classification::Regular => Some(PoolType::Regular),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CreditCheck {
    pub allowed: bool,
    pub cost: u64,
    #[serde(rename = "type")]
    pub classification: Classification,
}

/// Pool-selection policy: free when cost is zero, the daily pool when the
/// plan is active and covers the cost, the regular pool otherwise.
pub fn can_use(account: &Account, cost: u64, now: DateTime<Utc>) -> CreditCheck {
    if cost == 0 {
        return CreditCheck {
            allowed: true,
            cost: 0,
            classification: Classification::Free,
        };
    }

    if account.is_daily_active(now) && account.daily_credits >= cost {
        return CreditCheck {
            allowed: true,
            cost,
            classification: Classification::Daily,
        };
    }

    CreditCheck {
        allowed: account.regular_credits >= cost,
        cost,
        classification: Classification::Regular,
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Daily,
    Regular,
    Refund,
}

impl From<PoolType> for HistoryKind {
    fn from(pool: PoolType) -> Self {
        match pool {
            PoolType::Daily => HistoryKind::Daily,
            PoolType::Regular => HistoryKind::Regular,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpendingHistoryEntry {
    pub amount: u64,
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub feature: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl SpendingHistoryEntry {
    pub fn debit(amount: u64, pool: PoolType, feature: &str, now: DateTime<Utc>) -> Self {
        Self {
            amount,
            kind: pool.into(),
            feature: feature.to_string(),
            timestamp: now,
            description: format!("AI usage: {feature}"),
        }
    }

    pub fn refund(amount: u64, feature: &str, now: DateTime<Utc>) -> Self {
        Self {
            amount,
            kind: HistoryKind::Refund,
            feature: feature.to_string(),
            timestamp: now,
            description: format!("Refund: {feature}"),
        }
    }
}

/// Effective balance as shown to the user.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub regular_credits: u64,
    pub daily_credits: u64,
    pub is_daily_plan_active: bool,
    pub daily_plan_expiry: Option<DateTime<Utc>>,
    pub last_bonus_date: Option<DateTime<Utc>>,
}

impl BalanceView {
    pub fn of(account: &Account, now: DateTime<Utc>) -> Self {
        Self {
            regular_credits: account.regular_credits,
            daily_credits: account.effective_daily(now),
            is_daily_plan_active: account.is_daily_active(now),
            daily_plan_expiry: account.daily_plan_expiry,
            last_bonus_date: account.last_bonus_date,
        }
    }
}
