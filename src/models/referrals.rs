use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NICKNAME_MAX_CHARS: usize = 50;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Completed,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRecord {
    pub referrer_id: String,
    pub referred_id: String,
    pub referred_nickname: String,
    pub timestamp: DateTime<Utc>,
    pub status: ReferralStatus,
    pub first_payment: bool,
}

impl ReferralRecord {
    pub fn pending(
        referrer_id: &str,
        referred_id: &str,
        nickname: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            referrer_id: referrer_id.to_string(),
            referred_id: referred_id.to_string(),
            referred_nickname: sanitize_nickname(nickname),
            timestamp: now,
            status: ReferralStatus::Pending,
            first_payment: false,
        }
    }

    pub fn complete(mut self) -> Self {
        self.status = ReferralStatus::Completed;
        self.first_payment = true;
        self
    }
}

/// Per-referrer counters.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    #[serde(default)]
    pub total_indications: u64,
    #[serde(default)]
    pub completed_payments: u64,
    #[serde(default)]
    pub total_credits: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReferralHistoryEntry {
    pub nickname: String,
    pub timestamp: DateTime<Utc>,
    pub credits: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
    SelfReferral,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReferral {
    pub referrer_id: String,
    #[serde(default)]
    pub nickname: String,
}

pub fn sanitize_nickname(nickname: &str) -> String {
    nickname.trim().chars().take(NICKNAME_MAX_CHARS).collect()
}
