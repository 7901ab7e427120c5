use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{RequestHandler, Service, ServiceError};
use crate::clock::Clock;
use crate::errors::Result;
use crate::models::payments::BonusOutcome;
use crate::models::referrals::{
    sanitize_nickname, ReferralHistoryEntry, ReferralRecord, ReferralStats, RegisterOutcome,
};
use crate::repositories::referrals::{BonusGrant, ReferralRepository};
use crate::repositories::store::push_key;

/// Referral registration and the one-time bonus paid on the referred
/// user's first payment.
#[derive(Clone)]
pub struct ReferralLedger {
    repository: ReferralRepository,
    clock: Arc<dyn Clock>,
    bonus_credits: u64,
}

impl ReferralLedger {
    pub fn new(repository: ReferralRepository, clock: Arc<dyn Clock>, bonus_credits: u64) -> Self {
        Self {
            repository,
            clock,
            bonus_credits,
        }
    }

    pub async fn register(
        &self,
        referrer_id: &str,
        referred_id: &str,
        nickname: &str,
    ) -> Result<RegisterOutcome> {
        if referrer_id == referred_id {
            log::warn!("Self-referral attempt by {} ignored.", referred_id);
            return Ok(RegisterOutcome::SelfReferral);
        }

        let now = self.clock.now();
        let record = ReferralRecord::pending(referrer_id, referred_id, nickname, now);
        let key = push_key(now);

        if self.repository.insert_pending(&key, &record).await? {
            log::info!("Referral {} registered: {} referred {}.", key, referrer_id, referred_id);
            Ok(RegisterOutcome::Registered)
        } else {
            log::debug!("{} already has a referral, keeping the first one.", referred_id);
            Ok(RegisterOutcome::AlreadyRegistered)
        }
    }

    /// Pays the referral bonus for `referred_id`'s first confirmed payment.
    /// Safe to call again for the same user or payment.
    pub async fn process_bonus(
        &self,
        referred_id: &str,
        payment_id: &str,
        nickname: &str,
    ) -> Result<BonusOutcome> {
        let not_granted = BonusOutcome {
            bonus_granted: false,
        };

        let Some(key) = self.repository.find_key_by_referred(referred_id).await? else {
            return Ok(not_granted);
        };
        let Some(record) = self.repository.get_referral(&key).await? else {
            log::warn!("Referral index for {} points at missing record {}.", referred_id, key);
            return Ok(not_granted);
        };
        if record.first_payment {
            return Ok(not_granted);
        }

        let now = self.clock.now();
        let history_key = push_key(now);
        let nickname = sanitize_nickname(nickname);
        let grant = BonusGrant {
            referred_id,
            payment_id,
            nickname: &nickname,
            credits: self.bonus_credits,
            history_key: &history_key,
            now,
        };

        match self
            .repository
            .complete_first_payment(&key, &record.referrer_id, &grant)
            .await?
        {
            Some(_) => {
                log::info!(
                    "Referral bonus of {} credits paid to {} and {} (payment {}).",
                    self.bonus_credits,
                    record.referrer_id,
                    referred_id,
                    payment_id
                );
                Ok(BonusOutcome {
                    bonus_granted: true,
                })
            }
            None => Ok(not_granted),
        }
    }

    pub async fn stats(&self, user_id: &str) -> Result<ReferralStats> {
        Ok(self.repository.get_stats(user_id).await?)
    }

    pub async fn referral_history(&self, user_id: &str) -> Result<Vec<ReferralHistoryEntry>> {
        Ok(self.repository.history(user_id).await?)
    }
}

pub enum ReferralRequest {
    Register {
        referrer_id: String,
        referred_id: String,
        nickname: String,
        response: oneshot::Sender<std::result::Result<RegisterOutcome, ServiceError>>,
    },
    ProcessBonus {
        referred_id: String,
        payment_id: String,
        nickname: String,
        response: oneshot::Sender<std::result::Result<BonusOutcome, ServiceError>>,
    },
    GetStats {
        user_id: String,
        response: oneshot::Sender<std::result::Result<(ReferralStats, Vec<ReferralHistoryEntry>), ServiceError>>,
    },
}

#[derive(Clone)]
pub struct ReferralRequestHandler {
    ledger: ReferralLedger,
}

impl ReferralRequestHandler {
    pub fn new(ledger: ReferralLedger) -> Self {
        ReferralRequestHandler { ledger }
    }

    async fn stats_with_history(
        &self,
        user_id: &str,
    ) -> Result<(ReferralStats, Vec<ReferralHistoryEntry>)> {
        let stats = self.ledger.stats(user_id).await?;
        let history = self.ledger.referral_history(user_id).await?;
        Ok((stats, history))
    }
}

#[async_trait]
impl RequestHandler<ReferralRequest> for ReferralRequestHandler {
    async fn handle_request(&self, request: ReferralRequest) {
        match request {
            ReferralRequest::Register {
                referrer_id,
                referred_id,
                nickname,
                response,
            } => {
                let outcome = self.ledger.register(&referrer_id, &referred_id, &nickname).await;
                let _ = response.send(outcome.map_err(ServiceError::from));
            }
            ReferralRequest::ProcessBonus {
                referred_id,
                payment_id,
                nickname,
                response,
            } => {
                let outcome = self
                    .ledger
                    .process_bonus(&referred_id, &payment_id, &nickname)
                    .await;
                let _ = response.send(outcome.map_err(ServiceError::from));
            }
            ReferralRequest::GetStats { user_id, response } => {
                let stats = self.stats_with_history(&user_id).await;
                let _ = response.send(stats.map_err(ServiceError::from));
            }
        }
    }
}

pub struct ReferralService;

impl ReferralService {
    pub fn new() -> Self {
        ReferralService {}
    }
}

#[async_trait]
impl Service<ReferralRequest, ReferralRequestHandler> for ReferralService {}
