use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use super::ledger::BalanceEngine;
use super::{RequestHandler, Service, ServiceError};
use crate::models::accounts::{BalanceView, CreditCheck, SpendingHistoryEntry};

pub enum CreditsRequest {
    GetBalance {
        user_id: String,
        response: oneshot::Sender<Result<BalanceView, ServiceError>>,
    },
    GetHistory {
        user_id: String,
        response: oneshot::Sender<Result<Vec<SpendingHistoryEntry>, ServiceError>>,
    },
    CanUse {
        user_id: String,
        feature: String,
        response: oneshot::Sender<Result<CreditCheck, ServiceError>>,
    },
    ActivateDailyPlan {
        user_id: String,
        amount: u64,
        response: oneshot::Sender<Result<DateTime<Utc>, ServiceError>>,
    },
    CheckDailyPlan {
        user_id: String,
        response: oneshot::Sender<Result<bool, ServiceError>>,
    },
    GrantPeriodicBonus {
        user_id: String,
        response: oneshot::Sender<Result<bool, ServiceError>>,
    },
}

#[derive(Clone)]
pub struct CreditsRequestHandler {
    engine: BalanceEngine,
}

impl CreditsRequestHandler {
    pub fn new(engine: BalanceEngine) -> Self {
        CreditsRequestHandler { engine }
    }
}

#[async_trait]
impl RequestHandler<CreditsRequest> for CreditsRequestHandler {
    async fn handle_request(&self, request: CreditsRequest) {
        match request {
            CreditsRequest::GetBalance { user_id, response } => {
                let balance = self.engine.balance(&user_id).await;
                let _ = response.send(balance.map_err(ServiceError::from));
            }
            CreditsRequest::GetHistory { user_id, response } => {
                let history = self.engine.history(&user_id).await;
                let _ = response.send(history.map_err(ServiceError::from));
            }
            CreditsRequest::CanUse {
                user_id,
                feature,
                response,
            } => {
                let check = self.engine.can_use_feature(&user_id, &feature).await;
                let _ = response.send(check.map_err(ServiceError::from));
            }
            CreditsRequest::ActivateDailyPlan {
                user_id,
                amount,
                response,
            } => {
                let expiry = self.engine.activate_daily_plan(&user_id, amount).await;
                let _ = response.send(expiry.map_err(ServiceError::from));
            }
            CreditsRequest::CheckDailyPlan { user_id, response } => {
                let active = self.engine.check_daily_plan(&user_id).await;
                let _ = response.send(active.map_err(ServiceError::from));
            }
            CreditsRequest::GrantPeriodicBonus { user_id, response } => {
                let granted = self.engine.grant_periodic_bonus(&user_id).await;
                let _ = response.send(granted.map_err(ServiceError::from));
            }
        }
    }
}

pub struct CreditsService;

impl CreditsService {
    pub fn new() -> Self {
        CreditsService {}
    }
}

#[async_trait]
impl Service<CreditsRequest, CreditsRequestHandler> for CreditsService {}
