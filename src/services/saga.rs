use std::fmt::Display;
use std::future::Future;

use crate::errors::SagaError;
use crate::services::ledger::BalanceEngine;

/// Debit, perform, refund-on-failure around a paid unit of work.
///
/// Every call ends either charged and delivered, or charged, refunded and
/// not delivered. There is no timeout here: a hung operation keeps its debit
/// until it resolves, so callers that need bounded latency wrap the
/// operation in their own timeout and report the elapse as an error.
#[derive(Clone)]
pub struct SpendSaga {
    engine: BalanceEngine,
}

impl SpendSaga {
    pub fn new(engine: BalanceEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &BalanceEngine {
        &self.engine
    }

    pub async fn execute_with_credits<T, E, F, Fut>(
        &self,
        user_id: &str,
        feature: &str,
        operation: F,
    ) -> Result<T, SagaError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let cost = self.engine.cost_of(feature);
        self.execute_with_cost(user_id, cost, feature, operation)
            .await
    }

    pub async fn execute_with_cost<T, E, F, Fut>(
        &self,
        user_id: &str,
        cost: u64,
        feature: &str,
        operation: F,
    ) -> Result<T, SagaError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.engine.deduct(user_id, cost, feature).await?;

        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };

        log::warn!(
            "{} failed for {} after debit of {} credits: {}",
            feature,
            user_id,
            cost,
            error
        );

        if cost > 0 {
            if let Err(refund_error) = self.engine.refund(user_id, cost, feature).await {
                log::error!(
                    "CRITICAL: refund failed, debit without service. user={} feature={} cost={} operation_error=\"{}\" refund_error=\"{}\"",
                    user_id,
                    feature,
                    cost,
                    error,
                    refund_error
                );
            }
        }

        Err(SagaError::Operation(error))
    }
}
