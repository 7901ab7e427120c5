use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::saga::SpendSaga;
use super::{RequestHandler, Service, ServiceError};
use crate::errors::SagaError;
use crate::repositories::generation::GenerationRepository;

pub enum GenerationRequest {
    Generate {
        user_id: String,
        feature: String,
        payload: Value,
        response: oneshot::Sender<Result<Value, ServiceError>>,
    },
}

/// Runs paid generation calls through the spend saga, bounding each call so
/// a hung upstream turns into a refund instead of a held debit.
#[derive(Clone)]
pub struct GenerationRequestHandler {
    saga: SpendSaga,
    repository: GenerationRepository,
    timeout: Duration,
}

impl GenerationRequestHandler {
    pub fn new(saga: SpendSaga, repository: GenerationRepository, timeout: Duration) -> Self {
        GenerationRequestHandler {
            saga,
            repository,
            timeout,
        }
    }

    async fn generate(
        &self,
        user_id: &str,
        feature: &str,
        payload: Value,
    ) -> Result<Value, ServiceError> {
        let result = self
            .saga
            .execute_with_credits(user_id, feature, || async {
                match tokio::time::timeout(self.timeout, self.repository.generate(feature, payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {:?}", self.timeout)),
                }
            })
            .await;

        match result {
            Ok(content) => Ok(content),
            Err(SagaError::Credits(e)) => Err(ServiceError::Credits(e)),
            Err(SagaError::Operation(e)) => Err(ServiceError::Operation(e.to_string())),
        }
    }
}

#[async_trait]
impl RequestHandler<GenerationRequest> for GenerationRequestHandler {
    async fn handle_request(&self, request: GenerationRequest) {
        match request {
            GenerationRequest::Generate {
                user_id,
                feature,
                payload,
                response,
            } => {
                let content = self.generate(&user_id, &feature, payload).await;
                let _ = response.send(content);
            }
        }
    }
}

pub struct GenerationService;

impl GenerationService {
    pub fn new() -> Self {
        GenerationService {}
    }
}

#[async_trait]
impl Service<GenerationRequest, GenerationRequestHandler> for GenerationService {}
