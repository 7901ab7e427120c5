use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::{error_response, AppState, ErrorResponse};
use crate::services::ServiceError;

/// Authenticated user id of the current request, if any.
#[derive(Clone, Debug)]
pub struct Caller(pub Option<String>);

impl Caller {
    pub fn require(self) -> Result<String, ErrorResponse> {
        self.0.ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Authentication required" })),
            )
        })
    }
}

fn unauthorized(details: String) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Invalid token",
            "details": details
        })),
    )
        .into_response()
}

/// Resolves the bearer token, if one was sent, into a [`Caller`].
/// Requests without a token continue unauthenticated.
pub async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let header = match request.headers().get(AUTHORIZATION) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(value) => Some(value.to_string()),
            Err(e) => return unauthorized(e.to_string()),
        },
    };

    let caller = match header {
        None => Caller(None),
        Some(header) => {
            let Some(token) = header.strip_prefix("Bearer ") else {
                return unauthorized("expected a bearer token".to_string());
            };
            match state.verifier.verify(token.trim()).await {
                Ok(user_id) => Caller(Some(user_id)),
                Err(e) => {
                    log::warn!("Token verification failed: {}", e);
                    return unauthorized(e.to_string());
                }
            }
        }
    };

    request.extensions_mut().insert(caller);
    next.run(request).await
}

/// Header trusted backends use to present the shared webhook secret.
pub const SERVICE_SECRET_HEADER: &str = "x-service-secret";

/// Guards the internal routes. Only callers holding the configured webhook
/// secret get through; user bearer tokens are not accepted here.
pub async fn require_service_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let accepted = match request.headers().get(SERVICE_SECRET_HEADER) {
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Service secret required" })),
            )
                .into_response()
        }
        Some(value) => {
            !state.service_secret.is_empty()
                && value.as_bytes() == state.service_secret.as_bytes()
        }
    };

    if !accepted {
        log::warn!("Rejected internal call with a wrong service secret.");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Invalid service secret" })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Counts the request against the caller's rate window. Only layered on
/// costed routes.
pub async fn throttle(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let user_id = request
        .extensions()
        .get::<Caller>()
        .and_then(|caller| caller.0.clone());

    if let Err(e) = state.throttle.allow(user_id.as_deref()).await {
        return error_response(ServiceError::from(e)).into_response();
    }

    next.run(request).await
}
