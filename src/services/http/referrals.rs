use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;

use super::auth::Caller;
use super::{dispatch, error_response, AppState};
use crate::models::payments::PaymentConfirmation;
use crate::models::referrals::{NewReferral, RegisterOutcome};
use crate::services::referrals::ReferralRequest;

pub async fn register(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<NewReferral>,
) -> impl IntoResponse {
    let referred_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.referral_channel, |response| ReferralRequest::Register {
        referrer_id: body.referrer_id,
        referred_id,
        nickname: body.nickname,
        response,
    })
    .await
    {
        Ok(RegisterOutcome::Registered) => (
            StatusCode::CREATED,
            Json(json!({ "outcome": RegisterOutcome::Registered })),
        ),
        Ok(outcome) => (StatusCode::OK, Json(json!({ "outcome": outcome }))),
        Err(e) => error_response(e),
    }
}

pub async fn get_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.referral_channel, |response| ReferralRequest::GetStats {
        user_id,
        response,
    })
    .await
    {
        Ok((stats, history)) => (
            StatusCode::OK,
            Json(json!({
                "stats": stats,
                "history": history
            })),
        ),
        Err(e) => error_response(e),
    }
}

/// Internal payment-confirmation hook; pays the referral bonus on a first
/// payment.
pub async fn payment_confirmed(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    Json(body): Json<PaymentConfirmation>,
) -> impl IntoResponse {
    match dispatch(&state.referral_channel, |response| ReferralRequest::ProcessBonus {
        referred_id: body.user_id,
        payment_id,
        nickname: body.nickname,
        response,
    })
    .await
    {
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => error_response(e),
    }
}
