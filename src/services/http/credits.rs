use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::auth::Caller;
use super::{dispatch, error_response, AppState};
use crate::services::credits::CreditsRequest;

#[derive(Deserialize)]
pub struct CanUseBody {
    feature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPlanGrant {
    user_id: String,
    amount: u64,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.credits_channel, |response| CreditsRequest::GetBalance {
        user_id,
        response,
    })
    .await
    {
        Ok(balance) => (StatusCode::OK, Json(json!(balance))),
        Err(e) => error_response(e),
    }
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.credits_channel, |response| CreditsRequest::GetHistory {
        user_id,
        response,
    })
    .await
    {
        Ok(history) => (StatusCode::OK, Json(json!({ "history": history }))),
        Err(e) => error_response(e),
    }
}

pub async fn can_use(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CanUseBody>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.credits_channel, |response| CreditsRequest::CanUse {
        user_id,
        feature: body.feature,
        response,
    })
    .await
    {
        Ok(check) => (StatusCode::OK, Json(json!(check))),
        Err(e) => error_response(e),
    }
}

/// Internal: billing activates a purchased daily plan for a user.
pub async fn activate_daily_plan(
    State(state): State<AppState>,
    Json(body): Json<DailyPlanGrant>,
) -> impl IntoResponse {
    match dispatch(&state.credits_channel, |response| {
        CreditsRequest::ActivateDailyPlan {
            user_id: body.user_id,
            amount: body.amount,
            response,
        }
    })
    .await
    {
        Ok(expiry) => (StatusCode::OK, Json(json!({ "dailyPlanExpiry": expiry }))),
        Err(e) => error_response(e),
    }
}

pub async fn check_daily_plan(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.credits_channel, |response| CreditsRequest::CheckDailyPlan {
        user_id,
        response,
    })
    .await
    {
        Ok(active) => (StatusCode::OK, Json(json!({ "active": active }))),
        Err(e) => error_response(e),
    }
}

pub async fn grant_periodic_bonus(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.credits_channel, |response| {
        CreditsRequest::GrantPeriodicBonus { user_id, response }
    })
    .await
    {
        Ok(granted) => (StatusCode::OK, Json(json!({ "granted": granted }))),
        Err(e) => error_response(e),
    }
}
