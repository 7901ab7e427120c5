use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::{json, Value};

use super::auth::Caller;
use super::{dispatch, error_response, AppState};
use crate::services::generation::GenerationRequest;

/// Paid AI call: debited up front, refunded if the upstream call fails.
pub async fn generate(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(feature): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let user_id = match caller.require() {
        Ok(user_id) => user_id,
        Err(e) => return e,
    };

    match dispatch(&state.generation_channel, |response| {
        GenerationRequest::Generate {
            user_id,
            feature,
            payload,
            response,
        }
    })
    .await
    {
        Ok(content) => (StatusCode::OK, Json(json!({ "content": content }))),
        Err(e) => error_response(e),
    }
}
