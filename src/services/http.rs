use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use super::credits::CreditsRequest;
use super::generation::GenerationRequest;
use super::referrals::ReferralRequest;
use super::throttle::RequestThrottle;
use super::{Channels, ServiceError};
use crate::errors::CreditsError;
use crate::repositories::auth::TokenVerifier;
use crate::repositories::store::StoreError;

mod auth;
mod credits;
mod generation;
mod referrals;

#[derive(Clone)]
pub struct AppState {
    credits_channel: mpsc::Sender<CreditsRequest>,
    generation_channel: mpsc::Sender<GenerationRequest>,
    referral_channel: mpsc::Sender<ReferralRequest>,
    throttle: RequestThrottle,
    verifier: Arc<dyn TokenVerifier>,
    service_secret: Arc<str>,
}

type ErrorResponse = (StatusCode, Json<Value>);

/// Sends one request to a service and waits for its answer.
async fn dispatch<R, T>(
    channel: &mpsc::Sender<R>,
    request: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> R,
) -> Result<T, ServiceError> {
    let (response_tx, response_rx) = oneshot::channel();

    channel
        .send(request(response_tx))
        .await
        .map_err(|e| ServiceError::Communication("Failed to process request".into(), e.to_string()))?;

    response_rx
        .await
        .map_err(|e| ServiceError::Communication("Failed to receive response".into(), e.to_string()))?
}

fn error_response(error: ServiceError) -> ErrorResponse {
    let status = match &error {
        ServiceError::Credits(CreditsError::InsufficientFunds { .. }) => StatusCode::PAYMENT_REQUIRED,
        ServiceError::Credits(CreditsError::AccountNotFound { .. }) => StatusCode::NOT_FOUND,
        ServiceError::Credits(CreditsError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        ServiceError::Credits(CreditsError::Store(StoreError::InvalidSegment(_))) => {
            StatusCode::BAD_REQUEST
        }
        ServiceError::Credits(CreditsError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        ServiceError::Operation(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Communication(..) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        log::error!("Request failed with {}: {}", status, error);
    }

    (status, Json(json!({ "error": error.to_string() })))
}

/// Builds the public `/v1` surface for users and the `/internal` surface for
/// trusted backends holding `service_secret`.
pub fn router(
    channels: Channels,
    throttle: RequestThrottle,
    verifier: Arc<dyn TokenVerifier>,
    service_secret: String,
) -> Router {
    let state = AppState {
        credits_channel: channels.credits,
        generation_channel: channels.generation,
        referral_channel: channels.referrals,
        throttle,
        verifier,
        service_secret: service_secret.into(),
    };

    let paid = Router::new()
        .route("/generate/{feature}", post(generation::generate))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::throttle));

    let v1 = Router::new()
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/history", get(credits::get_history))
        .route("/credits/can-use", post(credits::can_use))
        .route("/credits/daily-plan/check", post(credits::check_daily_plan))
        .route("/credits/bonus", post(credits::grant_periodic_bonus))
        .route("/referrals", post(referrals::register))
        .route("/referrals/stats", get(referrals::get_stats))
        .merge(paid)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    let internal = Router::new()
        .route("/credits/daily-plan", post(credits::activate_daily_plan))
        .route(
            "/payments/{payment_id}/confirmed",
            post(referrals::payment_confirmed),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_service_secret,
        ));

    if state.service_secret.is_empty() {
        log::warn!("No payments webhook secret configured; internal routes will refuse all calls.");
    }

    Router::new()
        .nest("/v1", v1)
        .nest("/internal", internal)
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_http_server(
    listen: &str,
    channels: Channels,
    throttle: RequestThrottle,
    verifier: Arc<dyn TokenVerifier>,
    service_secret: String,
) -> Result<(), anyhow::Error> {
    let app = router(channels, throttle, verifier, service_secret);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::accounts::PoolType;
    use crate::repositories::generation::GenerationRepository;
    use crate::repositories::store::MemoryStore;
    use crate::services::{spawn_services, Components};
    use crate::settings::Settings;
    use anyhow::bail;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use config::{Config, File, FileFormat};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Accepts tokens of the form `token-<uid>`.
    struct StaticVerifier;

    #[async_trait]
    impl TokenVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<String, anyhow::Error> {
            match token.strip_prefix("token-") {
                Some(uid) if !uid.is_empty() => Ok(uid.to_string()),
                _ => bail!("unknown token"),
            }
        }
    }

    const WEBHOOK_SECRET: &str = "hook-secret";

    struct TestApp {
        router: Router,
        components: Components,
    }

    fn settings(max_requests: u32) -> Settings {
        Config::builder()
            .add_source(File::from_str(
                &format!(
                    r#"
                    [generation]
                    url = "http://127.0.0.1:9/unused"

                    [auth]
                    verify_url = "http://127.0.0.1:9/unused"

                    [throttle]
                    max_requests = {max_requests}

                    [payments]
                    webhook_secret = "{WEBHOOK_SECRET}"
                    "#
                ),
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    fn test_app(generation_url: &str, max_requests: u32) -> TestApp {
        test_app_with_timeout(generation_url, max_requests, Duration::from_secs(5))
    }

    fn test_app_with_timeout(generation_url: &str, max_requests: u32, timeout: Duration) -> TestApp {
        let settings = settings(max_requests);
        let store = Arc::new(MemoryStore::with_max_retries(10_000));
        let components = Components::new(store, Arc::new(ManualClock::new()), &settings).unwrap();
        let channels = spawn_services(
            &components,
            GenerationRepository::new(generation_url.to_string(), "test-key".to_string()),
            timeout,
        );
        let router = router(
            channels,
            components.throttle.clone(),
            Arc::new(StaticVerifier),
            settings.payments.webhook_secret,
        );

        TestApp { router, components }
    }

    /// Serves a stand-in generation endpoint answering with `status`.
    async fn fake_generator(status: StatusCode) -> String {
        slow_generator(status, Duration::ZERO).await
    }

    /// Like [`fake_generator`], but waits `delay` before answering.
    async fn slow_generator(status: StatusCode, delay: Duration) -> String {
        let app = Router::new().route(
            "/generate",
            post(move |Json(body): Json<Value>| async move {
                tokio::time::sleep(delay).await;
                let feature = body["feature"].as_str().unwrap_or_default().to_string();
                (status, Json(json!({ "text": format!("generated {feature}") })))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/generate")
    }

    async fn call(
        app: &TestApp,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        call_as(app, method, uri, user, None, body).await
    }

    /// Calls an internal route, optionally presenting a service secret.
    async fn call_internal(
        app: &TestApp,
        uri: &str,
        secret: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        call_as(app, Method::POST, uri, None, secret, Some(body)).await
    }

    async fn call_as(
        app: &TestApp,
        method: Method,
        uri: &str,
        user: Option<&str>,
        secret: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("authorization", format!("Bearer token-{user}"));
        }
        if let Some(secret) = secret {
            builder = builder.header(auth::SERVICE_SECRET_HEADER, secret);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn paid_routes_require_a_caller() {
        let app = test_app("http://127.0.0.1:9/unused", 10);

        let (status, _) = call(&app, Method::GET, "/v1/credits/balance", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/v1/credits/balance")
            .header("authorization", "Bearer forged")
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn generation_charges_on_success() {
        let url = fake_generator(StatusCode::OK).await;
        let app = test_app(&url, 10);
        app.components.engine.add("u1", 5, PoolType::Regular).await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/generate/generate_tutorial",
            Some("u1"),
            Some(json!({ "topic": "rust" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"]["text"], "generated generate_tutorial");
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
        assert_eq!(balance["regularCredits"], 2);
    }

    #[tokio::test]
    async fn upstream_failure_refunds_and_reports_bad_gateway() {
        let url = fake_generator(StatusCode::INTERNAL_SERVER_ERROR).await;
        let app = test_app(&url, 10);
        app.components.engine.add("u1", 5, PoolType::Regular).await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/generate/generate_tutorial",
            Some("u1"),
            Some(json!({})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("500"));
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
        assert_eq!(balance["regularCredits"], 5);
        assert_eq!(history_kinds(&app, "u1").await, vec!["regular", "refund"]);
    }

    async fn history_kinds(app: &TestApp, user: &str) -> Vec<String> {
        let (_, history) = call(app, Method::GET, "/v1/credits/history", Some(user), None).await;
        history["history"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn timed_out_generation_refunds_and_reports_bad_gateway() {
        let url = slow_generator(StatusCode::OK, Duration::from_secs(2)).await;
        let app = test_app_with_timeout(&url, 10, Duration::from_millis(100));
        app.components.engine.add("u1", 5, PoolType::Regular).await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/generate/generate_tutorial",
            Some("u1"),
            Some(json!({})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("timed out"));
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
        assert_eq!(balance["regularCredits"], 5);
        assert_eq!(history_kinds(&app, "u1").await, vec!["regular", "refund"]);
    }

    #[tokio::test]
    async fn insufficient_credits_is_payment_required() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        app.components.engine.add("u1", 1, PoolType::Regular).await.unwrap();

        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/generate/generate_roadmap",
            Some("u1"),
            Some(json!({})),
        )
        .await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn missing_account_is_not_found() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/generate/generate_quiz",
            Some("ghost"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pre_check_reports_pool_and_cost() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        app.components.engine.add("u1", 4, PoolType::Regular).await.unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/credits/can-use",
            Some("u1"),
            Some(json!({ "feature": "generate_roadmap" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "allowed": false, "cost": 5, "type": "regular" }));
    }

    #[tokio::test]
    async fn daily_plan_round_trip() {
        let app = test_app("http://127.0.0.1:9/unused", 10);

        let (status, _) = call_internal(
            &app,
            "/internal/credits/daily-plan",
            Some(WEBHOOK_SECRET),
            json!({ "userId": "u1", "amount": 30 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::POST, "/v1/credits/daily-plan/check", Some("u1"), None).await;
        assert_eq!(body["active"], true);
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
        assert_eq!(balance["dailyCredits"], 30);
    }

    #[tokio::test]
    async fn users_cannot_grant_themselves_a_daily_plan() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        let grant = json!({ "userId": "mallory", "amount": 1000000 });

        let (status, _) = call(
            &app,
            Method::POST,
            "/internal/credits/daily-plan",
            Some("mallory"),
            Some(grant.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            call_internal(&app, "/internal/credits/daily-plan", Some("guess"), grant.clone()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // No self-service activation on the public surface.
        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/credits/daily-plan",
            Some("mallory"),
            Some(grant),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("mallory"), None).await;
        assert_eq!(balance["dailyCredits"], 0);
        assert_eq!(balance["isDailyPlanActive"], false);
    }

    #[tokio::test]
    async fn internal_routes_refuse_everyone_without_a_configured_secret() {
        let settings = settings(10);
        let store = Arc::new(MemoryStore::new());
        let components = Components::new(store, Arc::new(ManualClock::new()), &settings).unwrap();
        let channels = spawn_services(
            &components,
            GenerationRepository::new("http://127.0.0.1:9/unused".to_string(), String::new()),
            Duration::from_secs(5),
        );
        let app = TestApp {
            router: router(channels, components.throttle.clone(), Arc::new(StaticVerifier), String::new()),
            components,
        };

        let (status, _) = call_internal(
            &app,
            "/internal/credits/daily-plan",
            Some(""),
            json!({ "userId": "u1", "amount": 5 }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn periodic_bonus_is_granted_once() {
        let app = test_app("http://127.0.0.1:9/unused", 10);

        let (_, first) = call(&app, Method::POST, "/v1/credits/bonus", Some("u1"), None).await;
        let (_, second) = call(&app, Method::POST, "/v1/credits/bonus", Some("u1"), None).await;

        assert_eq!(first["granted"], true);
        assert_eq!(second["granted"], false);
    }

    async fn generate_quiz(app: &TestApp, user: &str) -> StatusCode {
        let (status, _) = call(
            app,
            Method::POST,
            "/v1/generate/generate_quiz",
            Some(user),
            Some(json!({})),
        )
        .await;
        status
    }

    #[tokio::test]
    async fn generations_over_the_limit_are_throttled() {
        let url = fake_generator(StatusCode::OK).await;
        let app = test_app(&url, 2);
        app.components.engine.add("u1", 10, PoolType::Regular).await.unwrap();
        app.components.engine.add("u2", 10, PoolType::Regular).await.unwrap();

        assert_eq!(generate_quiz(&app, "u1").await, StatusCode::OK);
        assert_eq!(generate_quiz(&app, "u1").await, StatusCode::OK);
        assert_eq!(generate_quiz(&app, "u1").await, StatusCode::TOO_MANY_REQUESTS);

        // The denied call was never charged.
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
        assert_eq!(balance["regularCredits"], 8);

        assert_eq!(generate_quiz(&app, "u2").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn reads_do_not_count_against_the_generation_limit() {
        let url = fake_generator(StatusCode::OK).await;
        let app = test_app(&url, 10);
        app.components.engine.add("u1", 10, PoolType::Regular).await.unwrap();

        for _ in 0..10 {
            let (status, _) = call(&app, Method::GET, "/v1/credits/balance", Some("u1"), None).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = call(&app, Method::GET, "/v1/referrals/stats", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);

        assert_eq!(generate_quiz(&app, "u1").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn referral_bonus_flow() {
        let app = test_app("http://127.0.0.1:9/unused", 10);

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("U1"),
            Some(json!({ "referrerId": "R1", "nickname": "Ana" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["outcome"], "registered");

        let (status, body) = call_internal(
            &app,
            "/internal/payments/P1/confirmed",
            Some(WEBHOOK_SECRET),
            json!({ "userId": "U1", "nickname": "Ana" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["bonusGranted"], true);

        let (_, body) = call(&app, Method::GET, "/v1/referrals/stats", Some("R1"), None).await;
        assert_eq!(body["stats"]["totalCredits"], 10);
        assert_eq!(body["history"][0]["nickname"], "Ana");

        let (_, body) = call_internal(
            &app,
            "/internal/payments/P2/confirmed",
            Some(WEBHOOK_SECRET),
            json!({ "userId": "U1" }),
        )
        .await;
        assert_eq!(body["bonusGranted"], false);
    }

    #[tokio::test]
    async fn forged_payment_confirmations_pay_nothing() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("U1"),
            Some(json!({ "referrerId": "R1", "nickname": "Ana" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let forged = json!({ "userId": "U1", "nickname": "Ana" });

        let (status, _) = call(
            &app,
            Method::POST,
            "/internal/payments/forged/confirmed",
            Some("U1"),
            Some(forged.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            call_internal(&app, "/internal/payments/forged/confirmed", Some("guess"), forged).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The old public path is gone.
        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/payments/forged/confirmed",
            Some("U1"),
            Some(json!({ "userId": "U1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, Method::GET, "/v1/referrals/stats", Some("R1"), None).await;
        assert_eq!(body["stats"]["totalCredits"], 0);
        let (_, balance) = call(&app, Method::GET, "/v1/credits/balance", Some("U1"), None).await;
        assert_eq!(balance["regularCredits"], 0);
    }

    #[tokio::test]
    async fn self_referral_is_rejected() {
        let app = test_app("http://127.0.0.1:9/unused", 10);
        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/referrals",
            Some("U1"),
            Some(json!({ "referrerId": "U1", "nickname": "Me" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "self_referral");
    }
}
