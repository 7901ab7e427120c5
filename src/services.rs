use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::errors::CreditsError;
use crate::repositories::accounts::AccountRepository;
use crate::repositories::auth::TokenVerifier;
use crate::repositories::generation::GenerationRepository;
use crate::repositories::referrals::ReferralRepository;
use crate::repositories::store::DocumentStore;
use crate::settings::Settings;

pub mod credits;
pub mod generation;
pub mod http;
pub mod ledger;
pub mod referrals;
pub mod saga;
pub mod throttle;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Credits(#[from] CreditsError),
    #[error("Operation failed: {0}")]
    Operation(String),
    #[error("Communication error: {0} - {1}")]
    Communication(String, String),
}

#[async_trait]
pub trait RequestHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_request(&self, request: T);
}

#[async_trait]
pub trait Service<T, H>: Send + Sync + 'static
where
    T: Send + 'static,
    H: RequestHandler<T> + Clone + Send,
{
    async fn run(&mut self, handler: H, receiver: &mut mpsc::Receiver<T>) {
        while let Some(request) = receiver.recv().await {
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_request(request).await;
            });
        }
    }
}

/// Shared building blocks every service is wired from.
#[derive(Clone)]
pub struct Components {
    pub engine: ledger::BalanceEngine,
    pub referrals: referrals::ReferralLedger,
    pub throttle: throttle::RequestThrottle,
}

impl Components {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        settings: &Settings,
    ) -> Result<Self, config::ConfigError> {
        let engine = ledger::BalanceEngine::new(
            AccountRepository::new(store.clone()),
            ledger::FeatureCosts::new(
                settings.credits.feature_costs.clone(),
                settings.credits.default_cost,
            ),
            clock.clone(),
            ledger::LedgerPolicy::try_from(&settings.credits)?,
        );
        let referrals = referrals::ReferralLedger::new(
            ReferralRepository::new(store.clone()),
            clock.clone(),
            settings.referrals.bonus_credits,
        );
        let throttle = throttle::RequestThrottle::from_settings(&settings.throttle, store, clock)?;

        Ok(Self {
            engine,
            referrals,
            throttle,
        })
    }
}

/// Channel senders the transport layer talks through.
#[derive(Clone)]
pub struct Channels {
    pub credits: mpsc::Sender<credits::CreditsRequest>,
    pub generation: mpsc::Sender<generation::GenerationRequest>,
    pub referrals: mpsc::Sender<referrals::ReferralRequest>,
}

/// Spawns the credits, generation and referral services and returns the
/// senders that reach them.
pub fn spawn_services(
    components: &Components,
    generator: GenerationRepository,
    generation_timeout: Duration,
) -> Channels {
    let (credits_tx, mut credits_rx) = mpsc::channel(512);
    let (generation_tx, mut generation_rx) = mpsc::channel(512);
    let (referral_tx, mut referral_rx) = mpsc::channel(512);

    let mut credits_service = credits::CreditsService::new();
    let mut generation_service = generation::GenerationService::new();
    let mut referral_service = referrals::ReferralService::new();

    log::info!("Starting credits service.");
    let credits_handler = credits::CreditsRequestHandler::new(components.engine.clone());
    tokio::spawn(async move {
        credits_service.run(credits_handler, &mut credits_rx).await;
    });

    log::info!("Starting generation service.");
    let generation_handler = generation::GenerationRequestHandler::new(
        saga::SpendSaga::new(components.engine.clone()),
        generator,
        generation_timeout,
    );
    tokio::spawn(async move {
        generation_service
            .run(generation_handler, &mut generation_rx)
            .await;
    });

    log::info!("Starting referral service.");
    let referral_handler = referrals::ReferralRequestHandler::new(components.referrals.clone());
    tokio::spawn(async move {
        referral_service.run(referral_handler, &mut referral_rx).await;
    });

    Channels {
        credits: credits_tx,
        generation: generation_tx,
        referrals: referral_tx,
    }
}

pub async fn start_services(
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    verifier: Arc<dyn TokenVerifier>,
    settings: Settings,
) -> Result<(), anyhow::Error> {
    let components = Components::new(store, clock, &settings)?;
    let generator = GenerationRepository::new(settings.generation.url, settings.generation.api_key);
    let timeout = Duration::from_secs(settings.generation.timeout_secs);

    let channels = spawn_services(&components, generator, timeout);

    log::info!("Starting HTTP server.");
    http::start_http_server(
        &settings.http.listen,
        channels,
        components.throttle,
        verifier,
        settings.payments.webhook_secret,
    )
    .await
}
