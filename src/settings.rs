use std::collections::HashMap;

use chrono::Duration;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Postgres {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

#[derive(Debug, Deserialize)]
pub struct Credits {
    #[serde(default = "default_feature_costs")]
    pub feature_costs: HashMap<String, u64>,
    #[serde(default = "default_cost")]
    pub default_cost: u64,
    #[serde(default = "default_daily_plan_hours")]
    pub daily_plan_hours: i64,
    #[serde(default = "default_periodic_bonus_amount")]
    pub periodic_bonus_amount: u64,
    #[serde(default = "default_periodic_bonus_days")]
    pub periodic_bonus_days: i64,
}

impl Credits {
    pub fn daily_plan_duration(&self) -> Result<Duration, ConfigError> {
        positive(
            "credits.daily_plan_hours",
            self.daily_plan_hours,
            Duration::try_hours(self.daily_plan_hours),
        )
    }

    pub fn periodic_bonus_interval(&self) -> Result<Duration, ConfigError> {
        positive(
            "credits.periodic_bonus_days",
            self.periodic_bonus_days,
            Duration::try_days(self.periodic_bonus_days),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct Referrals {
    #[serde(default = "default_bonus_credits")]
    pub bonus_credits: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleBackend {
    #[default]
    Memory,
    Store,
}

#[derive(Debug, Deserialize)]
pub struct Throttle {
    #[serde(default)]
    pub backend: ThrottleBackend,
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Throttle {
    pub fn window(&self) -> Result<Duration, ConfigError> {
        positive(
            "throttle.window_secs",
            self.window_secs,
            Duration::try_seconds(self.window_secs),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct Generation {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    pub verify_url: String,
}

/// Trusted callers (payment provider, billing backend) prove themselves with
/// this shared secret. An empty secret disables the internal routes.
#[derive(Debug, Deserialize)]
pub struct Payments {
    #[serde(default)]
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct Http {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub postgres: Option<Postgres>,
    #[serde(default = "empty_section")]
    pub store: Store,
    #[serde(default = "empty_section")]
    pub credits: Credits,
    #[serde(default = "empty_section")]
    pub referrals: Referrals,
    #[serde(default = "empty_section")]
    pub throttle: Throttle,
    pub generation: Generation,
    pub auth: Auth,
    #[serde(default = "empty_section")]
    pub payments: Payments,
    #[serde(default = "empty_section")]
    pub http: Http,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("FOLIO").separator("__"))
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values the ledger and throttle cannot turn into durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.credits.daily_plan_duration()?;
        self.credits.periodic_bonus_interval()?;
        self.throttle.window()?;
        if self.throttle.max_requests == 0 {
            return Err(ConfigError::Message(
                "throttle.max_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn positive(
    field: &str,
    value: i64,
    duration: Option<Duration>,
) -> Result<Duration, ConfigError> {
    match duration {
        Some(duration) if value > 0 => Ok(duration),
        _ => Err(ConfigError::Message(format!(
            "{field} must be positive and in range, got {value}"
        ))),
    }
}

/// Deserializes a section from an empty table so every field takes its
/// serde default.
fn empty_section<T: serde::de::DeserializeOwned>() -> T {
    serde_json::from_value(serde_json::json!({}))
        .unwrap_or_else(|e| panic!("section defaults must deserialize: {e}"))
}

fn default_max_connections() -> u32 {
    5
}

fn default_max_retries() -> usize {
    crate::repositories::store::DEFAULT_MAX_RETRIES
}

pub fn default_feature_costs() -> HashMap<String, u64> {
    [
        ("generate_article", 2),
        ("generate_tutorial", 3),
        ("generate_roadmap", 5),
        ("generate_quiz", 1),
        ("analyze_soft_skills", 2),
        ("analyze_skills", 2),
        ("generate_project", 4),
        ("generate_description", 1),
    ]
    .into_iter()
    .map(|(name, cost)| (name.to_string(), cost))
    .collect()
}

fn default_cost() -> u64 {
    1
}

fn default_daily_plan_hours() -> i64 {
    24
}

fn default_periodic_bonus_amount() -> u64 {
    10
}

fn default_periodic_bonus_days() -> i64 {
    30
}

fn default_bonus_credits() -> u64 {
    10
}

fn default_window_secs() -> i64 {
    60
}

fn default_max_requests() -> u32 {
    10
}

fn default_generation_timeout_secs() -> u64 {
    120
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
