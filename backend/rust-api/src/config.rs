use serde::{de::DeserializeOwned, Deserialize};
use std::collections::HashMap;
use std::env;

use crate::models::rate_limit::{
    Quota, FEATURE_AI_CHAT, FEATURE_FLASHCARDS, FEATURE_LEARNING_OBJECTIVES,
    FEATURE_PRACTICE_TEST,
};
use crate::services::mastery::MasteryThresholds;

const MAX_WINDOW_SECONDS: u64 = 31 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterStoreKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub store: CounterStoreKind,
    pub fail_open: bool,
    pub quotas: HashMap<String, Quota>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            store: CounterStoreKind::Redis,
            fail_open: false,
            quotas: default_quotas(),
        }
    }
}

pub fn default_quotas() -> HashMap<String, Quota> {
    HashMap::from([
        (FEATURE_PRACTICE_TEST.to_string(), Quota::new(10, 3600)),
        (FEATURE_AI_CHAT.to_string(), Quota::new(60, 3600)),
        (FEATURE_FLASHCARDS.to_string(), Quota::new(20, 3600)),
        (FEATURE_LEARNING_OBJECTIVES.to_string(), Quota::new(10, 3600)),
    ])
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub mongo_uri: String,
    pub mongo_database: String,
    pub redis_uri: String,
    pub rate_limit: RateLimitSettings,
    pub mastery: MasteryThresholds,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), then the local one
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env || dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/{env}.toml + APP__ overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "masterygate".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mut rate_limit = RateLimitSettings::default();
        if let Some(store) = optional::<CounterStoreKind>(&settings, "rate_limit.store")? {
            rate_limit.store = store;
        }
        if let Some(fail_open) = optional::<bool>(&settings, "rate_limit.fail_open")? {
            rate_limit.fail_open = fail_open;
        }
        // configured quotas override defaults feature by feature
        let configured_quotas =
            optional::<HashMap<String, Quota>>(&settings, "rate_limit.quotas")?;
        if let Some(quotas) = configured_quotas {
            rate_limit.quotas.extend(
                quotas
                    .into_iter()
                    .map(|(feature, quota)| (canonical_feature(&feature), quota)),
            );
        }
        validate_quotas(&rate_limit.quotas)?;

        let mastery = optional::<MasteryThresholds>(&settings, "mastery")?.unwrap_or_default();
        mastery.validate().map_err(config::ConfigError::Message)?;

        Ok(Config {
            bind_addr,
            mongo_uri,
            mongo_database,
            redis_uri,
            rate_limit,
            mastery,
        })
    }

    /// In-memory backends, default quotas and thresholds
    pub fn for_tests() -> Self {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            mongo_uri: String::new(),
            mongo_database: "masterygate_test".to_string(),
            redis_uri: String::new(),
            rate_limit: RateLimitSettings {
                store: CounterStoreKind::Memory,
                ..RateLimitSettings::default()
            },
            mastery: MasteryThresholds::default(),
        }
    }
}

// Absent keys keep their defaults; malformed values are errors
fn optional<T: DeserializeOwned>(
    settings: &config::Config,
    key: &str,
) -> Result<Option<T>, config::ConfigError> {
    match settings.get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

// Config sources may lowercase keys; map known features back to their camelCase form
fn canonical_feature(name: &str) -> String {
    [
        FEATURE_PRACTICE_TEST,
        FEATURE_AI_CHAT,
        FEATURE_FLASHCARDS,
        FEATURE_LEARNING_OBJECTIVES,
    ]
    .into_iter()
    .find(|feature| feature.eq_ignore_ascii_case(name))
    .unwrap_or(name)
    .to_string()
}

fn validate_quotas(quotas: &HashMap<String, Quota>) -> Result<(), config::ConfigError> {
    for (feature, quota) in quotas {
        if quota.window_seconds == 0 || quota.window_seconds > MAX_WINDOW_SECONDS {
            return Err(config::ConfigError::Message(format!(
                "rate_limit.quotas.{}.window_seconds must be between 1 and {}",
                feature, MAX_WINDOW_SECONDS
            )));
        }
    }
    Ok(())
}
