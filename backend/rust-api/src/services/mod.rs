use std::sync::Arc;

use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use crate::config::{Config, CounterStoreKind};

use counter_store::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use mastery::MasteryTracker;
use mastery_service::MasteryService;
use mastery_store::{MasteryStore, MongoMasteryStore};
use rate_limiter::RateLimiter;

pub struct AppState {
    pub config: Config,
    pub rate_limiter: RateLimiter,
    pub mastery: MasteryService,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: Option<redis::Client>,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);
        let mastery_store: Arc<dyn MasteryStore> = Arc::new(MongoMasteryStore::new(mongo));

        let counter_store: Arc<dyn CounterStore> = match (config.rate_limit.store, redis_client)
        {
            (CounterStoreKind::Redis, Some(client)) => {
                Arc::new(RedisCounterStore::new(connect_redis(client).await?))
            }
            (CounterStoreKind::Redis, None) => {
                anyhow::bail!("rate_limit.store = redis but no Redis client was provided")
            }
            (CounterStoreKind::Memory, _) => {
                tracing::warn!("Using in-memory rate limit counters (not shared across instances)");
                Arc::new(InMemoryCounterStore::new())
            }
        };

        Ok(Self::with_backends(config, mastery_store, counter_store))
    }

    /// Builds state over already constructed stores
    pub fn with_backends(
        config: Config,
        mastery_store: Arc<dyn MasteryStore>,
        counter_store: Arc<dyn CounterStore>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(counter_store, config.rate_limit.quotas.clone())
            .fail_open(config.rate_limit.fail_open);
        let mastery = MasteryService::new(mastery_store, MasteryTracker::new(config.mastery));

        Self {
            config,
            rate_limiter,
            mastery,
        }
    }
}

async fn connect_redis(redis_client: redis::Client) -> anyhow::Result<ConnectionManager> {
    tracing::info!("Attempting to connect to Redis...");

    let redis = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ConnectionManager::new(redis_client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    let mut conn = redis.clone();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}

pub mod counter_store;
pub mod mastery;
pub mod mastery_service;
pub mod mastery_store;
pub mod rate_limiter;
