use std::collections::HashMap;
use std::sync::Arc;

use crate::metrics::RATE_LIMIT_DECISIONS_TOTAL;
use crate::models::{Admission, CounterKey, Quota};
use crate::utils::time::{Clock, SystemClock};

use super::counter_store::{CounterStore, CounterStoreError};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("quota exceeded for {feature}, retry after {retry_after_seconds}s")]
    QuotaExceeded {
        feature: String,
        retry_after_seconds: u64,
    },
    #[error("no quota configured for feature {0}")]
    UnknownFeature(String),
    #[error("rate limit store unavailable: {0}")]
    StoreUnavailable(#[from] CounterStoreError),
}

/// Per-user, per-feature fixed-window limiter for AI features
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    quotas: HashMap<String, Quota>,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, quotas: HashMap<String, Quota>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            quotas,
            fail_open: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admit requests when the counter store is down instead of rejecting them
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn quota_for(&self, feature_key: &str) -> Option<Quota> {
        self.quotas.get(feature_key).copied()
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Consumes one request from `(user_id, feature_key)` under `quota`.
    ///
    /// Store failures are errors here; `fail_open` only applies to
    /// [`RateLimiter::enforce`].
    pub async fn check_and_consume(
        &self,
        user_id: &str,
        feature_key: &str,
        quota: &Quota,
    ) -> Result<Admission, RateLimitError> {
        let key = CounterKey::new(user_id, feature_key);
        let now = self.clock.now();

        let admission = match self.store.consume(&key, quota, now).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::error!(
                    "Rate limit store {} failed for user={} feature={}: {}",
                    self.store.name(),
                    user_id,
                    feature_key,
                    e
                );
                RATE_LIMIT_DECISIONS_TOTAL
                    .with_label_values(&[feature_key, "store_error"])
                    .inc();
                return Err(RateLimitError::StoreUnavailable(e));
            }
        };

        let outcome = match admission {
            Admission::Admitted { .. } => "admitted",
            Admission::Rejected { .. } => "rejected",
        };
        RATE_LIMIT_DECISIONS_TOTAL
            .with_label_values(&[feature_key, outcome])
            .inc();

        if let Admission::Rejected {
            retry_after_seconds,
        } = admission
        {
            tracing::warn!(
                "Rate limit exceeded for user={} feature={} (retry after {}s)",
                user_id,
                feature_key,
                retry_after_seconds
            );
        }

        Ok(admission)
    }

    /// Looks up the configured quota for `feature_key` and consumes from it.
    /// Returns the remaining allowance on admission.
    pub async fn enforce(&self, user_id: &str, feature_key: &str) -> Result<u32, RateLimitError> {
        let quota = self
            .quota_for(feature_key)
            .ok_or_else(|| RateLimitError::UnknownFeature(feature_key.to_string()))?;

        match self.check_and_consume(user_id, feature_key, &quota).await {
            Ok(Admission::Admitted { remaining }) => Ok(remaining),
            Ok(Admission::Rejected {
                retry_after_seconds,
            }) => Err(RateLimitError::QuotaExceeded {
                feature: feature_key.to_string(),
                retry_after_seconds,
            }),
            Err(RateLimitError::StoreUnavailable(e)) if self.fail_open => {
                tracing::warn!(
                    "Admitting user={} feature={} without quota check (fail-open): {}",
                    user_id,
                    feature_key,
                    e
                );
                Ok(quota.max_requests)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::counter_store::InMemoryCounterStore;
    use crate::utils::time::ManualClock;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap()
    }

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        let quotas = HashMap::from([
            ("practiceTest".to_string(), Quota::new(2, 60)),
            ("aiChat".to_string(), Quota::new(2, 60)),
        ]);
        RateLimiter::new(Arc::new(InMemoryCounterStore::new()), quotas).with_clock(clock)
    }

    #[tokio::test]
    async fn window_reset_after_elapsed_window() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock.clone());
        let quota = Quota::new(2, 60);

        for _ in 0..2 {
            let admission = limiter.check_and_consume("u1", "practiceTest", &quota).await;
            assert!(admission.unwrap().is_admitted());
        }

        clock.advance(Duration::seconds(10));
        let rejected = limiter
            .check_and_consume("u1", "practiceTest", &quota)
            .await
            .unwrap();
        assert_eq!(
            rejected,
            Admission::Rejected {
                retry_after_seconds: 50
            }
        );

        clock.set(start() + Duration::seconds(61));
        let admitted = limiter
            .check_and_consume("u1", "practiceTest", &quota)
            .await
            .unwrap();
        assert_eq!(admitted, Admission::Admitted { remaining: 1 });
    }

    #[tokio::test]
    async fn features_are_limited_independently() {
        let clock = Arc::new(ManualClock::new(start()));
        let limiter = limiter(clock);

        limiter.enforce("u1", "practiceTest").await.unwrap();
        limiter.enforce("u1", "practiceTest").await.unwrap();
        let err = limiter.enforce("u1", "practiceTest").await.unwrap_err();
        assert!(matches!(err, RateLimitError::QuotaExceeded { .. }));

        assert_eq!(limiter.enforce("u1", "aiChat").await.unwrap(), 1);
        assert_eq!(limiter.enforce("u2", "practiceTest").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_feature_is_reported() {
        let limiter = limiter(Arc::new(ManualClock::new(start())));
        let err = limiter.enforce("u1", "essayGrader").await.unwrap_err();
        assert!(matches!(err, RateLimitError::UnknownFeature(f) if f == "essayGrader"));
    }

    #[tokio::test]
    async fn unbounded_window_quota_rejects_instead_of_panicking() {
        let limiter = limiter(Arc::new(ManualClock::new(start())));
        let quota = Quota::new(1, u64::MAX);

        assert!(limiter
            .check_and_consume("u1", "aiChat", &quota)
            .await
            .unwrap()
            .is_admitted());
        let second = limiter
            .check_and_consume("u1", "aiChat", &quota)
            .await
            .unwrap();
        assert!(matches!(second, Admission::Rejected { .. }));
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn consume(
            &self,
            _key: &CounterKey,
            _quota: &Quota,
            _now: DateTime<Utc>,
        ) -> Result<Admission, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }

        async fn ping(&self) -> Result<(), CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn broken_limiter() -> RateLimiter {
        let quotas = HashMap::from([("aiChat".to_string(), Quota::new(5, 60))]);
        RateLimiter::new(Arc::new(BrokenStore), quotas)
    }

    #[tokio::test]
    async fn store_failure_fails_closed_by_default() {
        let err = broken_limiter().enforce("u1", "aiChat").await.unwrap_err();
        assert!(matches!(err, RateLimitError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn store_failure_can_fail_open() {
        let remaining = broken_limiter()
            .fail_open(true)
            .enforce("u1", "aiChat")
            .await
            .unwrap();
        assert_eq!(remaining, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_admit_exactly_quota() {
        const N: u32 = 25;
        let limiter = Arc::new(limiter(Arc::new(ManualClock::new(start()))));
        let quota = Quota::new(N, 60);

        let mut handles = Vec::new();
        for _ in 0..(N * 2) {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check_and_consume("u1", "practiceTest", &quota)
                    .await
                    .unwrap()
                    .is_admitted()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, N);
    }
}
