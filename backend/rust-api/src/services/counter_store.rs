use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::aio::ConnectionManager;

use crate::models::{Admission, CounterKey, Quota, RateLimitCounter};
use crate::utils::time::ceil_seconds;

#[derive(Debug, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store returned malformed data: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for CounterStoreError {
    fn from(err: redis::RedisError) -> Self {
        CounterStoreError::Unavailable(err.to_string())
    }
}

/// Shared fixed-window counters. `consume` must perform the whole
/// read-reset-check-increment sequence atomically per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn consume(
        &self,
        key: &CounterKey,
        quota: &Quota,
        now: DateTime<Utc>,
    ) -> Result<Admission, CounterStoreError>;

    async fn ping(&self) -> Result<(), CounterStoreError>;

    fn name(&self) -> &'static str;
}

/// One fixed-window step over a (possibly absent) counter.
///
/// Returns the counter to store back and the decision.
pub fn fixed_window_step(
    counter: Option<RateLimitCounter>,
    quota: &Quota,
    now: DateTime<Utc>,
) -> (RateLimitCounter, Admission) {
    let window = Duration::milliseconds(quota.window_millis());

    let mut counter = match counter {
        Some(c) if now - c.window_start < window => c,
        _ => RateLimitCounter {
            window_start: now,
            count: 0,
        },
    };

    if counter.count >= quota.max_requests {
        let retry_after_seconds = retry_after(window, now - counter.window_start);
        return (
            counter,
            Admission::Rejected {
                retry_after_seconds,
            },
        );
    }

    counter.count += 1;
    let remaining = quota.max_requests - counter.count;
    (counter, Admission::Admitted { remaining })
}

// Window end is never materialized as a DateTime; huge windows would overflow it
fn retry_after(window: Duration, elapsed: Duration) -> u64 {
    ceil_seconds(window.checked_sub(&elapsed).unwrap_or(window))
}

type CounterSlot = Arc<Mutex<Option<RateLimitCounter>>>;

struct SweepState {
    last_sweep: Option<DateTime<Utc>>,
    max_window: Duration,
}

impl Default for SweepState {
    fn default() -> Self {
        Self {
            last_sweep: None,
            max_window: Duration::zero(),
        }
    }
}

/// Process-local store; counters are lost on restart.
///
/// Elapsed counters are swept at most once per the longest window seen.
#[derive(Default)]
pub struct InMemoryCounterStore {
    slots: Mutex<HashMap<CounterKey, CounterSlot>>,
    sweep: Mutex<SweepState>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CounterKey) -> Result<CounterSlot, CounterStoreError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("counter map lock poisoned".into()))?;
        Ok(slots.entry(key.clone()).or_default().clone())
    }

    #[cfg(test)]
    fn snapshot(&self, key: &CounterKey) -> Option<RateLimitCounter> {
        let slots = self.slots.lock().ok()?;
        let slot = slots.get(key)?.clone();
        drop(slots);
        let counter = slot.lock().ok()?;
        *counter
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Drops counters whose window ended before `now`.
    ///
    /// Slots handed out to an in-flight `consume` are kept.
    pub fn purge_expired(&self, now: DateTime<Utc>, max_window: Duration) -> usize {
        let Ok(mut slots) = self.slots.lock() else {
            return 0;
        };
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.lock() {
                Ok(counter) => matches!(*counter, Some(c) if now - c.window_start < max_window),
                Err(_) => false,
            }
        });
        before - slots.len()
    }

    fn maybe_sweep(&self, now: DateTime<Utc>, window: Duration) {
        let due = {
            let Ok(mut sweep) = self.sweep.lock() else {
                return;
            };
            sweep.max_window = sweep.max_window.max(window);
            match sweep.last_sweep {
                Some(last) if now - last < sweep.max_window => None,
                _ => {
                    sweep.last_sweep = Some(now);
                    Some(sweep.max_window)
                }
            }
        };

        if let Some(max_window) = due {
            let purged = self.purge_expired(now, max_window);
            if purged > 0 {
                tracing::debug!("Purged {} elapsed rate limit counters", purged);
            }
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn consume(
        &self,
        key: &CounterKey,
        quota: &Quota,
        now: DateTime<Utc>,
    ) -> Result<Admission, CounterStoreError> {
        self.maybe_sweep(now, Duration::milliseconds(quota.window_millis()));

        let slot = self.slot(key)?;
        let mut guard = slot
            .lock()
            .map_err(|_| CounterStoreError::Unavailable("counter lock poisoned".into()))?;
        let (counter, admission) = fixed_window_step(*guard, quota, now);
        *guard = Some(counter);
        Ok(admission)
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// Same step as fixed_window_step, executed atomically inside Redis.
// Returns {admitted, count, window_start_ms}.
const FIXED_WINDOW_SCRIPT: &str = r#"
    local key = KEYS[1]
    local max_requests = tonumber(ARGV[1])
    local window_ms = tonumber(ARGV[2])
    local now_ms = tonumber(ARGV[3])

    local start = tonumber(redis.call('HGET', key, 'window_start'))
    local count = tonumber(redis.call('HGET', key, 'count'))

    if start == nil or count == nil or now_ms - start >= window_ms then
        start = now_ms
        count = 0
        redis.call('HSET', key, 'window_start', start, 'count', 0)
        redis.call('PEXPIRE', key, window_ms)
    end

    if count >= max_requests then
        return {0, count, start}
    end

    count = redis.call('HINCRBY', key, 'count', 1)
    return {1, count, start}
"#;

pub struct RedisCounterStore {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(FIXED_WINDOW_SCRIPT),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn consume(
        &self,
        key: &CounterKey,
        quota: &Quota,
        now: DateTime<Utc>,
    ) -> Result<Admission, CounterStoreError> {
        let mut conn = self.redis.clone();

        let reply: Vec<i64> = self
            .script
            .key(key.redis_key())
            .arg(quota.max_requests)
            .arg(quota.window_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let [admitted, count, window_start_ms] = reply[..] else {
            return Err(CounterStoreError::Malformed(format!(
                "expected 3 values, got {:?}",
                reply
            )));
        };

        if admitted == 1 {
            let count = u32::try_from(count).map_err(|_| {
                CounterStoreError::Malformed(format!("negative counter {}", count))
            })?;
            return Ok(Admission::Admitted {
                remaining: quota.max_requests.saturating_sub(count),
            });
        }

        let window_start = Utc
            .timestamp_millis_opt(window_start_ms)
            .single()
            .ok_or_else(|| {
                CounterStoreError::Malformed(format!("bad window start {}", window_start_ms))
            })?;
        Ok(Admission::Rejected {
            retry_after_seconds: retry_after(
                Duration::milliseconds(quota.window_millis()),
                now - window_start,
            ),
        })
    }

    async fn ping(&self) -> Result<(), CounterStoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn step_resets_absent_counter() {
        let (counter, admission) = fixed_window_step(None, &Quota::new(2, 60), t0());
        assert_eq!(counter.count, 1);
        assert_eq!(counter.window_start, t0());
        assert_eq!(admission, Admission::Admitted { remaining: 1 });
    }

    #[test]
    fn step_rejects_full_window_with_retry_hint() {
        let full = RateLimitCounter {
            window_start: t0(),
            count: 2,
        };
        let (counter, admission) =
            fixed_window_step(Some(full), &Quota::new(2, 60), t0() + Duration::seconds(10));
        assert_eq!(counter.count, 2);
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_after_seconds: 50
            }
        );
    }

    #[test]
    fn step_resets_exactly_at_window_end() {
        let full = RateLimitCounter {
            window_start: t0(),
            count: 2,
        };
        let now = t0() + Duration::seconds(60);
        let (counter, admission) = fixed_window_step(Some(full), &Quota::new(2, 60), now);
        assert_eq!(counter.window_start, now);
        assert_eq!(counter.count, 1);
        assert!(admission.is_admitted());
    }

    #[test]
    fn zero_quota_always_rejects() {
        let (_, admission) = fixed_window_step(None, &Quota::new(0, 60), t0());
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_after_seconds: 60
            }
        );
    }

    #[test]
    fn huge_window_rejects_without_overflow() {
        let quota = Quota::new(1, u64::MAX);
        let (counter, first) = fixed_window_step(None, &quota, t0());
        assert!(first.is_admitted());

        let (_, second) = fixed_window_step(Some(counter), &quota, t0() + Duration::seconds(5));
        match second {
            Admission::Rejected {
                retry_after_seconds,
            } => assert!(retry_after_seconds > 1_000_000_000),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn in_memory_store_tracks_keys_independently() {
        let store = InMemoryCounterStore::new();
        let quota = Quota::new(1, 60);
        let chat = CounterKey::new("u1", "aiChat");
        let tests = CounterKey::new("u1", "practiceTest");

        assert!(store.consume(&tests, &quota, t0()).await.unwrap().is_admitted());
        assert!(!store.consume(&tests, &quota, t0()).await.unwrap().is_admitted());
        assert!(store.consume(&chat, &quota, t0()).await.unwrap().is_admitted());
        assert_eq!(store.snapshot(&tests).map(|c| c.count), Some(1));
    }

    #[tokio::test]
    async fn purge_drops_elapsed_windows() {
        let store = InMemoryCounterStore::new();
        let quota = Quota::new(5, 60);
        store
            .consume(&CounterKey::new("u1", "aiChat"), &quota, t0())
            .await
            .unwrap();
        store
            .consume(
                &CounterKey::new("u2", "aiChat"),
                &quota,
                t0() + Duration::seconds(30),
            )
            .await
            .unwrap();

        let purged = store.purge_expired(t0() + Duration::seconds(70), Duration::seconds(60));
        assert_eq!(purged, 1);
        assert!(store.snapshot(&CounterKey::new("u2", "aiChat")).is_some());
    }

    #[test]
    fn purge_keeps_slots_in_use() {
        let store = InMemoryCounterStore::new();
        let key = CounterKey::new("u1", "aiChat");
        let _in_flight = store.slot(&key).unwrap();

        assert_eq!(store.purge_expired(t0(), Duration::seconds(60)), 0);
        assert_eq!(store.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn consume_sweeps_elapsed_counters() {
        let store = InMemoryCounterStore::new();
        let quota = Quota::new(5, 60);
        for user in ["u1", "u2", "u3"] {
            store
                .consume(&CounterKey::new(user, "aiChat"), &quota, t0())
                .await
                .unwrap();
        }
        assert_eq!(store.tracked_keys(), 3);

        // within the window: no sweep yet
        store
            .consume(&CounterKey::new("u4", "aiChat"), &quota, t0() + Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(store.tracked_keys(), 4);

        store
            .consume(&CounterKey::new("u5", "aiChat"), &quota, t0() + Duration::seconds(61))
            .await
            .unwrap();
        // u1..u3 elapsed; u4 is still inside its window
        assert_eq!(store.tracked_keys(), 2);
        assert!(store.snapshot(&CounterKey::new("u4", "aiChat")).is_some());
        assert!(store.snapshot(&CounterKey::new("u5", "aiChat")).is_some());
    }

    #[test]
    fn redis_key_layout() {
        assert_eq!(
            CounterKey::new("u1", "aiChat").redis_key(),
            "ratelimit:feature:aiChat:user:u1"
        );
    }
}
