use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FEATURE_PRACTICE_TEST: &str = "practiceTest";
pub const FEATURE_AI_CHAT: &str = "aiChat";
pub const FEATURE_FLASHCARDS: &str = "flashcards";
pub const FEATURE_LEARNING_OBJECTIVES: &str = "learningObjectives";

/// Fixed-window quota for one feature
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Quota {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub user_id: String,
    pub feature_key: String,
}

impl CounterKey {
    pub fn new(user_id: &str, feature_key: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            feature_key: feature_key.to_string(),
        }
    }

    pub fn redis_key(&self) -> String {
        format!(
            "ratelimit:feature:{}:user:{}",
            self.feature_key, self.user_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitCounter {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Admitted { remaining: u32 },
    Rejected { retry_after_seconds: u64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub feature: String,
    pub remaining: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuotaExceededResponse {
    pub message: String,
    pub feature: String,
    pub retry_after_seconds: u64,
}
