pub mod mastery;
pub mod rate_limit;

pub use mastery::{
    LearningObjective, MasteryLevel, MasteryRecord, MistakeSeverity, QuestionEvaluationResult,
};
pub use rate_limit::{Admission, CounterKey, Quota, RateLimitCounter};
