use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Learning objective stored in the "learning_objectives" collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearningObjective {
    #[serde(rename = "_id")]
    pub id: String,
    pub module_id: String,
    /// Canonical earliest-first position inside the module (waterfall priority)
    pub course_structure_order: i64,
    #[serde(default)]
    pub title: String,
}

/// Discrete progress label; ordering follows student progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    Developing,
    Approaching,
    Mastered,
}

impl MasteryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryLevel::Developing => "developing",
            MasteryLevel::Approaching => "approaching",
            MasteryLevel::Mastered => "mastered",
        }
    }
}

/// Per student × objective mastery state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasteryRecord {
    pub objective_id: String,
    pub student_id: String,
    pub mastery_level: MasteryLevel,
    pub demonstration_count: u32,
    #[serde(default)]
    pub formats_seen: BTreeSet<String>,
    #[serde(default)]
    pub has_recent_major_mistake: bool,
    #[serde(default)]
    pub reasoning_quality_satisfied: bool,
    pub updated_at: DateTime<Utc>,
}

impl MasteryRecord {
    /// Fresh record for an objective the student has never attempted
    pub fn new(student_id: &str, objective_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            objective_id: objective_id.to_string(),
            student_id: student_id.to_string(),
            mastery_level: MasteryLevel::Developing,
            demonstration_count: 0,
            formats_seen: BTreeSet::new(),
            has_recent_major_mistake: false,
            reasoning_quality_satisfied: false,
            updated_at: created_at,
        }
    }

    /// Storage identity: one document per student and objective
    pub fn storage_id(&self) -> String {
        record_storage_id(&self.student_id, &self.objective_id)
    }
}

pub fn record_storage_id(student_id: &str, objective_id: &str) -> String {
    format!("{}:{}", student_id, objective_id)
}

/// Severity reported by graders that distinguish mistake classes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MistakeSeverity {
    Minor,
    Major,
}

/// Graded answer produced by the external grading step
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QuestionEvaluationResult {
    #[validate(length(min = 1))]
    pub question_id: String,
    #[validate(length(min = 1))]
    pub student_id: String,
    #[validate(length(min = 1))]
    pub target_objective_ids: Vec<String>,
    pub is_correct: bool,
    pub reasoning_quality: bool,
    #[validate(length(min = 1, max = 64))]
    pub question_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_severity: Option<MistakeSeverity>,
    #[serde(default = "Utc::now")]
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitPracticeTestRequest {
    #[validate(length(min = 1), nested)]
    pub results: Vec<QuestionEvaluationResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitPracticeTestResponse {
    pub updated: Vec<MasteryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModuleMasteryResponse {
    pub module_id: String,
    pub student_id: String,
    pub records: Vec<MasteryRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mastery_levels_are_ordered_by_progress() {
        assert!(MasteryLevel::Developing < MasteryLevel::Approaching);
        assert!(MasteryLevel::Approaching < MasteryLevel::Mastered);
    }

    #[test]
    fn evaluation_defaults_optional_fields() {
        let result: QuestionEvaluationResult = serde_json::from_value(serde_json::json!({
            "question_id": "q1",
            "student_id": "s1",
            "target_objective_ids": ["lo-1"],
            "is_correct": true,
            "reasoning_quality": false,
            "question_format": "mcq"
        }))
        .unwrap();

        assert!(result.error_severity.is_none());
        assert!(result.validate().is_ok());
    }

    #[test]
    fn evaluation_without_targets_fails_validation() {
        let result: QuestionEvaluationResult = serde_json::from_value(serde_json::json!({
            "question_id": "q1",
            "student_id": "s1",
            "target_objective_ids": [],
            "is_correct": true,
            "reasoning_quality": true,
            "question_format": "mcq"
        }))
        .unwrap();

        assert!(result.validate().is_err());
    }
}
