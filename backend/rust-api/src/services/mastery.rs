//! Objective mastery tracking.
//!
//! A graded question may exercise several learning objectives. Only the
//! earliest objective (in course order) that the student has not yet mastered
//! advances; everything else is left untouched. Mastery levels are always
//! derived from the record's counters and rubric flags, never assigned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{
    LearningObjective, MasteryLevel, MasteryRecord, MistakeSeverity, QuestionEvaluationResult,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MasteryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("corrupt mastery record {student_id}:{objective_id}: {reason}")]
    CorruptRecord {
        student_id: String,
        objective_id: String,
        reason: String,
    },
}

/// Thresholds for the mastery level rule; unset fields keep their defaults
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MasteryThresholds {
    pub min_demonstrations_for_mastered: u32,
    pub min_formats_for_mastered: u32,
    pub min_demonstrations_for_approaching: u32,
}

impl Default for MasteryThresholds {
    fn default() -> Self {
        Self {
            min_demonstrations_for_mastered: 3,
            min_formats_for_mastered: 2,
            min_demonstrations_for_approaching: 2,
        }
    }
}

impl MasteryThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_demonstrations_for_mastered == 0
            || self.min_formats_for_mastered == 0
            || self.min_demonstrations_for_approaching == 0
        {
            return Err("mastery thresholds must be at least 1".to_string());
        }
        if self.min_demonstrations_for_approaching > self.min_demonstrations_for_mastered {
            return Err(format!(
                "min_demonstrations_for_approaching ({}) exceeds min_demonstrations_for_mastered ({})",
                self.min_demonstrations_for_approaching, self.min_demonstrations_for_mastered
            ));
        }
        Ok(())
    }
}

/// Effect of one graded answer on the major-mistake rubric blocker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MistakeSignal {
    /// Sets the blocker
    Major,
    /// Leaves the blocker as it is
    Minor,
    /// Clears the blocker
    Recovered,
}

pub trait MistakeClassifier: Send + Sync {
    fn classify(&self, result: &QuestionEvaluationResult) -> MistakeSignal;
}

/// Any incorrect answer is major unless the grader reported it as minor;
/// a correct answer counts as recovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMistakeClassifier;

impl MistakeClassifier for DefaultMistakeClassifier {
    fn classify(&self, result: &QuestionEvaluationResult) -> MistakeSignal {
        if result.is_correct {
            return MistakeSignal::Recovered;
        }
        match result.error_severity {
            Some(MistakeSeverity::Minor) => MistakeSignal::Minor,
            Some(MistakeSeverity::Major) | None => MistakeSignal::Major,
        }
    }
}

/// Mastery level rule. Fails on records that break the counter invariants.
pub fn compute_level(
    record: &MasteryRecord,
    thresholds: &MasteryThresholds,
) -> Result<MasteryLevel, MasteryError> {
    check_record(record)?;

    let demonstrations = record.demonstration_count;
    let formats = record.formats_seen.len();

    let mastered = demonstrations >= thresholds.min_demonstrations_for_mastered
        && formats >= thresholds.min_formats_for_mastered as usize
        && !record.has_recent_major_mistake
        && record.reasoning_quality_satisfied;
    if mastered {
        return Ok(MasteryLevel::Mastered);
    }

    if demonstrations >= thresholds.min_demonstrations_for_approaching
        && !record.has_recent_major_mistake
    {
        return Ok(MasteryLevel::Approaching);
    }

    Ok(MasteryLevel::Developing)
}

fn check_record(record: &MasteryRecord) -> Result<(), MasteryError> {
    let corrupt = |reason: String| {
        tracing::error!(
            "Mastery invariant violated for student={} objective={}: {}",
            record.student_id,
            record.objective_id,
            reason
        );
        Err(MasteryError::CorruptRecord {
            student_id: record.student_id.clone(),
            objective_id: record.objective_id.clone(),
            reason,
        })
    };

    // each demonstration contributes at most one new format
    if record.formats_seen.len() > record.demonstration_count as usize {
        return corrupt(format!(
            "{} formats recorded for {} demonstrations",
            record.formats_seen.len(),
            record.demonstration_count
        ));
    }
    if record.formats_seen.iter().any(|f| f.trim().is_empty()) {
        return corrupt("empty question format tag".to_string());
    }
    Ok(())
}

pub struct MasteryTracker {
    thresholds: MasteryThresholds,
    classifier: Arc<dyn MistakeClassifier>,
}

impl MasteryTracker {
    pub fn new(thresholds: MasteryThresholds) -> Self {
        Self::with_classifier(thresholds, Arc::new(DefaultMistakeClassifier))
    }

    pub fn with_classifier(
        thresholds: MasteryThresholds,
        classifier: Arc<dyn MistakeClassifier>,
    ) -> Self {
        Self {
            thresholds,
            classifier,
        }
    }

    pub fn thresholds(&self) -> &MasteryThresholds {
        &self.thresholds
    }

    /// Applies one graded answer using the waterfall rule.
    ///
    /// `objectives` is the module's objective list and `existing` the
    /// student's current records for (a subset of) the targeted objectives.
    /// Returns the mutated record, or nothing when every targeted objective is
    /// already mastered. Never mutates its inputs.
    pub fn apply_evaluation(
        &self,
        result: &QuestionEvaluationResult,
        objectives: &[LearningObjective],
        existing: &[MasteryRecord],
    ) -> Result<Vec<MasteryRecord>, MasteryError> {
        let targets = self.ordered_targets(result, objectives)?;

        let mut records: HashMap<&str, &MasteryRecord> = HashMap::new();
        for record in existing {
            if record.student_id != result.student_id {
                return Err(MasteryError::Validation(format!(
                    "record for objective {} belongs to student {}, not {}",
                    record.objective_id, record.student_id, result.student_id
                )));
            }
            if !targets.iter().any(|o| o.id == record.objective_id) {
                return Err(MasteryError::Validation(format!(
                    "record for objective {} is not targeted by question {}",
                    record.objective_id, result.question_id
                )));
            }
            records.insert(record.objective_id.as_str(), record);
        }

        let mut target = None;
        for objective in &targets {
            let current = match records.get(objective.id.as_str()) {
                Some(record) => {
                    // stored levels are derived data; re-derive before trusting them
                    let level = compute_level(record, &self.thresholds)?;
                    (*record).clone().with_level(level)
                }
                None => MasteryRecord::new(&result.student_id, &objective.id, result.evaluated_at),
            };
            if current.mastery_level != MasteryLevel::Mastered {
                target = Some(current);
                break;
            }
        }

        let Some(mut record) = target else {
            tracing::debug!(
                "All objectives targeted by question {} already mastered for student {}",
                result.question_id,
                result.student_id
            );
            return Ok(Vec::new());
        };

        record.demonstration_count = record.demonstration_count.saturating_add(1);
        record.formats_seen.insert(result.question_format.clone());
        match self.classifier.classify(result) {
            MistakeSignal::Major => record.has_recent_major_mistake = true,
            MistakeSignal::Recovered => record.has_recent_major_mistake = false,
            MistakeSignal::Minor => {}
        }
        record.reasoning_quality_satisfied = result.reasoning_quality;
        record.updated_at = result.evaluated_at;
        record.mastery_level = compute_level(&record, &self.thresholds)?;

        tracing::debug!(
            "Waterfall update: student={} objective={} level={:?} demonstrations={}",
            record.student_id,
            record.objective_id,
            record.mastery_level,
            record.demonstration_count
        );

        Ok(vec![record])
    }

    fn ordered_targets<'a>(
        &self,
        result: &QuestionEvaluationResult,
        objectives: &'a [LearningObjective],
    ) -> Result<Vec<&'a LearningObjective>, MasteryError> {
        if result.target_objective_ids.is_empty() {
            return Err(MasteryError::Validation(format!(
                "question {} targets no objectives",
                result.question_id
            )));
        }
        if result.question_format.trim().is_empty() {
            return Err(MasteryError::Validation(format!(
                "question {} has an empty format tag",
                result.question_id
            )));
        }

        let wanted: BTreeSet<&str> = result
            .target_objective_ids
            .iter()
            .map(String::as_str)
            .collect();

        let mut targets = Vec::with_capacity(wanted.len());
        for id in &wanted {
            let objective = objectives.iter().find(|o| o.id == *id).ok_or_else(|| {
                MasteryError::Validation(format!(
                    "objective {} is not part of the course objective list",
                    id
                ))
            })?;
            targets.push(objective);
        }

        targets.sort_by(|a, b| {
            a.course_structure_order
                .cmp(&b.course_structure_order)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(targets)
    }
}

impl MasteryRecord {
    fn with_level(mut self, level: MasteryLevel) -> Self {
        self.mastery_level = level;
        self
    }
}
