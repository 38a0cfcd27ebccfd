use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::metrics::{MASTERY_NOOP_TOTAL, MASTERY_UPDATES_TOTAL};
use crate::models::{MasteryRecord, QuestionEvaluationResult};
use crate::utils::retry::{retry_with_policy, RetryPolicy};

use super::mastery::{MasteryError, MasteryTracker};
use super::mastery_store::{MasteryStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MasteryServiceError {
    #[error(transparent)]
    Mastery(#[from] MasteryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads, updates and persists mastery records around the pure tracker.
/// Updates for one student are serialized.
pub struct MasteryService {
    store: Arc<dyn MasteryStore>,
    tracker: MasteryTracker,
    retry: RetryPolicy,
    student_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MasteryService {
    pub fn new(store: Arc<dyn MasteryStore>, tracker: MasteryTracker) -> Self {
        Self {
            store,
            tracker,
            retry: RetryPolicy::default(),
            student_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn MasteryStore> {
        &self.store
    }

    fn student_lock(&self, student_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .student_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(student_id.to_string()).or_default().clone()
    }

    // Forget the student's lock once no other submission holds or waits on it
    fn release_student_lock(&self, student_id: &str) {
        let mut locks = self
            .student_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(student_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(student_id);
        }
    }

    #[cfg(test)]
    fn tracked_students(&self) -> usize {
        self.student_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Applies graded answers for one student in submission order and
    /// persists every record that changed.
    ///
    /// Validation runs over the whole submission before any write, so a bad
    /// result persists nothing. Writes are per record: if a save still fails
    /// after retries, records saved before it stay saved and the error is
    /// returned.
    pub async fn submit_evaluations(
        &self,
        module_id: &str,
        student_id: &str,
        results: &[QuestionEvaluationResult],
    ) -> Result<Vec<MasteryRecord>, MasteryServiceError> {
        for result in results {
            if result.student_id != student_id {
                return Err(MasteryError::Validation(format!(
                    "result for question {} belongs to student {}, not {}",
                    result.question_id, result.student_id, student_id
                ))
                .into());
            }
        }

        let lock = self.student_lock(student_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.apply_locked(module_id, student_id, results).await
        };
        drop(lock);
        self.release_student_lock(student_id);

        outcome
    }

    async fn apply_locked(
        &self,
        module_id: &str,
        student_id: &str,
        results: &[QuestionEvaluationResult],
    ) -> Result<Vec<MasteryRecord>, MasteryServiceError> {
        let objectives = self.store.objectives_for_module(module_id).await?;
        let objective_ids: Vec<String> = objectives.iter().map(|o| o.id.clone()).collect();
        let mut current: HashMap<String, MasteryRecord> = self
            .store
            .records_for_student(student_id, &objective_ids)
            .await?
            .into_iter()
            .map(|record| (record.objective_id.clone(), record))
            .collect();

        let mut changed: Vec<String> = Vec::new();
        for result in results {
            let existing: Vec<MasteryRecord> = result
                .target_objective_ids
                .iter()
                .filter_map(|id| current.get(id).cloned())
                .collect();

            let updated = self
                .tracker
                .apply_evaluation(result, &objectives, &existing)?;

            if updated.is_empty() {
                MASTERY_NOOP_TOTAL.inc();
            }
            for record in updated {
                if !changed.contains(&record.objective_id) {
                    changed.push(record.objective_id.clone());
                }
                current.insert(record.objective_id.clone(), record);
            }
        }

        let mut saved = Vec::with_capacity(changed.len());
        for objective_id in changed {
            let Some(record) = current.remove(&objective_id) else {
                continue;
            };
            retry_with_policy(&self.retry, "save_mastery_record", || {
                self.store.save_record(&record)
            })
            .await?;

            MASTERY_UPDATES_TOTAL
                .with_label_values(&[record.mastery_level.as_str()])
                .inc();
            tracing::info!(
                "Mastery updated: student={} module={} objective={} level={:?}",
                student_id,
                module_id,
                record.objective_id,
                record.mastery_level
            );
            saved.push(record);
        }

        Ok(saved)
    }

    /// Student's stored records for a module, in course order
    pub async fn records_for_module(
        &self,
        module_id: &str,
        student_id: &str,
    ) -> Result<Vec<MasteryRecord>, MasteryServiceError> {
        let objectives = self.store.objectives_for_module(module_id).await?;
        let objective_ids: Vec<String> = objectives.iter().map(|o| o.id.clone()).collect();
        let mut records: HashMap<String, MasteryRecord> = self
            .store
            .records_for_student(student_id, &objective_ids)
            .await?
            .into_iter()
            .map(|record| (record.objective_id.clone(), record))
            .collect();

        Ok(objective_ids
            .iter()
            .filter_map(|id| records.remove(id))
            .collect())
    }
}
