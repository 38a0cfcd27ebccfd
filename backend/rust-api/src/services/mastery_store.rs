use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::{FindOptions, ReplaceOptions},
    Database,
};
use serde::{Deserialize, Serialize};

use crate::metrics::STORE_OPERATIONS_TOTAL;
use crate::models::{mastery::record_storage_id, LearningObjective, MasteryRecord};

const OBJECTIVES_COLLECTION: &str = "learning_objectives";
const RECORDS_COLLECTION: &str = "mastery_records";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("mastery store unavailable: {0}")]
    Unavailable(String),
    #[error("module {0} not found")]
    ModuleNotFound(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Course objectives (read-only) and student mastery records
#[async_trait]
pub trait MasteryStore: Send + Sync {
    /// Objectives of a module in course order
    async fn objectives_for_module(
        &self,
        module_id: &str,
    ) -> Result<Vec<LearningObjective>, StoreError>;

    async fn records_for_student(
        &self,
        student_id: &str,
        objective_ids: &[String],
    ) -> Result<Vec<MasteryRecord>, StoreError>;

    /// Inserts or replaces the record for (student, objective)
    async fn save_record(&self, record: &MasteryRecord) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

/// Mongo document wrapper; `_id` is "{student_id}:{objective_id}"
#[derive(Debug, Serialize, Deserialize)]
struct MasteryRecordDocument {
    #[serde(rename = "_id")]
    id: String,
    #[serde(flatten)]
    record: MasteryRecord,
}

pub struct MongoMasteryStore {
    mongo: Database,
}

impl MongoMasteryStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn track<T>(&self, operation: &str, result: Result<T, StoreError>) -> Result<T, StoreError> {
        let status = if result.is_ok() { "success" } else { "error" };
        STORE_OPERATIONS_TOTAL
            .with_label_values(&["mongo", operation, status])
            .inc();
        result
    }

    async fn load_objectives(&self, module_id: &str) -> Result<Vec<LearningObjective>, StoreError> {
        let collection = self
            .mongo
            .collection::<LearningObjective>(OBJECTIVES_COLLECTION);
        let options = FindOptions::builder()
            .sort(doc! { "course_structure_order": 1, "_id": 1 })
            .build();

        let mut cursor = collection
            .find(doc! { "module_id": module_id })
            .with_options(options)
            .await?;

        let mut objectives = Vec::new();
        while let Some(objective) = cursor.try_next().await? {
            objectives.push(objective);
        }

        if objectives.is_empty() {
            return Err(StoreError::ModuleNotFound(module_id.to_string()));
        }
        Ok(objectives)
    }

    async fn load_records(
        &self,
        student_id: &str,
        objective_ids: &[String],
    ) -> Result<Vec<MasteryRecord>, StoreError> {
        let collection = self
            .mongo
            .collection::<MasteryRecordDocument>(RECORDS_COLLECTION);
        let ids: Vec<String> = objective_ids
            .iter()
            .map(|objective_id| record_storage_id(student_id, objective_id))
            .collect();

        let mut cursor = collection.find(doc! { "_id": { "$in": ids } }).await?;

        let mut records = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            records.push(doc.record);
        }
        Ok(records)
    }
}

#[async_trait]
impl MasteryStore for MongoMasteryStore {
    async fn objectives_for_module(
        &self,
        module_id: &str,
    ) -> Result<Vec<LearningObjective>, StoreError> {
        let result = self.load_objectives(module_id).await;
        self.track("objectives_for_module", result)
    }

    async fn records_for_student(
        &self,
        student_id: &str,
        objective_ids: &[String],
    ) -> Result<Vec<MasteryRecord>, StoreError> {
        let result = self.load_records(student_id, objective_ids).await;
        self.track("records_for_student", result)
    }

    async fn save_record(&self, record: &MasteryRecord) -> Result<(), StoreError> {
        let collection = self
            .mongo
            .collection::<MasteryRecordDocument>(RECORDS_COLLECTION);
        let id = record.storage_id();
        let document = MasteryRecordDocument {
            id: id.clone(),
            record: record.clone(),
        };

        let result = collection
            .replace_one(doc! { "_id": &id }, &document)
            .with_options(ReplaceOptions::builder().upsert(true).build())
            .await
            .map(|_| ())
            .map_err(StoreError::from);
        self.track("save_record", result)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.mongo
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_: Document| ())
            .map_err(StoreError::from)
    }

    fn name(&self) -> &'static str {
        "mongo"
    }
}

/// Process-local store for tests and local development
#[derive(Default)]
pub struct InMemoryMasteryStore {
    objectives: RwLock<HashMap<String, Vec<LearningObjective>>>,
    records: RwLock<HashMap<String, MasteryRecord>>,
}

impl InMemoryMasteryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objectives(objectives: Vec<LearningObjective>) -> Self {
        let store = Self::new();
        store.insert_objectives(objectives);
        store
    }

    pub fn insert_objectives(&self, objectives: Vec<LearningObjective>) {
        let mut modules = self
            .objectives
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for objective in objectives {
            modules
                .entry(objective.module_id.clone())
                .or_default()
                .push(objective);
        }
        for list in modules.values_mut() {
            list.sort_by(|a, b| {
                a.course_structure_order
                    .cmp(&b.course_structure_order)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
    }

    pub fn record(&self, student_id: &str, objective_id: &str) -> Option<MasteryRecord> {
        self.records
            .read()
            .ok()?
            .get(&record_storage_id(student_id, objective_id))
            .cloned()
    }
}

#[async_trait]
impl MasteryStore for InMemoryMasteryStore {
    async fn objectives_for_module(
        &self,
        module_id: &str,
    ) -> Result<Vec<LearningObjective>, StoreError> {
        let modules = self
            .objectives
            .read()
            .map_err(|_| StoreError::Unavailable("objective map lock poisoned".into()))?;
        modules
            .get(module_id)
            .filter(|list| !list.is_empty())
            .cloned()
            .ok_or_else(|| StoreError::ModuleNotFound(module_id.to_string()))
    }

    async fn records_for_student(
        &self,
        student_id: &str,
        objective_ids: &[String],
    ) -> Result<Vec<MasteryRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::Unavailable("record map lock poisoned".into()))?;
        Ok(objective_ids
            .iter()
            .filter_map(|objective_id| records.get(&record_storage_id(student_id, objective_id)))
            .cloned()
            .collect())
    }

    async fn save_record(&self, record: &MasteryRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::Unavailable("record map lock poisoned".into()))?;
        records.insert(record.storage_id(), record.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn objective(id: &str, module_id: &str, order: i64) -> LearningObjective {
        LearningObjective {
            id: id.to_string(),
            module_id: module_id.to_string(),
            course_structure_order: order,
            title: format!("Objective {}", id),
        }
    }

    #[tokio::test]
    async fn objectives_come_back_in_course_order() {
        let store = InMemoryMasteryStore::with_objectives(vec![
            objective("c", "m1", 3),
            objective("a", "m1", 1),
            objective("x", "m2", 1),
            objective("b", "m1", 2),
        ]);

        let ids: Vec<String> = store
            .objectives_for_module("m1")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_module_is_not_found() {
        let store = InMemoryMasteryStore::new();
        let err = store.objectives_for_module("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn save_replaces_existing_record() {
        let store = InMemoryMasteryStore::new();
        let mut record = MasteryRecord::new("s1", "a", Utc::now());
        store.save_record(&record).await.unwrap();

        record.demonstration_count = 1;
        record.formats_seen.insert("mcq".to_string());
        store.save_record(&record).await.unwrap();

        let loaded = store
            .records_for_student("s1", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn record_document_flattens_fields() {
        let record = MasteryRecord::new("s1", "a", Utc::now());
        let doc = mongodb::bson::to_document(&MasteryRecordDocument {
            id: record.storage_id(),
            record,
        })
        .unwrap();
        assert_eq!(doc.get_str("_id").unwrap(), "s1:a");
        assert_eq!(doc.get_str("mastery_level").unwrap(), "developing");
    }
}
