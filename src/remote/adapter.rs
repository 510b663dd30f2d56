//! Domain adapter over a document store
//!
//! Every progress mutation is a read-modify-write of the whole `userProgress`
//! document so `stats` always agree with `taskStatuses`. There is no version
//! check: concurrent writers from several clients can overwrite each other.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use super::{Direction, Document, DocumentStore, Query, RemoteStore, collections};
use crate::error::{Error, Result};
use crate::models::{JournalEntry, NewSprint, Sprint, TaskStatus, UserProfile, UserProgress, now};
use crate::stats;

#[derive(Clone)]
pub struct DocumentRemoteStore {
    docs: Arc<dyn DocumentStore>,
}

impl DocumentRemoteStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// The document holding the progress of `(user_id, sprint_id)`, if any
    async fn find_progress(&self, user_id: &str, sprint_id: &str) -> Result<Option<Document>> {
        let docs = self
            .docs
            .query(
                &Query::new(collections::USER_PROGRESS)
                    .where_eq("userId", user_id)
                    .where_eq("sprintId", sprint_id),
            )
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn put_progress(&self, doc_id: &str, progress: &UserProgress) -> Result<()> {
        self.docs
            .put(collections::USER_PROGRESS, doc_id, serde_json::to_value(progress)?)
            .await
    }

    async fn load_progress_required(&self, user_id: &str, sprint_id: &str) -> Result<(String, UserProgress)> {
        let doc = self
            .find_progress(user_id, sprint_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("progress for {user_id}/{sprint_id}")))?;
        let progress = serde_json::from_value(doc.data)?;
        Ok((doc.id, progress))
    }

    /// Write a sprint, then its empty progress record. Rolls the sprint back if
    /// the progress write fails.
    async fn insert_sprint_with_progress(&self, sprint: &Sprint) -> Result<()> {
        self.docs
            .put(collections::SPRINTS, &sprint.id, serde_json::to_value(sprint)?)
            .await?;

        let progress = UserProgress::empty(&sprint.user_id, &sprint.id);
        let doc_id = progress_doc_id(&sprint.user_id, &sprint.id);
        if let Err(e) = self.put_progress(&doc_id, &progress).await {
            tracing::warn!(sprint_id = %sprint.id, error = %e, "Progress provisioning failed, removing sprint");
            if let Err(rollback) = self.docs.delete(collections::SPRINTS, &sprint.id).await {
                tracing::error!(sprint_id = %sprint.id, error = %rollback, "Sprint rollback failed");
            }
            return Err(e);
        }
        Ok(())
    }
}

fn progress_doc_id(user_id: &str, sprint_id: &str) -> String {
    format!("{user_id}_{sprint_id}")
}

#[async_trait]
impl RemoteStore for DocumentRemoteStore {
    async fn create_sprint(&self, user_id: &str, sprint: NewSprint) -> Result<String> {
        sprint.validate()?;
        let id = Uuid::new_v4().to_string();
        let sprint = Sprint::from_new(id.clone(), user_id.to_string(), sprint, &now());

        self.insert_sprint_with_progress(&sprint).await?;
        tracing::info!(user_id = %user_id, sprint_id = %id, "Sprint created");
        Ok(id)
    }

    async fn upsert_sprint(&self, sprint: &Sprint) -> Result<()> {
        if self.docs.get(collections::SPRINTS, &sprint.id).await?.is_some() {
            let mut doc = serde_json::to_value(sprint)?;
            doc["updatedAt"] = json!(now());
            return self.docs.put(collections::SPRINTS, &sprint.id, doc).await;
        }

        let mut sprint = sprint.clone();
        if sprint.created_at.is_empty() {
            sprint.created_at = now();
        }
        sprint.updated_at = now();
        self.insert_sprint_with_progress(&sprint).await
    }

    async fn get_sprint(&self, sprint_id: &str) -> Result<Option<Sprint>> {
        self.docs
            .get(collections::SPRINTS, sprint_id)
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }

    async fn get_sprints_by_user(&self, user_id: &str) -> Result<Vec<Sprint>> {
        let docs = self
            .docs
            .query(
                &Query::new(collections::SPRINTS)
                    .where_eq("userId", user_id)
                    .order_by("createdAt", Direction::Desc),
            )
            .await?;

        docs.into_iter()
            .map(|d| serde_json::from_value(d.data).map_err(Into::into))
            .collect()
    }

    async fn update_sprint(&self, sprint_id: &str, patch: Value) -> Result<()> {
        let Value::Object(mut fields) = patch else {
            return Err(Error::Validation("sprint patch must be a JSON object".into()));
        };
        // Ownership and identity never change through a patch
        fields.remove("id");
        fields.remove("userId");
        fields.insert("updatedAt".into(), json!(now()));

        self.docs
            .merge(collections::SPRINTS, sprint_id, Value::Object(fields))
            .await
    }

    async fn delete_sprint(&self, sprint_id: &str, user_id: &str) -> Result<()> {
        self.docs.delete(collections::SPRINTS, sprint_id).await?;

        let progress_docs = self
            .docs
            .query(
                &Query::new(collections::USER_PROGRESS)
                    .where_eq("userId", user_id)
                    .where_eq("sprintId", sprint_id),
            )
            .await?;
        for doc in progress_docs {
            self.docs.delete(collections::USER_PROGRESS, &doc.id).await?;
        }

        tracing::info!(user_id = %user_id, sprint_id = %sprint_id, "Sprint deleted");
        Ok(())
    }

    async fn get_user_progress(&self, user_id: &str, sprint_id: &str) -> Result<Option<UserProgress>> {
        self.find_progress(user_id, sprint_id)
            .await?
            .map(|doc| serde_json::from_value(doc.data).map_err(Into::into))
            .transpose()
    }

    async fn save_user_progress(&self, progress: &UserProgress) -> Result<()> {
        let doc_id = match self.find_progress(&progress.user_id, &progress.sprint_id).await? {
            Some(doc) => doc.id,
            None => progress_doc_id(&progress.user_id, &progress.sprint_id),
        };
        let mut progress = progress.clone();
        progress.updated_at = now();
        self.put_progress(&doc_id, &progress).await
    }

    async fn update_task_status(&self, user_id: &str, sprint_id: &str, status: TaskStatus) -> Result<()> {
        let (doc_id, mut progress) = self.load_progress_required(user_id, sprint_id).await?;
        let sprint = self
            .get_sprint(sprint_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sprint {sprint_id}")))?;

        stats::upsert_task_status(&mut progress.task_statuses, status);
        stats::recompute(&sprint, &mut progress, Utc::now().date_naive());
        progress.updated_at = now();

        self.put_progress(&doc_id, &progress).await
    }

    async fn update_journal_entry(&self, user_id: &str, sprint_id: &str, entry: JournalEntry) -> Result<()> {
        let (doc_id, mut progress) = self.load_progress_required(user_id, sprint_id).await?;

        stats::upsert_journal_entry(&mut progress.journal_entries, entry);
        progress.updated_at = now();

        self.put_progress(&doc_id, &progress).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.docs
            .get(collections::USERS, user_id)
            .await?
            .map(|doc| serde_json::from_value(doc).map_err(Into::into))
            .transpose()
    }

    async fn create_user(&self, profile: &UserProfile) -> Result<()> {
        self.docs
            .put(collections::USERS, &profile.id, serde_json::to_value(profile)?)
            .await
    }

    async fn record_login(&self, profile: &UserProfile) -> Result<()> {
        self.docs
            .merge(
                collections::USERS,
                &profile.id,
                json!({
                    "lastLoginAt": now(),
                    "email": profile.email,
                    "displayName": profile.display_name,
                    "photoUrl": profile.photo_url,
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoreTask, Day, SprintStatus, TaskKey};
    use crate::remote::SqliteDocumentStore;

    fn remote() -> (DocumentRemoteStore, Arc<SqliteDocumentStore>) {
        let docs = Arc::new(SqliteDocumentStore::in_memory().unwrap());
        (DocumentRemoteStore::new(docs.clone()), docs)
    }

    fn new_sprint(title: &str) -> NewSprint {
        NewSprint {
            title: title.into(),
            description: "Learn things".into(),
            duration: 15,
            start_date: "2026-06-01".into(),
            end_date: "2026-06-15".into(),
            status: SprintStatus::Planned,
            days: vec![Day {
                day: "Day 1".into(),
                date: "2026-06-01".into(),
                core_tasks: vec![
                    CoreTask {
                        category: "dsa".into(),
                        description: "Two problems".into(),
                    },
                    CoreTask {
                        category: "system design".into(),
                        description: "Read a chapter".into(),
                    },
                ],
                special_tasks: vec![],
            }],
        }
    }

    /// Refuses every write to the progress collection
    struct NoProgressWrites(SqliteDocumentStore);

    #[async_trait]
    impl DocumentStore for NoProgressWrites {
        async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
            self.0.get(collection, id).await
        }

        async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
            if collection == collections::USER_PROGRESS {
                return Err(Error::RemoteUnavailable("progress writes refused".into()));
            }
            self.0.put(collection, id, doc).await
        }

        async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
            self.0.merge(collection, id, patch).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<()> {
            self.0.delete(collection, id).await
        }

        async fn query(&self, query: &Query) -> Result<Vec<Document>> {
            self.0.query(query).await
        }
    }

    #[tokio::test]
    async fn failed_progress_write_rolls_back_sprint() {
        let remote = DocumentRemoteStore::new(Arc::new(NoProgressWrites(
            SqliteDocumentStore::in_memory().unwrap(),
        )));

        let err = remote.create_sprint("u1", new_sprint("Doomed")).await.unwrap_err();

        assert!(err.is_remote_unavailable());
        assert!(remote.get_sprints_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_sprint_provisions_progress() {
        let (remote, _) = remote();
        let id = remote.create_sprint("u1", new_sprint("First")).await.unwrap();

        let sprint = remote.get_sprint(&id).await.unwrap().unwrap();
        assert_eq!(sprint.user_id, "u1");
        assert!(!sprint.created_at.is_empty());

        let progress = remote.get_user_progress("u1", &id).await.unwrap().unwrap();
        assert_eq!(progress.stats.completion_percentage, 0);
        assert!(progress.task_statuses.is_empty());
    }

    #[tokio::test]
    async fn create_sprint_rejects_invalid_duration() {
        let (remote, docs) = remote();
        let mut sprint = new_sprint("Bad");
        sprint.duration = 7;

        let err = remote.create_sprint("u1", sprint).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(docs.count(collections::SPRINTS).unwrap(), 0);
    }

    #[tokio::test]
    async fn sprints_are_listed_newest_first() {
        let (remote, _) = remote();
        let first = remote.create_sprint("u1", new_sprint("First")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = remote.create_sprint("u1", new_sprint("Second")).await.unwrap();
        remote.create_sprint("u2", new_sprint("Other")).await.unwrap();

        let ids: Vec<String> = remote
            .get_sprints_by_user("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[tokio::test]
    async fn update_sprint_merges_and_restamps() {
        let (remote, _) = remote();
        let id = remote.create_sprint("u1", new_sprint("First")).await.unwrap();
        let before = remote.get_sprint(&id).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        remote
            .update_sprint(&id, json!({"status": "active", "userId": "intruder"}))
            .await
            .unwrap();

        let after = remote.get_sprint(&id).await.unwrap().unwrap();
        assert_eq!(after.status, SprintStatus::Active);
        assert_eq!(after.user_id, "u1");
        assert_eq!(after.title, "First");
        assert_ne!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn delete_sprint_cascades_to_progress() {
        let (remote, docs) = remote();
        let id = remote.create_sprint("u1", new_sprint("First")).await.unwrap();
        remote.delete_sprint(&id, "u1").await.unwrap();

        assert!(remote.get_sprint(&id).await.unwrap().is_none());
        assert_eq!(docs.count(collections::USER_PROGRESS).unwrap(), 0);
    }

    #[tokio::test]
    async fn task_status_upsert_keeps_single_entry() {
        let (remote, _) = remote();
        let id = remote.create_sprint("u1", new_sprint("First")).await.unwrap();
        let key = TaskKey::parse("day-1-core-0").unwrap();

        remote
            .update_task_status("u1", &id, TaskStatus::new(key, false))
            .await
            .unwrap();
        remote
            .update_task_status("u1", &id, TaskStatus::new(key, true))
            .await
            .unwrap();

        let progress = remote.get_user_progress("u1", &id).await.unwrap().unwrap();
        assert_eq!(progress.task_statuses.len(), 1);
        assert!(progress.task_statuses[0].completed);
        assert_eq!(progress.stats.total_tasks_completed, 1);
        assert_eq!(progress.stats.completion_percentage, 50);
    }

    #[tokio::test]
    async fn task_status_requires_progress() {
        let (remote, _) = remote();
        let key = TaskKey::parse("day-1-core-0").unwrap();
        let err = remote
            .update_task_status("u1", "nope", TaskStatus::new(key, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn journal_entries_upsert_by_day() {
        let (remote, _) = remote();
        let id = remote.create_sprint("u1", new_sprint("First")).await.unwrap();
        for content in ["one", "two"] {
            remote
                .update_journal_entry(
                    "u1",
                    &id,
                    JournalEntry {
                        day_id: "Day 1".into(),
                        content: content.into(),
                        updated_at: now(),
                        user_id: "u1".into(),
                    },
                )
                .await
                .unwrap();
        }

        let progress = remote.get_user_progress("u1", &id).await.unwrap().unwrap();
        assert_eq!(progress.journal_entries.len(), 1);
        assert_eq!(progress.journal_entries[0].content, "two");
    }

    #[tokio::test]
    async fn upsert_sprint_creates_then_updates() {
        let (remote, docs) = remote();
        let id = remote.create_sprint("guest_x", new_sprint("Guest")).await.unwrap();
        let mut sprint = remote.get_sprint(&id).await.unwrap().unwrap();
        remote.delete_sprint(&id, "guest_x").await.unwrap();

        sprint.user_id = "u1".into();
        remote.upsert_sprint(&sprint).await.unwrap();
        assert!(remote.get_user_progress("u1", &id).await.unwrap().is_some());

        sprint.title = "Renamed".into();
        remote.upsert_sprint(&sprint).await.unwrap();
        assert_eq!(remote.get_sprint(&id).await.unwrap().unwrap().title, "Renamed");
        assert_eq!(docs.count(collections::USER_PROGRESS).unwrap(), 1);
    }

    #[tokio::test]
    async fn user_profiles() {
        let (remote, _) = remote();
        let mut profile = UserProfile {
            id: "u1".into(),
            email: Some("ada@example.com".into()),
            display_name: Some("Ada".into()),
            photo_url: None,
            is_guest: false,
            created_at: now(),
            last_login_at: "2020-01-01T00:00:00Z".into(),
        };
        remote.create_user(&profile).await.unwrap();

        profile.display_name = Some("Ada Lovelace".into());
        remote.record_login(&profile).await.unwrap();

        let stored = remote.get_user("u1").await.unwrap().unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Ada Lovelace"));
        assert_ne!(stored.last_login_at, "2020-01-01T00:00:00Z");
    }
}
