//! Test doubles shared by the service tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    CoreTask, Day, JournalEntry, NewSprint, Sprint, SprintStatus, TaskStatus, UserProfile,
    UserProgress, now,
};
use crate::remote::{DocumentRemoteStore, RemoteStore, SqliteDocumentStore};

/// A remote store over an in-memory document database that records every
/// call and can be told to fail
pub struct RecordingRemote {
    inner: DocumentRemoteStore,
    calls: Mutex<Vec<&'static str>>,
    offline: AtomicBool,
    failing_tasks: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingRemote {
    pub fn new() -> Self {
        let docs = Arc::new(SqliteDocumentStore::in_memory().unwrap());
        Self {
            inner: DocumentRemoteStore::new(docs),
            calls: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
            failing_tasks: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        }
    }

    /// Names of the calls made so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Fail every call with `RemoteUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail `update_task_status` for this task key
    pub fn fail_task(&self, key: &str) {
        self.failing_tasks.lock().unwrap().insert(key.to_string());
    }

    /// Sleep this long before answering each call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    async fn enter(&self, name: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(name);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable("test remote is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for RecordingRemote {
    async fn create_sprint(&self, user_id: &str, sprint: NewSprint) -> Result<String> {
        self.enter("create_sprint").await?;
        self.inner.create_sprint(user_id, sprint).await
    }

    async fn upsert_sprint(&self, sprint: &Sprint) -> Result<()> {
        self.enter("upsert_sprint").await?;
        self.inner.upsert_sprint(sprint).await
    }

    async fn get_sprint(&self, sprint_id: &str) -> Result<Option<Sprint>> {
        self.enter("get_sprint").await?;
        self.inner.get_sprint(sprint_id).await
    }

    async fn get_sprints_by_user(&self, user_id: &str) -> Result<Vec<Sprint>> {
        self.enter("get_sprints_by_user").await?;
        self.inner.get_sprints_by_user(user_id).await
    }

    async fn update_sprint(&self, sprint_id: &str, patch: Value) -> Result<()> {
        self.enter("update_sprint").await?;
        self.inner.update_sprint(sprint_id, patch).await
    }

    async fn delete_sprint(&self, sprint_id: &str, user_id: &str) -> Result<()> {
        self.enter("delete_sprint").await?;
        self.inner.delete_sprint(sprint_id, user_id).await
    }

    async fn get_user_progress(&self, user_id: &str, sprint_id: &str) -> Result<Option<UserProgress>> {
        self.enter("get_user_progress").await?;
        self.inner.get_user_progress(user_id, sprint_id).await
    }

    async fn save_user_progress(&self, progress: &UserProgress) -> Result<()> {
        self.enter("save_user_progress").await?;
        self.inner.save_user_progress(progress).await
    }

    async fn update_task_status(&self, user_id: &str, sprint_id: &str, status: TaskStatus) -> Result<()> {
        self.enter("update_task_status").await?;
        let key = status.key()?.to_string();
        if self.failing_tasks.lock().unwrap().contains(&key) {
            return Err(Error::RemoteUnavailable(format!("write of {key} rejected")));
        }
        self.inner.update_task_status(user_id, sprint_id, status).await
    }

    async fn update_journal_entry(&self, user_id: &str, sprint_id: &str, entry: JournalEntry) -> Result<()> {
        self.enter("update_journal_entry").await?;
        self.inner.update_journal_entry(user_id, sprint_id, entry).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.enter("get_user").await?;
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, profile: &UserProfile) -> Result<()> {
        self.enter("create_user").await?;
        self.inner.create_user(profile).await
    }

    async fn record_login(&self, profile: &UserProfile) -> Result<()> {
        self.enter("record_login").await?;
        self.inner.record_login(profile).await
    }
}

/// A 15-day sprint whose first two days have two core tasks and one special task
pub fn sample_sprint(id: &str, user_id: &str) -> Sprint {
    let day = |n: u32, date: &str| Day {
        day: format!("Day {n}"),
        date: date.to_string(),
        core_tasks: vec![
            CoreTask {
                category: "dsa".into(),
                description: "Solve two problems".into(),
            },
            CoreTask {
                category: "reading".into(),
                description: "One chapter".into(),
            },
        ],
        special_tasks: vec!["Mock interview".into()],
    };

    Sprint::from_new(
        id.to_string(),
        user_id.to_string(),
        NewSprint {
            title: format!("Sprint {id}"),
            description: String::new(),
            duration: 15,
            start_date: "2026-06-01".into(),
            end_date: "2026-06-15".into(),
            status: SprintStatus::Active,
            days: vec![day(1, "2026-06-01"), day(2, "2026-06-02")],
        },
        &now(),
    )
}
