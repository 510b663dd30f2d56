//! Data migration between identity tiers
//!
//! Moves guest bundles into a remote identity and back, replays the sync
//! queue against the remote store and refreshes the local cache from it.
//! Per-item failures are collected and never abort a batch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::guest::GuestService;
use crate::models::{
    CachedUserData, EntityType, JournalChange, Sprint, SyncOperation, SyncQueueItem,
    TaskStatusChange, UserProfile, UserProgress, now,
};
use crate::remote::RemoteStore;
use crate::store::LocalCache;

/// What a guest snapshot holds, for deciding whether to prompt for migration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestDataSummary {
    pub sprints: Vec<Sprint>,
    pub user_progress: Vec<UserProgress>,
    pub total_tasks: usize,
    pub total_journal_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratedCounts {
    pub sprints: usize,
    pub tasks: usize,
    pub journal_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub migrated_data: MigratedCounts,
    pub errors: Vec<String>,
}

impl MigrationResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            migrated_data: MigratedCounts::default(),
            errors: vec![error.into()],
        }
    }

    /// `PartialMigration` when any item failed
    pub fn as_error(&self) -> Option<Error> {
        (!self.errors.is_empty()).then(|| Error::PartialMigration {
            failed: self.errors.len(),
        })
    }
}

/// Outcome of one pass over a user's sync queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Replayed and removed from the queue
    pub replayed: usize,
    /// Failed and kept for another attempt
    pub failed: usize,
    /// Removed without being applied
    pub dropped: usize,
    /// Not attempted because their backoff window is still open
    pub skipped: usize,
    /// Another drain for the same user was running; nothing was attempted
    pub already_running: bool,
}

/// Marks one user's queue as draining until dropped
struct DrainGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    user_id: String,
}

impl<'a> DrainGuard<'a> {
    /// None when `user_id` is already draining
    fn acquire(active: &'a Mutex<HashSet<String>>, user_id: &str) -> Result<Option<Self>> {
        let mut users = active.lock().map_err(|_| Error::LockPoisoned)?;
        if !users.insert(user_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(Self {
            active,
            user_id: user_id.to_string(),
        }))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut users) = self.active.lock() {
            users.remove(&self.user_id);
        }
    }
}

#[derive(Clone)]
pub struct MigrationService {
    guests: GuestService,
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteStore>,
    policy: SyncConfig,
    draining: Arc<Mutex<HashSet<String>>>,
}

impl MigrationService {
    pub fn new(
        guests: GuestService,
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteStore>,
        policy: SyncConfig,
    ) -> Self {
        Self {
            guests,
            cache,
            remote,
            policy,
            draining: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// True while any queue drain is running
    pub fn is_draining(&self) -> bool {
        self.draining.lock().is_ok_and(|users| !users.is_empty())
    }

    /// True while `user_id`'s queue is draining
    pub fn is_draining_for(&self, user_id: &str) -> bool {
        self.draining
            .lock()
            .is_ok_and(|users| users.contains(user_id))
    }

    /// None when the current guest has no sprints, task statuses or journal entries
    pub fn get_guest_data_summary(&self) -> Result<Option<GuestDataSummary>> {
        let Some(guest_id) = self.guests.current_guest_id()? else {
            return Ok(None);
        };
        let Some(snapshot) = self.guests.load_guest_snapshot(&guest_id)? else {
            return Ok(None);
        };

        let total_tasks = snapshot.user_progress.iter().map(|p| p.task_statuses.len()).sum();
        let total_journal_entries = snapshot
            .user_progress
            .iter()
            .map(|p| p.journal_entries.len())
            .sum();

        if snapshot.sprints.is_empty() && total_tasks == 0 && total_journal_entries == 0 {
            return Ok(None);
        }

        Ok(Some(GuestDataSummary {
            sprints: snapshot.sprints,
            user_progress: snapshot.user_progress,
            total_tasks,
            total_journal_entries,
        }))
    }

    /// Copy the current guest bundle into `remote_id`'s remote records.
    ///
    /// The guest snapshot is deleted only when every item succeeded; after any
    /// failure it stays in place as a backup.
    pub async fn migrate_guest_data_to_user(&self, remote_id: &str) -> MigrationResult {
        let snapshot = match self.current_guest_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return MigrationResult::failed("No guest data found"),
            Err(e) => return MigrationResult::failed(format!("Failed to load guest data: {e}")),
        };

        let mut counts = MigratedCounts::default();
        let mut errors = Vec::new();

        for sprint in &snapshot.sprints {
            let mut sprint = sprint.clone();
            sprint.user_id = remote_id.to_string();
            sprint.updated_at = now();

            match self.remote.upsert_sprint(&sprint).await {
                Ok(()) => counts.sprints += 1,
                Err(e) => errors.push(format!("Failed to migrate sprint {}: {e}", sprint.id)),
            }
        }

        for progress in &snapshot.user_progress {
            let sprint_id = &progress.sprint_id;

            for status in &progress.task_statuses {
                match self
                    .remote
                    .update_task_status(remote_id, sprint_id, status.clone())
                    .await
                {
                    Ok(()) => counts.tasks += 1,
                    Err(e) => errors.push(format!(
                        "Failed to migrate task {}/{}/{} of sprint {sprint_id}: {e}",
                        status.day_id,
                        status.task_type.as_str(),
                        status.task_index
                    )),
                }
            }

            for entry in &progress.journal_entries {
                let mut entry = entry.clone();
                entry.user_id = remote_id.to_string();
                let day_id = entry.day_id.clone();

                match self.remote.update_journal_entry(remote_id, sprint_id, entry).await {
                    Ok(()) => counts.journal_entries += 1,
                    Err(e) => errors.push(format!(
                        "Failed to migrate journal entry {day_id} of sprint {sprint_id}: {e}"
                    )),
                }
            }
        }

        if errors.is_empty() {
            if let Err(e) = self.guests.delete_guest_snapshot(&snapshot.id) {
                errors.push(format!("Migrated, but failed to remove guest data: {e}"));
            }
        } else {
            tracing::warn!(
                guest_id = %snapshot.id,
                remote_id = %remote_id,
                failures = errors.len(),
                "Guest migration incomplete, keeping guest data"
            );
        }

        tracing::info!(
            remote_id = %remote_id,
            sprints = counts.sprints,
            tasks = counts.tasks,
            journal_entries = counts.journal_entries,
            "Guest migration finished"
        );

        MigrationResult {
            success: errors.is_empty(),
            migrated_data: counts,
            errors,
        }
    }

    fn current_guest_snapshot(&self) -> Result<Option<crate::models::GuestSnapshot>> {
        match self.guests.current_guest_id()? {
            Some(id) => self.guests.load_guest_snapshot(&id),
            None => Ok(None),
        }
    }

    /// Pull `remote_id`'s data into a brand-new guest identity
    pub async fn convert_user_data_to_guest(&self, remote_id: &str) -> Result<String> {
        let mut sprints = self.remote.get_sprints_by_user(remote_id).await?;
        let mut user_progress = Vec::new();
        for sprint in &sprints {
            if let Some(progress) = self.remote.get_user_progress(remote_id, &sprint.id).await? {
                user_progress.push(progress);
            }
        }

        let guest_id = self.guests.create_new_guest_session()?;
        for sprint in &mut sprints {
            sprint.user_id = guest_id.clone();
        }
        for progress in &mut user_progress {
            progress.user_id = guest_id.clone();
            for entry in &mut progress.journal_entries {
                entry.user_id = guest_id.clone();
            }
        }

        tracing::info!(
            remote_id = %remote_id,
            guest_id = %guest_id,
            sprints = sprints.len(),
            "Converted account data to guest"
        );
        self.guests
            .save_guest_snapshot(&guest_id, sprints, user_progress, UserProfile::guest(&guest_id))?;
        Ok(guest_id)
    }

    /// Append a write to the sync queue
    pub fn queue_for_sync(
        &self,
        user_id: &str,
        operation: SyncOperation,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<i64> {
        let id = self
            .cache
            .enqueue(user_id, operation, entity_type, entity_id, &data)?;
        tracing::debug!(
            user_id = %user_id,
            queue_id = id,
            operation = operation.as_str(),
            entity_type = entity_type.as_str(),
            "Queued write for sync"
        );
        Ok(id)
    }

    /// Replay `user_id`'s queue in FIFO order.
    ///
    /// A failed item is retried on later drains until it has failed
    /// `max_retries` times, then dropped. Items that can never apply are
    /// dropped at once.
    pub async fn sync_local_to_remote(&self, user_id: &str) -> Result<DrainReport> {
        let Some(_guard) = DrainGuard::acquire(&self.draining, user_id)? else {
            tracing::info!(user_id = %user_id, "Queue drain already running");
            return Ok(DrainReport {
                already_running: true,
                ..DrainReport::default()
            });
        };

        let items = self.cache.pending_for_user(user_id)?;
        let mut report = DrainReport::default();

        for item in items {
            if !self.is_due(&item) {
                report.skipped += 1;
                continue;
            }

            match self.replay(&item).await {
                Ok(()) => {
                    self.remove_item(&item);
                    report.replayed += 1;
                }
                Err(e @ (Error::Validation(_) | Error::Serialization(_))) => {
                    tracing::warn!(queue_id = item.id, error = %e, "Dropping queued write that cannot apply");
                    self.remove_item(&item);
                    report.dropped += 1;
                }
                Err(e) => {
                    let attempts = item.retry_count + 1;
                    if attempts >= self.policy.max_retries {
                        let exhausted = Error::SyncExhausted {
                            item_id: item.id,
                            attempts,
                        };
                        tracing::warn!(
                            user_id = %user_id,
                            entity_type = item.entity_type.as_str(),
                            entity_id = %item.entity_id,
                            last_error = %e,
                            "{exhausted}"
                        );
                        self.remove_item(&item);
                        report.dropped += 1;
                    } else {
                        tracing::debug!(queue_id = item.id, attempts, error = %e, "Queued write failed");
                        if let Err(e) = self.cache.record_attempt(item.id, attempts, &now()) {
                            tracing::error!(queue_id = item.id, error = %e, "Failed to record sync attempt");
                        }
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            tracing::info!(
                user_id = %user_id,
                replayed = report.replayed,
                failed = report.failed,
                dropped = report.dropped,
                skipped = report.skipped,
                "Sync queue drained"
            );
        }
        Ok(report)
    }

    fn remove_item(&self, item: &SyncQueueItem) {
        if let Err(e) = self.cache.remove_queue_item(item.id) {
            tracing::error!(queue_id = item.id, error = %e, "Failed to remove queued write");
        }
    }

    fn is_due(&self, item: &SyncQueueItem) -> bool {
        let delay = self.policy.backoff_delay(item.retry_count);
        if delay.is_zero() {
            return true;
        }
        let Some(last) = item
            .last_attempt
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        else {
            return true;
        };
        let elapsed = Utc::now() - last.with_timezone(&Utc);
        elapsed.to_std().map(|e| e >= delay).unwrap_or(false)
    }

    async fn replay(&self, item: &SyncQueueItem) -> Result<()> {
        let data = item.data.clone();
        match (item.operation, item.entity_type) {
            (SyncOperation::Create, EntityType::Sprint) => {
                let sprint: Sprint = serde_json::from_value(data)?;
                self.remote.upsert_sprint(&sprint).await
            }
            (SyncOperation::Update, EntityType::Sprint) => {
                self.remote.update_sprint(&item.entity_id, data).await
            }
            (SyncOperation::Delete, EntityType::Sprint) => {
                self.remote.delete_sprint(&item.entity_id, &item.user_id).await
            }
            (SyncOperation::Create | SyncOperation::Update, EntityType::Progress) => {
                let progress: UserProgress = serde_json::from_value(data)?;
                self.remote.save_user_progress(&progress).await
            }
            (SyncOperation::Create | SyncOperation::Update, EntityType::Task) => {
                let change: TaskStatusChange = serde_json::from_value(data)?;
                self.remote
                    .update_task_status(&item.user_id, &change.sprint_id, change.task_status)
                    .await
            }
            (SyncOperation::Create | SyncOperation::Update, EntityType::Journal) => {
                let change: JournalChange = serde_json::from_value(data)?;
                self.remote
                    .update_journal_entry(&item.user_id, &change.sprint_id, change.entry)
                    .await
            }
            (SyncOperation::Delete, entity) => Err(Error::Validation(format!(
                "delete is not supported for {}",
                entity.as_str()
            ))),
        }
    }

    /// Replace the cached snapshot of `user_id` with the remote state
    pub async fn sync_remote_to_local(&self, user_id: &str) -> Result<CachedUserData> {
        let sprints = self.remote.get_sprints_by_user(user_id).await?;
        let mut user_progress = Vec::new();
        for sprint in &sprints {
            if let Some(progress) = self.remote.get_user_progress(user_id, &sprint.id).await? {
                user_progress.push(progress);
            }
        }
        let user = self.remote.get_user(user_id).await?;

        let cached = CachedUserData {
            user_id: user_id.to_string(),
            sprints,
            user_progress,
            user,
            last_sync_at: now(),
            is_stale: false,
            resumable: false,
        };
        self.cache.put_cached_user(&cached)?;

        tracing::info!(
            user_id = %user_id,
            sprints = cached.sprints.len(),
            "Local cache refreshed from remote"
        );
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_storage::LocalStorage;
    use crate::models::{JournalEntry, TaskKey, TaskStatus};
    use crate::testing::{RecordingRemote, sample_sprint};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        guests: GuestService,
        cache: Arc<LocalCache>,
        remote: Arc<RecordingRemote>,
        migration: MigrationService,
    }

    fn fixture() -> Fixture {
        let cache = Arc::new(LocalCache::in_memory().unwrap());
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let guests = GuestService::new(cache.clone(), storage);
        let remote = Arc::new(RecordingRemote::new());
        let migration = MigrationService::new(
            guests.clone(),
            cache.clone(),
            remote.clone(),
            SyncConfig::default(),
        );
        Fixture {
            guests,
            cache,
            remote,
            migration,
        }
    }

    /// 2 sprints, 5 task statuses, 3 journal entries
    fn seed_guest(guests: &GuestService) -> String {
        let id = guests.get_or_create_guest_id().unwrap();
        guests.update_guest_sprint(&id, sample_sprint("s1", &id)).unwrap();
        guests.update_guest_sprint(&id, sample_sprint("s2", &id)).unwrap();

        for key in ["day-1-core-0", "day-1-core-1", "day-1-special-0"] {
            guests
                .update_guest_task_status(&id, "s1", TaskStatus::new(TaskKey::parse(key).unwrap(), true))
                .unwrap();
        }
        for key in ["day-1-core-0", "day-2-core-0"] {
            guests
                .update_guest_task_status(&id, "s2", TaskStatus::new(TaskKey::parse(key).unwrap(), true))
                .unwrap();
        }
        for (sprint, day) in [("s1", "Day 1"), ("s1", "Day 2"), ("s2", "Day 1")] {
            guests
                .update_guest_journal_entry(
                    &id,
                    sprint,
                    JournalEntry {
                        day_id: day.into(),
                        content: format!("notes for {day}"),
                        updated_at: now(),
                        user_id: id.clone(),
                    },
                )
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn summary_is_none_without_content() {
        let f = fixture();
        assert!(f.migration.get_guest_data_summary().unwrap().is_none());

        let id = f.guests.get_or_create_guest_id().unwrap();
        f.guests
            .save_guest_snapshot(&id, vec![], vec![], UserProfile::guest(&id))
            .unwrap();
        assert!(f.migration.get_guest_data_summary().unwrap().is_none());

        seed_guest(&f.guests);
        let summary = f.migration.get_guest_data_summary().unwrap().unwrap();
        assert_eq!(summary.sprints.len(), 2);
        assert_eq!(summary.total_tasks, 5);
        assert_eq!(summary.total_journal_entries, 3);
    }

    #[tokio::test]
    async fn full_migration_moves_everything_and_removes_guest_data() {
        let f = fixture();
        let guest_id = seed_guest(&f.guests);

        let result = f.migration.migrate_guest_data_to_user("uid-1").await;

        assert!(result.success, "{:?}", result.errors);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.migrated_data,
            MigratedCounts {
                sprints: 2,
                tasks: 5,
                journal_entries: 3
            }
        );
        assert!(!f.guests.has_guest_data(Some(&guest_id)).unwrap());

        let progress = f.remote.get_user_progress("uid-1", "s1").await.unwrap().unwrap();
        assert_eq!(progress.task_statuses.len(), 3);
        assert_eq!(progress.journal_entries.len(), 2);
        assert!(progress.journal_entries.iter().all(|e| e.user_id == "uid-1"));
    }

    #[tokio::test]
    async fn partial_failure_keeps_guest_data() {
        let f = fixture();
        let guest_id = seed_guest(&f.guests);
        f.remote.fail_task("day-1-core-1");

        let result = f.migration.migrate_guest_data_to_user("uid-1").await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.migrated_data.tasks, 4);
        assert_eq!(result.migrated_data.sprints, 2);
        assert!(matches!(result.as_error(), Some(Error::PartialMigration { failed: 1 })));
        assert!(f.guests.has_guest_data(Some(&guest_id)).unwrap());
    }

    #[tokio::test]
    async fn migration_without_guest_data_fails_fast() {
        let f = fixture();
        let result = f.migration.migrate_guest_data_to_user("uid-1").await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn convert_copies_remote_data_into_new_guest() {
        let f = fixture();
        let old_guest = f.guests.get_or_create_guest_id().unwrap();
        f.remote.upsert_sprint(&sample_sprint("s9", "uid-1")).await.unwrap();
        f.remote
            .update_task_status("uid-1", "s9", TaskStatus::new(TaskKey::parse("day-1-core-0").unwrap(), true))
            .await
            .unwrap();

        let guest_id = f.migration.convert_user_data_to_guest("uid-1").await.unwrap();

        assert_ne!(guest_id, old_guest);
        assert_eq!(f.guests.get_or_create_guest_id().unwrap(), guest_id);
        let snapshot = f.guests.load_guest_snapshot(&guest_id).unwrap().unwrap();
        assert_eq!(snapshot.sprints[0].user_id, guest_id);
        assert_eq!(snapshot.user_progress[0].user_id, guest_id);
        assert_eq!(snapshot.user_progress[0].task_statuses.len(), 1);
    }

    #[tokio::test]
    async fn queue_replays_in_order() {
        let f = fixture();
        let sprint = sample_sprint("s1", "uid-1");
        f.migration
            .queue_for_sync("uid-1", SyncOperation::Create, EntityType::Sprint, "s1", json!(sprint))
            .unwrap();
        f.migration
            .queue_for_sync(
                "uid-1",
                SyncOperation::Update,
                EntityType::Task,
                "day-1-core-0",
                json!(TaskStatusChange {
                    sprint_id: "s1".into(),
                    task_status: TaskStatus::new(TaskKey::parse("day-1-core-0").unwrap(), true),
                }),
            )
            .unwrap();

        let report = f.migration.sync_local_to_remote("uid-1").await.unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(f.cache.pending_count("uid-1").unwrap(), 0);
        assert_eq!(f.remote.calls(), vec!["upsert_sprint", "update_task_status"]);
        let progress = f.remote.get_user_progress("uid-1", "s1").await.unwrap().unwrap();
        assert_eq!(progress.stats.total_tasks_completed, 1);
    }

    #[tokio::test]
    async fn failing_item_is_dropped_on_fifth_failure() {
        let f = fixture();
        f.remote.set_offline(true);
        f.migration
            .queue_for_sync("uid-1", SyncOperation::Update, EntityType::Sprint, "s1", json!({"title": "x"}))
            .unwrap();

        for attempt in 1..=4 {
            let report = f.migration.sync_local_to_remote("uid-1").await.unwrap();
            assert_eq!(report.failed, 1);
            let item = &f.cache.pending_for_user("uid-1").unwrap()[0];
            assert_eq!(item.retry_count, attempt);
        }

        let report = f.migration.sync_local_to_remote("uid-1").await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(f.cache.pending_count("uid-1").unwrap(), 0);

        // Nothing left for a sixth attempt
        let calls_before = f.remote.calls().len();
        f.migration.sync_local_to_remote("uid-1").await.unwrap();
        assert_eq!(f.remote.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn unsupported_operations_are_dropped_immediately() {
        let f = fixture();
        f.migration
            .queue_for_sync("uid-1", SyncOperation::Delete, EntityType::Journal, "Day 1", json!(null))
            .unwrap();

        let report = f.migration.sync_local_to_remote("uid-1").await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(f.cache.pending_count("uid-1").unwrap(), 0);
    }

    #[tokio::test]
    async fn backoff_skips_items_inside_their_window() {
        let cache = Arc::new(LocalCache::in_memory().unwrap());
        let guests = GuestService::new(cache.clone(), Arc::new(LocalStorage::in_memory().unwrap()));
        let remote = Arc::new(RecordingRemote::new());
        remote.set_offline(true);
        let policy = SyncConfig {
            exponential_backoff: true,
            backoff_base_secs: 60,
            ..SyncConfig::default()
        };
        let migration = MigrationService::new(guests, cache.clone(), remote.clone(), policy);
        migration
            .queue_for_sync("uid-1", SyncOperation::Update, EntityType::Sprint, "s1", json!({}))
            .unwrap();

        assert_eq!(migration.sync_local_to_remote("uid-1").await.unwrap().failed, 1);
        assert_eq!(migration.sync_local_to_remote("uid-1").await.unwrap().skipped, 1);
        assert_eq!(cache.pending_for_user("uid-1").unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn drains_are_exclusive_per_user() {
        let f = fixture();
        for user in ["uid-1", "uid-2"] {
            let sprint = sample_sprint(&format!("s-{user}"), user);
            f.migration
                .queue_for_sync(user, SyncOperation::Create, EntityType::Sprint, &sprint.id, json!(sprint))
                .unwrap();
        }
        f.remote.set_delay(Duration::from_millis(200));

        let background = f.migration.clone();
        let first = tokio::spawn(async move { background.sync_local_to_remote("uid-1").await });
        for _ in 0..100 {
            if f.migration.is_draining_for("uid-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.migration.is_draining_for("uid-1"));

        let overlapping = f.migration.sync_local_to_remote("uid-1").await.unwrap();
        assert!(overlapping.already_running);
        assert_eq!(overlapping.replayed, 0);

        let other = f.migration.sync_local_to_remote("uid-2").await.unwrap();
        assert!(!other.already_running);
        assert_eq!(other.replayed, 1);

        assert_eq!(first.await.unwrap().unwrap().replayed, 1);
        assert!(!f.migration.is_draining());
    }

    #[tokio::test]
    async fn remote_to_local_replaces_cache() {
        let f = fixture();
        f.remote.upsert_sprint(&sample_sprint("s1", "uid-1")).await.unwrap();

        let cached = f.migration.sync_remote_to_local("uid-1").await.unwrap();
        assert_eq!(cached.sprints.len(), 1);
        assert_eq!(cached.user_progress.len(), 1);

        let stored = f.cache.get_cached_user("uid-1").unwrap().unwrap();
        assert!(!stored.is_stale);
        assert_eq!(stored.sprints[0].id, "s1");
    }
}
