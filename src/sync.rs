//! Sync orchestration
//!
//! The single entry point page-level code talks to. Picks the storage tier
//! for each read and write from the active identity and the connectivity
//! signal, and drives the tier transitions on sign-in and sign-out. Public
//! operations return outcome values; failures are logged and reported in
//! them instead of being returned as errors.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Config, SyncConfig};
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};
use crate::guest::{GuestService, generate_guest_id, progress_entry};
use crate::local_storage::{LocalStorage, LocalUser};
use crate::migration::{DrainReport, GuestDataSummary, MigrationResult, MigrationService};
use crate::models::{
    CachedUserData, EntityType, Identity, JournalChange, Sprint, SyncOperation, TaskStatusChange,
    UserProfile, UserProgress, now,
};
use crate::remote::{DocumentRemoteStore, HttpDocumentStore, RemoteStore};
use crate::stats;
use crate::store::LocalCache;

pub const LOCAL_ID_PREFIX: &str = "local_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_at: Option<String>,
    pub pending_changes: usize,
    pub sync_in_progress: bool,
    pub has_local_changes: bool,
}

/// Result of a cold start
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInit {
    pub user: Identity,
    pub needs_migration: bool,
    pub migration_data: Option<GuestDataSummary>,
    pub sync_status: SyncStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOutcome {
    pub success: bool,
    pub migration_result: Option<MigrationResult>,
    pub error: Option<String>,
}

/// What to do with an authenticated user's data on sign-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutOption {
    /// Wipe every local copy
    Delete,
    /// Continue as a new guest holding a copy of the account's data
    Convert,
    /// Continue fully offline under a local identity that remembers the account
    Keep,
}

impl LogoutOption {
    pub fn as_str(self) -> &'static str {
        match self {
            LogoutOption::Delete => "delete",
            LogoutOption::Convert => "convert",
            LogoutOption::Keep => "keep",
        }
    }
}

impl fmt::Display for LogoutOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogoutOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "delete" => Ok(LogoutOption::Delete),
            "convert" => Ok(LogoutOption::Convert),
            "keep" => Ok(LogoutOption::Keep),
            other => Err(Error::Validation(format!("unsupported logout option '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutOutcome {
    pub success: bool,
    pub new_guest_id: Option<String>,
    /// The identity to continue with
    pub identity: Option<Identity>,
    pub error: Option<String>,
}

impl LogoutOutcome {
    fn failed(error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// A batch of writes. Absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct UserDataUpdate {
    pub sprints: Option<Vec<Sprint>>,
    pub user_progress: Option<Vec<UserProgress>>,
    pub task_statuses: Option<Vec<TaskStatusChange>>,
    pub journal_entries: Option<Vec<JournalChange>>,
}

impl UserDataUpdate {
    fn has_progress_changes(&self) -> bool {
        self.task_statuses.as_ref().is_some_and(|c| !c.is_empty())
            || self.journal_entries.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Sprint ids touched by task status or journal changes
    fn changed_sprint_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .task_statuses
            .iter()
            .flatten()
            .map(|c| c.sprint_id.as_str())
            .chain(self.journal_entries.iter().flatten().map(|c| c.sprint_id.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub success: bool,
    /// Writes deferred to the sync queue
    pub queued: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedData {
    pub sprints: Vec<Sprint>,
    pub user_progress: Vec<UserProgress>,
    pub from_cache: bool,
}

pub struct SyncService {
    guests: GuestService,
    migration: MigrationService,
    cache: Arc<LocalCache>,
    storage: Arc<LocalStorage>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
}

impl SyncService {
    pub fn new(
        cache: Arc<LocalCache>,
        storage: Arc<LocalStorage>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
        policy: SyncConfig,
    ) -> Self {
        let guests = GuestService::new(cache.clone(), storage.clone());
        let migration = MigrationService::new(guests.clone(), cache.clone(), remote.clone(), policy);
        Self {
            guests,
            migration,
            cache,
            storage,
            remote,
            connectivity,
        }
    }

    /// Client wiring from configuration: on-disk local tiers and the HTTP document store
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = Arc::new(LocalCache::open(&config.storage.cache_path)?);
        let storage = Arc::new(LocalStorage::open(&config.storage.local_storage_path)?);
        let docs = HttpDocumentStore::new(
            &config.remote.url,
            &config.remote.token,
            config.remote.request_timeout(),
        )?;
        let remote = Arc::new(DocumentRemoteStore::new(Arc::new(docs)));
        Ok(Self::new(
            cache,
            storage,
            remote,
            Connectivity::default(),
            config.sync.clone(),
        ))
    }

    pub fn guests(&self) -> &GuestService {
        &self.guests
    }

    pub fn migration(&self) -> &MigrationService {
        &self.migration
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Cold-start identity, in priority order: the local identity marker, a
    /// guest with saved data, otherwise the guest id with an empty snapshot.
    pub fn resolve_initial_identity(&self) -> Result<Identity> {
        if let Some(local) = self.storage.local_user()? {
            return Ok(Identity::Local {
                id: local.id,
                original_remote_id: local.original_remote_id,
            });
        }

        if let Some(id) = self.guests.current_guest_id()?
            && self.guests.load_guest_snapshot(&id)?.is_some()
        {
            return Ok(Identity::guest(id));
        }

        let id = self.guests.get_or_create_guest_id()?;
        self.guests
            .save_guest_snapshot(&id, Vec::new(), Vec::new(), UserProfile::guest(&id))?;
        Ok(Identity::guest(id))
    }

    /// Resolve the starting identity. Always yields one: on storage failure a
    /// fresh guest session, and if even that fails an unpersisted guest id.
    pub fn initialize_app(&self) -> AppInit {
        let user = match self.resolve_initial_identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!(error = %e, "Failed to resolve identity, starting a new guest session");
                match self.guests.create_new_guest_session() {
                    Ok(id) => Identity::guest(id),
                    Err(e) => {
                        tracing::error!(error = %e, "Guest session could not be persisted");
                        Identity::guest(generate_guest_id())
                    }
                }
            }
        };

        let migration_data = self.migration.get_guest_data_summary().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to inspect guest data");
            None
        });
        let sync_status = self.get_sync_status(Some(&user));

        tracing::info!(
            identity = %user.id(),
            needs_migration = migration_data.is_some(),
            "App initialized"
        );

        AppInit {
            user,
            needs_migration: migration_data.is_some(),
            migration_data,
            sync_status,
        }
    }

    /// Migrate guest data if there is any, then warm the cache
    pub async fn handle_user_authentication(&self, remote_id: &str) -> AuthOutcome {
        let mut outcome = AuthOutcome::default();

        match self.guests.has_guest_data(None) {
            Ok(true) => {
                let result = self.migration.migrate_guest_data_to_user(remote_id).await;
                if let Some(e) = result.as_error() {
                    outcome.error = Some(e.to_string());
                }
                outcome.migration_result = Some(result);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(remote_id = %remote_id, error = %e, "Failed to inspect guest data");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        if let Err(e) = self.migration.sync_remote_to_local(remote_id).await {
            tracing::warn!(remote_id = %remote_id, error = %e, "Cache warm-up failed");
            outcome.error.get_or_insert_with(|| e.to_string());
            return outcome;
        }

        outcome.success = outcome.error.is_none();
        outcome
    }

    /// True when signing in as `remote_id` should resume earlier offline work
    /// instead of migrating guest data
    pub fn has_resumable_state(&self, remote_id: &str) -> Result<bool> {
        let remembered = self
            .storage
            .local_user()?
            .and_then(|local| local.original_remote_id)
            .is_some_and(|id| id == remote_id);
        Ok(remembered || self.cache.pending_count(remote_id)? > 0)
    }

    /// Replay queued writes for `remote_id`, refresh the cache and leave the
    /// local identity
    pub async fn resume_user_session(&self, remote_id: &str) -> AuthOutcome {
        let mut outcome = AuthOutcome::default();

        match self.migration.sync_local_to_remote(remote_id).await {
            Ok(report) if report.already_running || report.failed + report.skipped > 0 => {
                tracing::warn!(
                    remote_id = %remote_id,
                    already_running = report.already_running,
                    pending = report.failed + report.skipped,
                    "Offline changes not fully replayed, keeping local identity"
                );
                outcome.error = Some("offline changes are still waiting to sync".to_string());
                return outcome;
            }
            Ok(report) if report.dropped > 0 => {
                outcome.error = Some(format!("{} offline change(s) could not be synced", report.dropped));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(remote_id = %remote_id, error = %e, "Offline changes not replayed, keeping local identity");
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        if let Err(e) = self.migration.sync_remote_to_local(remote_id).await {
            tracing::warn!(remote_id = %remote_id, error = %e, "Cache warm-up failed");
            outcome.error.get_or_insert_with(|| e.to_string());
            return outcome;
        }

        if let Err(e) = self.leave_local_identity(Some(remote_id)) {
            outcome.error.get_or_insert_with(|| e.to_string());
        }

        outcome.success = outcome.error.is_none();
        tracing::info!(remote_id = %remote_id, success = outcome.success, "Resumed account session");
        outcome
    }

    /// Create the profile on first sight, otherwise refresh its login fields
    pub async fn upsert_user_profile(&self, profile: &UserProfile) -> Result<()> {
        match self.remote.get_user(&profile.id).await? {
            Some(_) => self.remote.record_login(profile).await,
            None => self.remote.create_user(profile).await,
        }
    }

    /// Drop the local identity marker and the data stored under it,
    /// optionally only when it remembers `remote_id`
    pub fn leave_local_identity(&self, remote_id: Option<&str>) -> Result<()> {
        let Some(local) = self.storage.local_user()? else {
            return Ok(());
        };
        if remote_id.is_some_and(|id| local.original_remote_id.as_deref() != Some(id)) {
            return Ok(());
        }
        let removed = self.storage.clear_user_data(&local.id)?;
        self.storage.clear_local_user()?;
        tracing::info!(local_id = %local.id, removed_keys = removed, "Left local identity");
        Ok(())
    }

    pub async fn handle_user_logout(&self, identity: &Identity, option: &str) -> LogoutOutcome {
        match option.parse::<LogoutOption>() {
            Ok(option) => self.logout(identity, option).await,
            Err(e) => {
                tracing::warn!(identity = %identity.id(), option = %option, "Rejected logout option");
                LogoutOutcome::failed(e)
            }
        }
    }

    pub async fn logout(&self, identity: &Identity, option: LogoutOption) -> LogoutOutcome {
        let user_id = identity.id();
        let result = match option {
            LogoutOption::Delete => self.logout_delete(user_id),
            LogoutOption::Convert => self.logout_convert(user_id).await,
            LogoutOption::Keep => self.logout_keep(user_id).await,
        };

        match result {
            Ok(outcome) => {
                tracing::info!(user_id = %user_id, option = %option, "Logged out");
                outcome
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, option = %option, error = %e, "Logout failed");
                LogoutOutcome::failed(e)
            }
        }
    }

    fn logout_delete(&self, user_id: &str) -> Result<LogoutOutcome> {
        self.cache.delete_cached_user(user_id)?;
        let discarded = self.cache.clear_queue(user_id)?;
        let snapshots = self.guests.clear_all_guest_data()?;
        self.storage.clear_user_data(user_id)?;
        self.leave_local_identity(None)?;

        tracing::info!(
            user_id = %user_id,
            discarded_changes = discarded,
            guest_snapshots = snapshots,
            "Deleted local data"
        );

        let guest_id = self.guests.create_new_guest_session()?;
        Ok(LogoutOutcome {
            success: true,
            identity: Some(Identity::guest(guest_id.clone())),
            new_guest_id: Some(guest_id),
            error: None,
        })
    }

    async fn logout_convert(&self, user_id: &str) -> Result<LogoutOutcome> {
        let guest_id = self.migration.convert_user_data_to_guest(user_id).await?;
        Ok(LogoutOutcome {
            success: true,
            identity: Some(Identity::guest(guest_id.clone())),
            new_guest_id: Some(guest_id),
            error: None,
        })
    }

    async fn logout_keep(&self, user_id: &str) -> Result<LogoutOutcome> {
        let mut snapshot = match self.migration.sync_remote_to_local(user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_remote_unavailable() => {
                tracing::warn!(user_id = %user_id, error = %e, "Remote unavailable, keeping cached data");
                self.cache
                    .get_cached_user(user_id)?
                    .unwrap_or_else(|| empty_cache(user_id))
            }
            Err(e) => return Err(e),
        };
        snapshot.resumable = true;
        self.cache.put_cached_user(&snapshot)?;

        let local_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());
        let sprints: Vec<Sprint> = snapshot
            .sprints
            .iter()
            .cloned()
            .map(|mut s| {
                s.user_id = local_id.clone();
                s
            })
            .collect();
        self.storage.set_sprints(&local_id, &sprints)?;
        for progress in &snapshot.user_progress {
            let mut progress = progress.clone();
            progress.user_id = local_id.clone();
            self.storage.set_progress(&progress)?;
        }

        self.storage.set_local_user(&LocalUser {
            id: local_id.clone(),
            original_remote_id: Some(user_id.to_string()),
            display_name: snapshot.user.as_ref().and_then(|u| u.display_name.clone()),
            created_at: now(),
        })?;

        tracing::info!(
            user_id = %user_id,
            local_id = %local_id,
            sprints = sprints.len(),
            "Kept account data for offline use"
        );

        Ok(LogoutOutcome {
            success: true,
            new_guest_id: None,
            identity: Some(Identity::Local {
                id: local_id,
                original_remote_id: Some(user_id.to_string()),
            }),
            error: None,
        })
    }

    pub fn get_sync_status(&self, identity: Option<&Identity>) -> SyncStatus {
        let mut status = SyncStatus {
            is_online: self.connectivity.is_online(),
            sync_in_progress: self.migration.is_draining(),
            ..SyncStatus::default()
        };

        let remote_id = match identity {
            None => return status,
            Some(Identity::Guest { id }) => {
                status.has_local_changes = self.guests.has_guest_data(Some(id)).unwrap_or_else(|e| {
                    tracing::warn!(guest_id = %id, error = %e, "Failed to inspect guest data");
                    false
                });
                return status;
            }
            Some(Identity::Local {
                id,
                original_remote_id: None,
            }) => {
                match self.storage.sprints(id) {
                    Ok(sprints) => status.has_local_changes = !sprints.is_empty(),
                    Err(e) => tracing::warn!(local_id = %id, error = %e, "Failed to read local data"),
                }
                return status;
            }
            Some(Identity::Local {
                original_remote_id: Some(remote_id),
                ..
            }) => remote_id.as_str(),
            Some(Identity::Remote { id }) => id.as_str(),
        };

        status.sync_in_progress = self.migration.is_draining_for(remote_id);
        match self.cache.pending_count(remote_id) {
            Ok(pending) => status.pending_changes = pending,
            Err(e) => tracing::warn!(user_id = %remote_id, error = %e, "Failed to count pending changes"),
        }
        match self.cache.get_cached_user(remote_id) {
            Ok(cached) => {
                status.last_sync_at = cached
                    .map(|c| c.last_sync_at)
                    .filter(|ts| !ts.is_empty());
            }
            Err(e) => tracing::warn!(user_id = %remote_id, error = %e, "Failed to read cache"),
        }
        status.has_local_changes = status.pending_changes > 0;
        status
    }

    /// Route a batch of writes to the tier that owns `identity`'s data
    pub async fn save_user_data(&self, identity: &Identity, update: UserDataUpdate) -> SaveOutcome {
        let result = match identity {
            Identity::Guest { id } => self.save_guest(id, update).map(|()| 0),
            Identity::Local {
                id,
                original_remote_id,
            } => self.save_local(id, original_remote_id.as_deref(), update),
            Identity::Remote { id } if self.connectivity.is_online() => {
                self.save_remote(id, update).await
            }
            Identity::Remote { id } => self.save_offline(id, &update),
        };

        match result {
            Ok(queued) => SaveOutcome {
                success: true,
                queued,
                error: None,
            },
            Err(e) => {
                tracing::error!(identity = %identity.id(), error = %e, "Failed to save user data");
                SaveOutcome {
                    success: false,
                    queued: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn save_guest(&self, guest_id: &str, update: UserDataUpdate) -> Result<()> {
        for sprint in update.sprints.into_iter().flatten() {
            self.guests.update_guest_sprint(guest_id, sprint)?;
        }
        for progress in update.user_progress.into_iter().flatten() {
            self.guests.update_guest_progress(guest_id, progress)?;
        }
        for change in update.task_statuses.into_iter().flatten() {
            self.guests
                .update_guest_task_status(guest_id, &change.sprint_id, change.task_status)?;
        }
        for change in update.journal_entries.into_iter().flatten() {
            let mut entry = change.entry;
            entry.user_id = guest_id.to_string();
            self.guests
                .update_guest_journal_entry(guest_id, &change.sprint_id, entry)?;
        }
        Ok(())
    }

    fn save_local(
        &self,
        local_id: &str,
        original_remote_id: Option<&str>,
        update: UserDataUpdate,
    ) -> Result<usize> {
        if let Some(updated) = &update.sprints {
            let mut sprints = self.storage.sprints(local_id)?;
            for sprint in updated {
                let mut sprint = sprint.clone();
                sprint.user_id = local_id.to_string();
                let id = sprint.id.clone();
                upsert_by(&mut sprints, sprint, |s| s.id == id);
            }
            self.storage.set_sprints(local_id, &sprints)?;
        }
        for progress in update.user_progress.iter().flatten() {
            let mut progress = progress.clone();
            progress.user_id = local_id.to_string();
            self.storage.set_progress(&progress)?;
        }
        if update.has_progress_changes() {
            let sprints = self.storage.sprints(local_id)?;
            let mut records = Vec::new();
            for sprint_id in update.changed_sprint_ids() {
                if let Some(progress) = self.storage.progress(local_id, sprint_id)? {
                    records.push(progress);
                }
            }
            apply_progress_changes(&sprints, &mut records, local_id, &update);
            for progress in &records {
                self.storage.set_progress(progress)?;
            }
        }

        let Some(remote_id) = original_remote_id else {
            return Ok(0);
        };
        self.queue_update(remote_id, &update)
    }

    async fn save_remote(&self, remote_id: &str, update: UserDataUpdate) -> Result<usize> {
        let written = self.write_remote(remote_id, &update).await;
        match written {
            Ok(()) => {
                self.apply_to_cache(remote_id, &update, false)?;
                Ok(0)
            }
            Err(e) if e.is_remote_unavailable() => {
                tracing::warn!(user_id = %remote_id, error = %e, "Remote write failed, queueing");
                self.save_offline(remote_id, &update)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_remote(&self, remote_id: &str, update: &UserDataUpdate) -> Result<()> {
        for sprint in update.sprints.iter().flatten() {
            let mut sprint = sprint.clone();
            sprint.user_id = remote_id.to_string();
            self.remote.upsert_sprint(&sprint).await?;
        }
        for progress in update.user_progress.iter().flatten() {
            let mut progress = progress.clone();
            progress.user_id = remote_id.to_string();
            self.remote.save_user_progress(&progress).await?;
        }
        for change in update.task_statuses.iter().flatten() {
            self.remote
                .update_task_status(remote_id, &change.sprint_id, change.task_status.clone())
                .await?;
        }
        for change in update.journal_entries.iter().flatten() {
            let mut entry = change.entry.clone();
            entry.user_id = remote_id.to_string();
            self.remote
                .update_journal_entry(remote_id, &change.sprint_id, entry)
                .await?;
        }
        Ok(())
    }

    fn save_offline(&self, remote_id: &str, update: &UserDataUpdate) -> Result<usize> {
        let queued = self.queue_update(remote_id, update)?;
        self.apply_to_cache(remote_id, update, true)?;
        Ok(queued)
    }

    /// Queue every write of `update` on behalf of `remote_id`
    fn queue_update(&self, remote_id: &str, update: &UserDataUpdate) -> Result<usize> {
        let mut queued = 0;
        for sprint in update.sprints.iter().flatten() {
            let mut sprint = sprint.clone();
            sprint.user_id = remote_id.to_string();
            self.migration.queue_for_sync(
                remote_id,
                SyncOperation::Create,
                EntityType::Sprint,
                &sprint.id,
                serde_json::to_value(&sprint)?,
            )?;
            queued += 1;
        }
        for progress in update.user_progress.iter().flatten() {
            let mut progress = progress.clone();
            progress.user_id = remote_id.to_string();
            self.migration.queue_for_sync(
                remote_id,
                SyncOperation::Update,
                EntityType::Progress,
                &progress.sprint_id,
                serde_json::to_value(&progress)?,
            )?;
            queued += 1;
        }
        for change in update.task_statuses.iter().flatten() {
            self.migration.queue_for_sync(
                remote_id,
                SyncOperation::Update,
                EntityType::Task,
                &change.sprint_id,
                serde_json::to_value(change)?,
            )?;
            queued += 1;
        }
        for change in update.journal_entries.iter().flatten() {
            let mut change = change.clone();
            change.entry.user_id = remote_id.to_string();
            self.migration.queue_for_sync(
                remote_id,
                SyncOperation::Update,
                EntityType::Journal,
                &change.sprint_id,
                serde_json::to_value(&change)?,
            )?;
            queued += 1;
        }
        Ok(queued)
    }

    fn apply_to_cache(&self, remote_id: &str, update: &UserDataUpdate, stale: bool) -> Result<()> {
        let mut cached = self
            .cache
            .get_cached_user(remote_id)?
            .unwrap_or_else(|| empty_cache(remote_id));

        for sprint in update.sprints.iter().flatten() {
            let mut sprint = sprint.clone();
            sprint.user_id = remote_id.to_string();
            let id = sprint.id.clone();
            upsert_by(&mut cached.sprints, sprint, |s| s.id == id);
        }
        for progress in update.user_progress.iter().flatten() {
            let mut progress = progress.clone();
            progress.user_id = remote_id.to_string();
            let sprint_id = progress.sprint_id.clone();
            upsert_by(&mut cached.user_progress, progress, |p| p.sprint_id == sprint_id);
        }
        apply_progress_changes(&cached.sprints, &mut cached.user_progress, remote_id, update);

        if stale {
            cached.is_stale = true;
        } else {
            cached.last_sync_at = now();
        }
        self.cache.put_cached_user(&cached)
    }

    /// Read `identity`'s data from the tier that owns it
    pub async fn load_user_data(&self, identity: &Identity) -> Result<LoadedData> {
        match identity {
            Identity::Guest { id } => {
                let snapshot = self.guests.load_guest_snapshot(id)?;
                Ok(snapshot
                    .map(|s| LoadedData {
                        sprints: s.sprints,
                        user_progress: s.user_progress,
                        from_cache: false,
                    })
                    .unwrap_or_default())
            }
            Identity::Local { id, .. } => Ok(LoadedData {
                sprints: self.storage.sprints(id)?,
                user_progress: self.storage.all_progress(id)?,
                from_cache: false,
            }),
            Identity::Remote { id } if self.connectivity.is_online() => {
                match self.migration.sync_remote_to_local(id).await {
                    Ok(fresh) => Ok(LoadedData {
                        sprints: fresh.sprints,
                        user_progress: fresh.user_progress,
                        from_cache: false,
                    }),
                    Err(e) => {
                        tracing::warn!(user_id = %id, error = %e, "Live fetch failed, serving cache");
                        self.cache.mark_stale(id)?;
                        self.load_cached(id)
                    }
                }
            }
            Identity::Remote { id } => self.load_cached(id),
        }
    }

    fn load_cached(&self, user_id: &str) -> Result<LoadedData> {
        let cached = self.cache.get_cached_user(user_id)?;
        Ok(LoadedData {
            sprints: cached.as_ref().map(|c| c.sprints.clone()).unwrap_or_default(),
            user_progress: cached.map(|c| c.user_progress).unwrap_or_default(),
            from_cache: true,
        })
    }

    /// Drain the queue after connectivity returns, then refresh the cache
    pub async fn handle_reconnect(&self, user_id: &str) -> Result<DrainReport> {
        if !self.connectivity.is_online() {
            return Ok(DrainReport::default());
        }

        let report = self.migration.sync_local_to_remote(user_id).await?;
        if report.replayed > 0
            && let Err(e) = self.migration.sync_remote_to_local(user_id).await
        {
            tracing::warn!(user_id = %user_id, error = %e, "Cache refresh after reconnect failed");
        }
        Ok(report)
    }
}

fn empty_cache(user_id: &str) -> CachedUserData {
    CachedUserData {
        user_id: user_id.to_string(),
        sprints: Vec::new(),
        user_progress: Vec::new(),
        user: None,
        last_sync_at: String::new(),
        is_stale: true,
        resumable: false,
    }
}

/// Fold task status and journal changes into `records`, recomputing stats
/// for sprints found in `sprints`
fn apply_progress_changes(
    sprints: &[Sprint],
    records: &mut Vec<UserProgress>,
    user_id: &str,
    update: &UserDataUpdate,
) {
    let today = Utc::now().date_naive();
    for change in update.task_statuses.iter().flatten() {
        let progress = progress_entry(records, user_id, &change.sprint_id);
        stats::upsert_task_status(&mut progress.task_statuses, change.task_status.clone());
        progress.updated_at = now();
        if let Some(sprint) = sprints.iter().find(|s| s.id == change.sprint_id) {
            stats::recompute(sprint, progress, today);
        }
    }
    for change in update.journal_entries.iter().flatten() {
        let progress = progress_entry(records, user_id, &change.sprint_id);
        let mut entry = change.entry.clone();
        entry.user_id = user_id.to_string();
        stats::upsert_journal_entry(&mut progress.journal_entries, entry);
        progress.updated_at = now();
    }
}

fn upsert_by<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}
