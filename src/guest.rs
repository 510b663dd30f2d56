//! Guest identity service
//!
//! Owns the guest id marker (kept in local storage) and every read and write
//! of guest snapshots in the local cache. Incremental updates are whole-bundle
//! read-modify-write: two updates issued concurrently without awaiting each
//! other can lose one of them. Guest mode has a single actor, so this is an
//! accepted risk.

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;

use crate::error::Result;
use crate::local_storage::LocalStorage;
use crate::models::{GuestSnapshot, JournalEntry, Sprint, TaskStatus, UserProfile, UserProgress, now};
use crate::stats;
use crate::store::LocalCache;

pub const GUEST_ID_PREFIX: &str = "guest_";

/// Generate a `guest_<base36 millis>_<random>` id
pub fn generate_guest_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::rng();
    let random: String = (0..12)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();

    format!("{GUEST_ID_PREFIX}{}_{random}", to_base36(millis))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub fn is_guest_id(id: &str) -> bool {
    id.starts_with(GUEST_ID_PREFIX)
}

#[derive(Clone)]
pub struct GuestService {
    cache: Arc<LocalCache>,
    storage: Arc<LocalStorage>,
}

impl GuestService {
    pub fn new(cache: Arc<LocalCache>, storage: Arc<LocalStorage>) -> Self {
        Self { cache, storage }
    }

    /// The persisted guest id, created on first use
    pub fn get_or_create_guest_id(&self) -> Result<String> {
        if let Some(id) = self.current_guest_id()? {
            return Ok(id);
        }
        self.create_new_guest_session()
    }

    /// Persisted guest id, if one was ever created. A marker without the
    /// guest prefix is ignored.
    pub fn current_guest_id(&self) -> Result<Option<String>> {
        let Some(id) = self.storage.guest_id()? else {
            return Ok(None);
        };
        if !is_guest_id(&id) {
            tracing::warn!(marker = %id, "Ignoring malformed guest id marker");
            return Ok(None);
        }
        Ok(Some(id))
    }

    /// Replace the guest id unconditionally. The previous id's data is orphaned.
    pub fn create_new_guest_session(&self) -> Result<String> {
        let id = generate_guest_id();
        self.storage.set_guest_id(&id)?;
        tracing::info!(guest_id = %id, "Created guest session");
        Ok(id)
    }

    pub fn load_guest_snapshot(&self, id: &str) -> Result<Option<GuestSnapshot>> {
        self.cache.get_guest_snapshot(id)
    }

    /// Overwrite the full guest bundle
    pub fn save_guest_snapshot(
        &self,
        id: &str,
        sprints: Vec<Sprint>,
        user_progress: Vec<UserProgress>,
        user: UserProfile,
    ) -> Result<()> {
        let created_at = self
            .cache
            .get_guest_snapshot(id)?
            .map(|s| s.created_at)
            .unwrap_or_else(now);

        self.cache.put_guest_snapshot(&GuestSnapshot {
            id: id.to_string(),
            sprints,
            user_progress,
            user,
            created_at,
            updated_at: now(),
        })
    }

    /// True iff a snapshot exists with at least one sprint or progress record.
    /// Defaults to the persisted guest id.
    pub fn has_guest_data(&self, id: Option<&str>) -> Result<bool> {
        let id = match id {
            Some(id) => id.to_string(),
            None => match self.current_guest_id()? {
                Some(id) => id,
                None => return Ok(false),
            },
        };
        Ok(self
            .cache
            .get_guest_snapshot(&id)?
            .is_some_and(|s| s.has_content()))
    }

    pub fn delete_guest_snapshot(&self, id: &str) -> Result<bool> {
        self.cache.delete_guest_snapshot(id)
    }

    pub fn clear_all_guest_data(&self) -> Result<usize> {
        self.cache.clear_guest_snapshots()
    }

    fn modify<F>(&self, id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut GuestSnapshot),
    {
        let mut snapshot = self
            .cache
            .get_guest_snapshot(id)?
            .unwrap_or_else(|| GuestSnapshot::empty(id));
        apply(&mut snapshot);
        snapshot.updated_at = now();
        self.cache.put_guest_snapshot(&snapshot)
    }

    /// Insert or replace a sprint by id
    pub fn update_guest_sprint(&self, id: &str, sprint: Sprint) -> Result<()> {
        self.modify(id, |snapshot| {
            match snapshot.sprints.iter_mut().find(|s| s.id == sprint.id) {
                Some(existing) => *existing = sprint,
                None => snapshot.sprints.push(sprint),
            }
        })
    }

    /// Insert or replace a progress record by sprint id
    pub fn update_guest_progress(&self, id: &str, progress: UserProgress) -> Result<()> {
        self.modify(id, |snapshot| {
            match snapshot
                .user_progress
                .iter_mut()
                .find(|p| p.sprint_id == progress.sprint_id)
            {
                Some(existing) => *existing = progress,
                None => snapshot.user_progress.push(progress),
            }
        })
    }

    /// Upsert a task status and recompute the sprint's stats
    pub fn update_guest_task_status(&self, id: &str, sprint_id: &str, status: TaskStatus) -> Result<()> {
        self.modify(id, |snapshot| {
            let sprint = snapshot.sprints.iter().find(|s| s.id == sprint_id).cloned();
            let progress = progress_entry(&mut snapshot.user_progress, id, sprint_id);
            stats::upsert_task_status(&mut progress.task_statuses, status);
            progress.updated_at = now();
            if let Some(sprint) = &sprint {
                stats::recompute(sprint, progress, Utc::now().date_naive());
            }
        })
    }

    /// Upsert a journal entry by day
    pub fn update_guest_journal_entry(&self, id: &str, sprint_id: &str, entry: JournalEntry) -> Result<()> {
        self.modify(id, |snapshot| {
            let progress = progress_entry(&mut snapshot.user_progress, id, sprint_id);
            stats::upsert_journal_entry(&mut progress.journal_entries, entry);
            progress.updated_at = now();
        })
    }
}

/// The progress record for `sprint_id`, created empty when missing
pub(crate) fn progress_entry<'a>(
    records: &'a mut Vec<UserProgress>,
    user_id: &str,
    sprint_id: &str,
) -> &'a mut UserProgress {
    let idx = match records.iter().position(|p| p.sprint_id == sprint_id) {
        Some(idx) => idx,
        None => {
            records.push(UserProgress::empty(user_id, sprint_id));
            records.len() - 1
        }
    };
    &mut records[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoreTask, Day, SprintStatus, TaskKey};

    fn service() -> GuestService {
        GuestService::new(
            Arc::new(LocalCache::in_memory().unwrap()),
            Arc::new(LocalStorage::in_memory().unwrap()),
        )
    }

    fn sprint(id: &str, user_id: &str) -> Sprint {
        Sprint {
            id: id.into(),
            user_id: user_id.into(),
            title: "Backend".into(),
            description: String::new(),
            duration: 15,
            start_date: "2026-05-01".into(),
            end_date: "2026-05-15".into(),
            status: SprintStatus::Active,
            days: vec![Day {
                day: "Day 1".into(),
                date: "2026-05-01".into(),
                core_tasks: vec![CoreTask {
                    category: "reading".into(),
                    description: "Read the book".into(),
                }],
                special_tasks: vec!["Ship it".into()],
            }],
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn guest_id_is_idempotent() {
        let guests = service();
        let first = guests.get_or_create_guest_id().unwrap();
        let second = guests.get_or_create_guest_id().unwrap();

        assert_eq!(first, second);
        assert!(is_guest_id(&first));
    }

    #[test]
    fn malformed_marker_is_replaced() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let guests = GuestService::new(Arc::new(LocalCache::in_memory().unwrap()), storage.clone());
        storage.set_guest_id("local_123").unwrap();

        assert_eq!(guests.current_guest_id().unwrap(), None);
        let id = guests.get_or_create_guest_id().unwrap();
        assert!(is_guest_id(&id));
        assert_eq!(storage.guest_id().unwrap(), Some(id));
    }

    #[test]
    fn new_session_replaces_id() {
        let guests = service();
        let first = guests.get_or_create_guest_id().unwrap();
        let fresh = guests.create_new_guest_session().unwrap();

        assert_ne!(first, fresh);
        assert_eq!(guests.get_or_create_guest_id().unwrap(), fresh);
    }

    #[test]
    fn has_guest_data_requires_content() {
        let guests = service();
        let id = guests.get_or_create_guest_id().unwrap();
        assert!(!guests.has_guest_data(None).unwrap());

        guests
            .save_guest_snapshot(&id, vec![], vec![], UserProfile::guest(&id))
            .unwrap();
        assert!(!guests.has_guest_data(Some(&id)).unwrap());

        guests.update_guest_sprint(&id, sprint("s1", &id)).unwrap();
        assert!(guests.has_guest_data(Some(&id)).unwrap());
    }

    #[test]
    fn task_status_updates_upsert_and_recompute() {
        let guests = service();
        let id = guests.get_or_create_guest_id().unwrap();
        guests.update_guest_sprint(&id, sprint("s1", &id)).unwrap();

        let key = TaskKey::parse("day-1-core-0").unwrap();
        guests
            .update_guest_task_status(&id, "s1", TaskStatus::new(key, false))
            .unwrap();
        guests
            .update_guest_task_status(&id, "s1", TaskStatus::new(key, true))
            .unwrap();

        let snapshot = guests.load_guest_snapshot(&id).unwrap().unwrap();
        let progress = &snapshot.user_progress[0];
        assert_eq!(progress.task_statuses.len(), 1);
        assert!(progress.task_statuses[0].completed);
        assert_eq!(progress.stats.completion_percentage, 50);
    }

    #[test]
    fn journal_entries_upsert_by_day() {
        let guests = service();
        let id = guests.get_or_create_guest_id().unwrap();
        for content in ["draft", "final"] {
            guests
                .update_guest_journal_entry(
                    &id,
                    "s1",
                    JournalEntry {
                        day_id: "Day 1".into(),
                        content: content.into(),
                        updated_at: now(),
                        user_id: id.clone(),
                    },
                )
                .unwrap();
        }

        let snapshot = guests.load_guest_snapshot(&id).unwrap().unwrap();
        let entries = &snapshot.user_progress[0].journal_entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "final");
    }

    #[test]
    fn save_snapshot_overwrites_bundle() {
        let guests = service();
        let id = guests.get_or_create_guest_id().unwrap();
        guests.update_guest_sprint(&id, sprint("s1", &id)).unwrap();
        guests
            .save_guest_snapshot(&id, vec![sprint("s2", &id)], vec![], UserProfile::guest(&id))
            .unwrap();

        let snapshot = guests.load_guest_snapshot(&id).unwrap().unwrap();
        assert_eq!(snapshot.sprints.len(), 1);
        assert_eq!(snapshot.sprints[0].id, "s2");
    }
}
