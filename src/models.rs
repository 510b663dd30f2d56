//! Data models shared by every storage tier
//!
//! Uses String for IDs and timestamps for compatibility with the web client
//! and with documents already stored in the remote collections.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Current time as an RFC 3339 string
pub fn now() -> String {
    Utc::now().to_rfc3339()
}

/// The identity whose data is currently active
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// Locally generated, never authenticated
    Guest { id: String },
    /// Fully offline, possibly cached from a remote identity
    Local {
        id: String,
        #[serde(
            default,
            rename = "originalRemoteId",
            skip_serializing_if = "Option::is_none"
        )]
        original_remote_id: Option<String>,
    },
    /// Assigned by the external identity provider
    Remote { id: String },
}

impl Identity {
    pub fn guest(id: impl Into<String>) -> Self {
        Identity::Guest { id: id.into() }
    }

    pub fn remote(id: impl Into<String>) -> Self {
        Identity::Remote { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Identity::Guest { id } | Identity::Local { id, .. } | Identity::Remote { id } => id,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest { .. })
    }
}

/// Lifecycle status of a sprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprintStatus {
    #[default]
    Planned,
    Active,
    Completed,
    Paused,
}

/// A core task of a day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreTask {
    pub category: String,
    pub description: String,
}

/// One day of a sprint, addressed by its `day` label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Day {
    pub day: String,
    pub date: String,
    #[serde(default)]
    pub core_tasks: Vec<CoreTask>,
    #[serde(default)]
    pub special_tasks: Vec<String>,
}

impl Day {
    pub fn task_count(&self) -> usize {
        self.core_tasks.len() + self.special_tasks.len()
    }

    pub fn task_count_of(&self, task_type: TaskType) -> usize {
        match task_type {
            TaskType::Core => self.core_tasks.len(),
            TaskType::Special => self.special_tasks.len(),
        }
    }
}

/// Sprint lengths the planner supports
pub const SPRINT_DURATIONS: [u32; 2] = [15, 30];

/// A fixed-length plan of daily tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration: u32,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub status: SprintStatus,
    #[serde(default)]
    pub days: Vec<Day>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Sprint {
    /// Build a persisted sprint from creation input
    pub fn from_new(id: String, user_id: String, new: NewSprint, timestamp: &str) -> Self {
        Self {
            id,
            user_id,
            title: new.title,
            description: new.description,
            duration: new.duration,
            start_date: new.start_date,
            end_date: new.end_date,
            status: new.status,
            days: new.days,
            created_at: timestamp.to_string(),
            updated_at: timestamp.to_string(),
        }
    }

    /// Total number of core and special tasks across all days
    pub fn total_tasks(&self) -> usize {
        self.days.iter().map(Day::task_count).sum()
    }

    /// The day keyed by `label`, looked up by position first
    pub fn day(&self, label: &str) -> Option<&Day> {
        DayLabel::parse(label)
            .ok()
            .and_then(|parsed| self.days.get(parsed.index()))
            .filter(|d| d.day == label)
            .or_else(|| self.days.iter().find(|d| d.day == label))
    }
}

/// Input for creating a sprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSprint {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration: u32,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub status: SprintStatus,
    #[serde(default)]
    pub days: Vec<Day>,
}

impl NewSprint {
    pub fn validate(&self) -> Result<()> {
        if !SPRINT_DURATIONS.contains(&self.duration) {
            return Err(Error::Validation(format!(
                "sprint duration must be 15 or 30 days, got {}",
                self.duration
            )));
        }
        if self.title.trim().is_empty() {
            return Err(Error::Validation("sprint title is empty".into()));
        }
        for day in &self.days {
            DayLabel::parse(&day.day)?;
        }
        Ok(())
    }
}

/// Canonical day key, always rendered as `"Day N"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayLabel(u32);

impl DayLabel {
    pub fn new(number: u32) -> Result<Self> {
        if number == 0 {
            return Err(Error::Validation("day numbers start at 1".into()));
        }
        Ok(Self(number))
    }

    /// Parse a `"Day N"` label. Bare numbers are rejected.
    pub fn parse(label: &str) -> Result<Self> {
        let number = label
            .strip_prefix("Day ")
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::Validation(format!("invalid day label '{label}'")))?;
        Self::new(number)
    }

    pub fn number(self) -> u32 {
        self.0
    }

    /// Zero-based position in `Sprint::days`
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for DayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Day {}", self.0)
    }
}

impl FromStr for DayLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Which task list a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Core,
    Special,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Core => "core",
            TaskType::Special => "special",
        }
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "core" => Ok(TaskType::Core),
            "special" => Ok(TaskType::Special),
            other => Err(Error::Validation(format!("unknown task type '{other}'"))),
        }
    }
}

/// Composite task id of the form `day-<N>-<core|special>-<index>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub day: DayLabel,
    pub task_type: TaskType,
    pub task_index: usize,
}

impl TaskKey {
    pub fn parse(id: &str) -> Result<Self> {
        let parts: Vec<&str> = id.split('-').collect();
        let [prefix, day, task_type, index] = parts.as_slice() else {
            return Err(Error::Validation(format!(
                "task id '{id}' must have 4 dash-separated parts"
            )));
        };
        if *prefix != "day" {
            return Err(Error::Validation(format!("task id '{id}' must start with 'day'")));
        }
        let day = day
            .parse::<u32>()
            .map_err(|_| Error::Validation(format!("invalid day number in task id '{id}'")))
            .and_then(DayLabel::new)?;
        let task_index = index
            .parse::<usize>()
            .map_err(|_| Error::Validation(format!("invalid task index in task id '{id}'")))?;

        Ok(Self {
            day,
            task_type: task_type.parse()?,
            task_index,
        })
    }

    /// The day label used as the foreign key in progress records
    pub fn day_id(&self) -> String {
        self.day.to_string()
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "day-{}-{}-{}",
            self.day.number(),
            self.task_type.as_str(),
            self.task_index
        )
    }
}

/// Completion state of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub day_id: String,
    pub task_type: TaskType,
    pub task_index: usize,
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl TaskStatus {
    pub fn new(key: TaskKey, completed: bool) -> Self {
        let timestamp = now();
        Self {
            day_id: key.day_id(),
            task_type: key.task_type,
            task_index: key.task_index,
            completed,
            completed_at: completed.then(|| timestamp.clone()),
            updated_at: timestamp,
        }
    }

    /// Natural key equality: `(day_id, task_type, task_index)`
    pub fn same_key(&self, other: &TaskStatus) -> bool {
        self.day_id == other.day_id
            && self.task_type == other.task_type
            && self.task_index == other.task_index
    }

    pub fn key(&self) -> Result<TaskKey> {
        Ok(TaskKey {
            day: DayLabel::parse(&self.day_id)?,
            task_type: self.task_type,
            task_index: self.task_index,
        })
    }
}

/// A journal note attached to one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub day_id: String,
    pub content: String,
    #[serde(default)]
    pub updated_at: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Streaks {
    pub current_streak: u32,
    pub longest_streak: u32,
    #[serde(default)]
    pub last_active_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStats {
    pub total_tasks_completed: u32,
    pub total_days_completed: u32,
    pub completion_percentage: u32,
}

/// Per (identity, sprint) progress aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    pub user_id: String,
    pub sprint_id: String,
    #[serde(default)]
    pub task_statuses: Vec<TaskStatus>,
    #[serde(default)]
    pub journal_entries: Vec<JournalEntry>,
    #[serde(default)]
    pub streaks: Streaks,
    #[serde(default)]
    pub stats: ProgressStats,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl UserProgress {
    /// A fresh record with zeroed stats and streaks
    pub fn empty(user_id: &str, sprint_id: &str) -> Self {
        let timestamp = now();
        Self {
            user_id: user_id.to_string(),
            sprint_id: sprint_id.to_string(),
            task_statuses: Vec::new(),
            journal_entries: Vec::new(),
            streaks: Streaks::default(),
            stats: ProgressStats::default(),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        }
    }
}

/// Profile of the active user as exposed to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_login_at: String,
}

impl UserProfile {
    pub fn guest(id: &str) -> Self {
        let timestamp = now();
        Self {
            id: id.to_string(),
            email: None,
            display_name: Some("Guest".to_string()),
            photo_url: None,
            is_guest: true,
            created_at: timestamp.clone(),
            last_login_at: timestamp,
        }
    }
}

/// Kind of write deferred in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl FromStr for SyncOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(Error::Validation(format!("unknown sync operation '{other}'"))),
        }
    }
}

/// Entity a queued write targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Sprint,
    Progress,
    Task,
    Journal,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Sprint => "sprint",
            EntityType::Progress => "progress",
            EntityType::Task => "task",
            EntityType::Journal => "journal",
        }
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sprint" => Ok(EntityType::Sprint),
            "progress" => Ok(EntityType::Progress),
            "task" => Ok(EntityType::Task),
            "journal" => Ok(EntityType::Journal),
            other => Err(Error::Validation(format!("unknown entity type '{other}'"))),
        }
    }
}

/// A write deferred while the remote store was unreachable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: i64,
    pub user_id: String,
    pub operation: SyncOperation,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub timestamp: String,
    pub retry_count: u32,
    #[serde(default)]
    pub last_attempt: Option<String>,
}

/// Queue payload for task status writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusChange {
    pub sprint_id: String,
    pub task_status: TaskStatus,
}

/// Queue payload for journal writes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalChange {
    pub sprint_id: String,
    pub entry: JournalEntry,
}

/// Local mirror of a remote identity's data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedUserData {
    pub user_id: String,
    #[serde(default)]
    pub sprints: Vec<Sprint>,
    #[serde(default)]
    pub user_progress: Vec<UserProgress>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    pub last_sync_at: String,
    #[serde(default)]
    pub is_stale: bool,
    /// Written on logout-keep so a later sign-in can resume from it
    #[serde(default)]
    pub resumable: bool,
}

/// Full data bundle of a guest identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSnapshot {
    pub id: String,
    #[serde(default)]
    pub sprints: Vec<Sprint>,
    #[serde(default)]
    pub user_progress: Vec<UserProgress>,
    pub user: UserProfile,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl GuestSnapshot {
    pub fn empty(id: &str) -> Self {
        let timestamp = now();
        Self {
            id: id.to_string(),
            sprints: Vec::new(),
            user_progress: Vec::new(),
            user: UserProfile::guest(id),
            created_at: timestamp.clone(),
            updated_at: timestamp,
        }
    }

    /// At least one sprint or progress record
    pub fn has_content(&self) -> bool {
        !self.sprints.is_empty() || !self.user_progress.is_empty()
    }
}
