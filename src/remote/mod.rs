//! Remote tier: the cloud document store and the adapter over it
//!
//! [`DocumentStore`] is the opaque collection/document database (CRUD plus
//! equality-filter queries). [`RemoteStore`] is the domain-level adapter the
//! sync layer talks to; [`DocumentRemoteStore`] implements it on top of any
//! document store.

mod adapter;
mod http;
mod sqlite;

pub use adapter::DocumentRemoteStore;
pub use http::HttpDocumentStore;
pub use sqlite::SqliteDocumentStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::Result;
use crate::models::{JournalEntry, NewSprint, Sprint, TaskStatus, UserProfile, UserProgress};

/// Collection names of the remote document store
pub mod collections {
    pub const SPRINTS: &str = "sprints";
    pub const USER_PROGRESS: &str = "userProgress";
    pub const USERS: &str = "users";
    pub const TEMPLATES: &str = "templates";
    pub const JOURNAL_ENTRIES: &str = "journalEntries";

    pub const ALL: [&str; 5] = [SPRINTS, USER_PROGRESS, USERS, TEMPLATES, JOURNAL_ENTRIES];

    pub fn is_known(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// A stored document with its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// `field == value` filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// Query shape: collection, equality filters, optional sort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    /// True if every filter matches a top-level field of `doc`
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters
            .iter()
            .all(|f| doc.get(&f.field).is_some_and(|v| *v == f.value))
    }

    /// Filter and sort documents according to this query
    pub fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs.into_iter().filter(|d| self.matches(&d.data)).collect();
        if let Some(order) = &self.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.data.get(&order.field), b.data.get(&order.field));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }
        matched
    }
}

/// Missing values sort first; numbers numerically, everything else as strings
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Shallow field merge of `patch` into `doc`
pub fn merge_fields(doc: &mut Value, patch: &Value) {
    if let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Opaque cloud document database
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Create or overwrite a document
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Shallow field merge into an existing document; `NotFound` if absent
    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;
}

/// Domain operations against the remote tier
///
/// Every operation fails with `RemoteUnavailable` when the backend cannot be
/// reached and with `NotFound` when a record it requires is missing.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Persist a new sprint together with its empty progress record
    async fn create_sprint(&self, user_id: &str, sprint: NewSprint) -> Result<String>;

    /// Update the sprint if it exists, otherwise create it with its progress record
    async fn upsert_sprint(&self, sprint: &Sprint) -> Result<()>;

    async fn get_sprint(&self, sprint_id: &str) -> Result<Option<Sprint>>;

    /// Sprints owned by `user_id`, newest first
    async fn get_sprints_by_user(&self, user_id: &str) -> Result<Vec<Sprint>>;

    /// Merge-patch a sprint and re-stamp `updatedAt`
    async fn update_sprint(&self, sprint_id: &str, patch: Value) -> Result<()>;

    /// Delete a sprint and every progress record of `(user_id, sprint_id)`
    async fn delete_sprint(&self, sprint_id: &str, user_id: &str) -> Result<()>;

    async fn get_user_progress(&self, user_id: &str, sprint_id: &str) -> Result<Option<UserProgress>>;

    /// Query-then-upsert the whole progress document
    async fn save_user_progress(&self, progress: &UserProgress) -> Result<()>;

    /// Upsert a task status by natural key and recompute stats
    async fn update_task_status(&self, user_id: &str, sprint_id: &str, status: TaskStatus) -> Result<()>;

    /// Upsert a journal entry by day
    async fn update_journal_entry(&self, user_id: &str, sprint_id: &str, entry: JournalEntry) -> Result<()>;

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn create_user(&self, profile: &UserProfile) -> Result<()>;

    /// Patch `lastLoginAt` and the display fields of an existing profile
    async fn record_login(&self, profile: &UserProfile) -> Result<()>;
}
