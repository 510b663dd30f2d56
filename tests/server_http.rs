//! End-to-end: the document store API driven through the HTTP client

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use elevatr_sync::Error;
use elevatr_sync::api::{AppState, create_router};
use elevatr_sync::config::{Config, TokenConfig, hash_token};
use elevatr_sync::models::{CoreTask, Day, NewSprint, SprintStatus, TaskKey, TaskStatus};
use elevatr_sync::remote::{
    DocumentRemoteStore, DocumentStore, HttpDocumentStore, RemoteStore, SqliteDocumentStore,
    collections,
};

const TOKEN: &str = "els_integration";

async fn spawn_server() -> String {
    let mut config = Config::default();
    config.tokens.push(TokenConfig {
        name: "tests".into(),
        token_hash: hash_token(TOKEN).unwrap(),
    });
    let state = AppState::new(SqliteDocumentStore::in_memory().unwrap(), config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str, token: &str) -> HttpDocumentStore {
    HttpDocumentStore::new(base, token, Duration::from_secs(5)).unwrap()
}

fn new_sprint() -> NewSprint {
    NewSprint {
        title: "Interview prep".into(),
        description: String::new(),
        duration: 30,
        start_date: "2026-06-01".into(),
        end_date: "2026-06-30".into(),
        status: SprintStatus::Active,
        days: vec![Day {
            day: "Day 1".into(),
            date: "2026-06-01".into(),
            core_tasks: vec![CoreTask {
                category: "dsa".into(),
                description: "Arrays".into(),
            }],
            special_tasks: vec!["Read a postmortem".into()],
        }],
    }
}

#[tokio::test]
async fn health_needs_no_token() {
    let base = spawn_server().await;
    let body: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn documents_round_trip_over_http() {
    let base = spawn_server().await;
    let docs = client(&base, TOKEN);

    assert!(docs.get(collections::USERS, "u1").await.unwrap().is_none());
    docs.put(collections::USERS, "u1", json!({"id": "u1", "displayName": "Ada"}))
        .await
        .unwrap();
    docs.merge(collections::USERS, "u1", json!({"displayName": "Ada L."}))
        .await
        .unwrap();
    assert_eq!(
        docs.get(collections::USERS, "u1").await.unwrap().unwrap()["displayName"],
        "Ada L."
    );

    let err = docs
        .merge(collections::USERS, "missing", json!({"x": 1}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    docs.delete(collections::USERS, "u1").await.unwrap();
    assert!(docs.get(collections::USERS, "u1").await.unwrap().is_none());
}

#[tokio::test]
async fn reserved_characters_in_ids_stay_in_one_segment() {
    let base = spawn_server().await;
    let docs = client(&base, TOKEN);
    let id = "team/alpha?draft#2";

    docs.put(collections::SPRINTS, id, json!({"id": id, "userId": "u1"}))
        .await
        .unwrap();

    assert_eq!(docs.get(collections::SPRINTS, id).await.unwrap().unwrap()["id"], id);
    assert!(docs.get(collections::SPRINTS, "team").await.unwrap().is_none());
    docs.delete(collections::SPRINTS, id).await.unwrap();
    assert!(docs.get(collections::SPRINTS, id).await.unwrap().is_none());
}

#[tokio::test]
async fn remote_adapter_works_against_the_server() {
    let base = spawn_server().await;
    let remote = DocumentRemoteStore::new(Arc::new(client(&base, TOKEN)));

    let sprint_id = remote.create_sprint("uid-1", new_sprint()).await.unwrap();
    remote
        .update_task_status(
            "uid-1",
            &sprint_id,
            TaskStatus::new(TaskKey::parse("day-1-core-0").unwrap(), true),
        )
        .await
        .unwrap();

    let sprints = remote.get_sprints_by_user("uid-1").await.unwrap();
    assert_eq!(sprints.len(), 1);
    let progress = remote.get_user_progress("uid-1", &sprint_id).await.unwrap().unwrap();
    assert_eq!(progress.stats.total_tasks_completed, 1);
    assert_eq!(progress.stats.completion_percentage, 50);
    assert_eq!(progress.stats.total_days_completed, 0);
}

#[tokio::test]
async fn wrong_token_is_unavailable() {
    let base = spawn_server().await;
    let docs = client(&base, "els_wrong");

    let err = docs.get(collections::SPRINTS, "s1").await.unwrap_err();
    assert!(err.is_remote_unavailable());
}

#[tokio::test]
async fn unknown_collection_is_rejected() {
    let base = spawn_server().await;
    let response = reqwest::Client::new()
        .get(format!("{base}/api/v1/collections/secrets/x"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("secrets"));
}
