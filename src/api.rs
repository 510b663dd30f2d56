//! HTTP API for the self-hosted document store

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::remote::{Document, DocumentStore, Filter, OrderBy, Query, SqliteDocumentStore, collections};

/// Application state shared across handlers
pub struct AppState {
    pub docs: SqliteDocumentStore,
    pub config: Config,
}

impl AppState {
    pub fn new(docs: SqliteDocumentStore, config: Config) -> Arc<Self> {
        Arc::new(Self { docs, config })
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/collections/{collection}/query",
            post(query_documents),
        )
        .route(
            "/api/v1/collections/{collection}/{id}",
            get(get_document)
                .put(put_document)
                .patch(merge_document)
                .delete(delete_document),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "elevatr-sync",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - validates Bearer token
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return error_response(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header");
    };

    if !state.config.validate_token(token) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API token");
    }

    next.run(request).await
}

fn known_collection(collection: &str) -> Result<(), ApiError> {
    if collections::is_known(collection) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("unknown collection '{collection}'")))
    }
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    known_collection(&collection)?;
    state
        .docs
        .get(&collection, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::Store(Error::NotFound(format!("{collection}/{id}"))))
}

async fn put_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Json(doc): Json<Value>,
) -> Result<StatusCode, ApiError> {
    known_collection(&collection)?;
    state.docs.put(&collection, &id, doc).await?;
    tracing::debug!(collection = %collection, id = %id, "Document written");
    Ok(StatusCode::NO_CONTENT)
}

async fn merge_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<StatusCode, ApiError> {
    known_collection(&collection)?;
    if !patch.is_object() {
        return Err(ApiError::BadRequest("patch must be a JSON object".into()));
    }
    state.docs.merge(&collection, &id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    known_collection(&collection)?;
    state.docs.delete(&collection, &id).await?;
    tracing::debug!(collection = %collection, id = %id, "Document deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody {
    #[serde(default)]
    filters: Vec<Filter>,
    #[serde(default)]
    order_by: Option<OrderBy>,
}

async fn query_documents(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Json(body): Json<QueryBody>,
) -> Result<Json<Vec<Document>>, ApiError> {
    known_collection(&collection)?;
    let query = Query {
        collection,
        filters: body.filters,
        order_by: body.order_by,
    };
    let docs = state.docs.query(&query).await?;

    tracing::debug!(
        collection = %query.collection,
        filters = query.filters.len(),
        results = docs.len(),
        "Query served"
    );
    Ok(Json(docs))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Store(Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => error_response(StatusCode::BAD_REQUEST, &message),
            ApiError::Store(e @ Error::NotFound(_)) => {
                error_response(StatusCode::NOT_FOUND, &e.to_string())
            }
            ApiError::Store(e @ Error::Validation(_)) => {
                error_response(StatusCode::BAD_REQUEST, &e.to_string())
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "API error");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Store(err)
    }
}

/// Bind and serve the document store until the process stops
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    use anyhow::Context;

    let docs = SqliteDocumentStore::open(&config.database.path).context("Failed to open database")?;

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    if config.tokens.is_empty() {
        tracing::warn!("No API tokens configured, every API request will be rejected");
    }

    let app = create_router(AppState::new(docs, config));
    tracing::info!("🚀 elevatr-sync document store listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
