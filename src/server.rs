//! HTTP endpoint exposing search to a tool host.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tools/search` | Semantic search over the collection |
//! | `GET`  | `/health` | Health check (returns version and collection) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown kind 'image'" } }
//! ```
//!
//! Error codes: `bad_request` (400), `search_unavailable` (503).
//!
//! An empty query is not an error; it returns `{"results": []}`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{SearchFilter, SearchResult, SourceKind};
use crate::search::RetrievalService;

#[derive(Clone)]
struct AppState {
    search: Arc<RetrievalService>,
}

/// Build the router around an existing retrieval service.
pub fn router(search: Arc<RetrievalService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { search })
}

/// Open the configured collection and serve until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let search = Arc::new(RetrievalService::open(config).await?);
    let app = router(search);

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(bind = %bind_addr, collection = %config.collection.name, "serving");
    println!("docsift listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn search_unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "search_unavailable",
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    collection: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        collection: state.search.collection().to_string(),
    })
}

// ============ POST /tools/search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: String,
    k: Option<usize>,
    kind: Option<String>,
    path_prefix: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let kind = req
        .kind
        .as_deref()
        .map(str::parse::<SourceKind>)
        .transpose()
        .map_err(bad_request)?;
    let filter = SearchFilter {
        kind,
        path_prefix: req.path_prefix,
    };
    let k = req.k.unwrap_or(state.search.default_k());

    let results = state
        .search
        .search(&req.query, k, &filter)
        .await
        .map_err(|e| {
            warn!(error = %e, "search failed");
            search_unavailable(e.to_string())
        })?;
    Ok(Json(SearchResponse { results }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::embedding::HashEmbedder;
    use crate::models::EmbeddingRecord;
    use crate::store::{testing, CollectionStore, InMemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app(seed: bool) -> Router {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(HashEmbedder::new("hash", 32));
        if seed {
            store.ensure_collection("documents", 32, "hash").await.unwrap();
            let text = "vector search over markdown notes";
            store
                .upsert(
                    "documents",
                    &[EmbeddingRecord::new(
                        testing::chunk("notes.md", 0, SourceKind::Document, text),
                        embedder.embed_text(text),
                    )],
                )
                .await
                .unwrap();
        }
        let service = RetrievalService::connect(
            store,
            embedder,
            "documents",
            &RetrievalConfig {
                default_k: 5,
                max_k: 20,
                timeout_secs: 2,
            },
        )
        .await
        .unwrap();
        router(Arc::new(service))
    }

    async fn post_json(app: Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tools/search")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn search_returns_ranked_results_with_provenance() {
        let (status, body) = post_json(
            app(true).await,
            serde_json::json!({"query": "markdown notes", "k": 3}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["source_path"], "notes.md");
        assert_eq!(results[0]["ordinal"], 0);
        assert_eq!(results[0]["kind"], "document");
    }

    #[tokio::test]
    async fn empty_collection_gives_empty_results() {
        let (status, body) =
            post_json(app(false).await, serde_json::json!({"query": "anything"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"results": []}));
    }

    #[tokio::test]
    async fn bad_kind_is_a_bad_request() {
        let (status, body) = post_json(
            app(true).await,
            serde_json::json!({"query": "notes", "kind": "image"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn health_reports_collection() {
        let resp = app(false)
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["collection"], "documents");
        assert_eq!(body["status"], "ok");
    }
}
