//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness and version |
//! | `POST` | `/api/chat` | Answer a message (`ChatRequest` → `ChatResponse`) |
//! | `POST` | `/api/query` | Retrieval only: ranked passages plus rendered context |
//! | `POST` | `/api/ingest` | Ingest the configured source folder |
//!
//! `/api/ingest` answers `202 Accepted` with `{"status": "in_progress"}`
//! when another ingest holds the collection lock.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! All origins, methods and headers are allowed (CORS).

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::{ChatRequest, ChatResponse};
use crate::ingest::IngestOutcome;
use crate::models::RetrievalResult;
use crate::pipeline::Pipeline;
use crate::retrieval::format_context;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Serve until the process is terminated. Binds to `[server].bind`.
pub async fn run_server(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let bind_addr = pipeline.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("Axiom server listening on http://{}", bind_addr);
    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/query", post(handle_query))
        .route("/api/ingest", post(handle_ingest))
        .layer(cors)
        .with_state(AppState { pipeline })
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

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /api/chat ============

async fn handle_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(request) = body?;
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    Ok(Json(state.pipeline.assistant.respond(request).await))
}

// ============ POST /api/query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    results: Vec<RetrievalResult>,
    context: String,
}

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, AppError> {
    let Json(request) = body?;
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let k = request.k.unwrap_or(state.pipeline.config.retrieval.k);
    if k == 0 {
        return Err(bad_request("k must be >= 1"));
    }
    let results = state
        .pipeline
        .retrieval
        .query(&request.query, k)
        .await
        .map_err(internal)?;
    let context = format_context(&results);
    Ok(Json(QueryResponse { results, context }))
}

// ============ POST /api/ingest ============

async fn handle_ingest(State(state): State<AppState>) -> Result<Response, AppError> {
    let ingestor = &state.pipeline.ingestor;
    let outcome = ingestor
        .ingest_folder(ingestor.default_folder())
        .await
        .map_err(internal)?;
    let status = match outcome {
        IngestOutcome::InProgress => StatusCode::ACCEPTED,
        IngestOutcome::Completed(_) => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::BackendError;
    use crate::llm::{ChatMessage, Generator};
    use crate::store::lock::IngestLock;
    use crate::store::testing::WordHashEmbedder;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    struct Parrot;

    #[async_trait]
    impl Generator for Parrot {
        async fn generate(&self, model: &str, _: &str, _: Option<&str>) -> Result<String, BackendError> {
            Ok(format!("{} answered", model))
        }
        async fn chat(&self, _: &str, messages: &[ChatMessage], _: &[Value]) -> Result<ChatMessage, BackendError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatMessage::assistant(format!("you said: {}", last)))
        }
    }

    async fn serve(tmp: &TempDir) -> (String, Arc<Pipeline>) {
        let source = tmp.path().join("docs");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("linear.txt"), "Eigenvalues of a symmetric matrix are real numbers.").unwrap();

        let mut config = Config::default();
        config.store.path = tmp.path().join("db");
        config.ingest.source_dir = source;
        config.retrieval.min_score = 0.05;
        let pipeline = Arc::new(
            Pipeline::build_with(&config, Arc::new(WordHashEmbedder { dims: 64 }), Arc::new(Parrot))
                .await
                .unwrap(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(pipeline.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), pipeline)
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let (base, _) = serve(&tmp).await;
        let body: Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ingest_then_query_then_chat() {
        let tmp = TempDir::new().unwrap();
        let (base, _) = serve(&tmp).await;
        let client = reqwest::Client::new();

        let ingest = client.post(format!("{}/api/ingest", base)).send().await.unwrap();
        assert_eq!(ingest.status(), 200);
        let report: Value = ingest.json().await.unwrap();
        assert_eq!(report["status"], "completed");
        assert_eq!(report["files_stored"], 1);

        let query: Value = client
            .post(format!("{}/api/query", base))
            .json(&json!({ "query": "eigenvalues of a symmetric matrix" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(query["results"][0]["metadata"]["source"], "linear.txt");
        assert!(query["context"].as_str().unwrap().contains("symmetric matrix"));

        let chat: Value = client
            .post(format!("{}/api/chat", base))
            .json(&json!({ "message": "tell me about symmetric matrices", "mode": "chat" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(chat["mode"], "chat");
        assert_eq!(chat["response"], "you said: tell me about symmetric matrices");
        assert_eq!(chat["sources"][0]["document"], "linear.txt");
    }

    #[tokio::test]
    async fn test_ingest_reports_in_progress_when_locked() {
        let tmp = TempDir::new().unwrap();
        let (base, pipeline) = serve(&tmp).await;
        let _held = IngestLock::try_acquire(&pipeline.config.store.path, &pipeline.config.store.collection)
            .unwrap()
            .unwrap();

        let response = reqwest::Client::new()
            .post(format!("{}/api/ingest", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body, json!({ "status": "in_progress" }));
    }

    #[tokio::test]
    async fn test_malformed_requests_use_error_contract() {
        let tmp = TempDir::new().unwrap();
        let (base, _) = serve(&tmp).await;
        let client = reqwest::Client::new();

        let empty = client
            .post(format!("{}/api/chat", base))
            .json(&json!({ "message": "  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 400);
        let body: Value = empty.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");

        let not_json = client
            .post(format!("{}/api/query", base))
            .header("content-type", "application/json")
            .body("{nope")
            .send()
            .await
            .unwrap();
        assert_eq!(not_json.status(), 400);
        let body: Value = not_json.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request");
    }
}
