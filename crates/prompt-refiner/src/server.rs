//! HTTP surface: start a refinement session as an SSE stream, and save a
//! prompt to the library.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::app::Services;
use crate::refine::RefinementController;
use crate::storage::{save_to_library, PromptLibrary, SaveOutcome, SaveRequest};

pub struct AppState {
    pub controller: Arc<RefinementController>,
    pub library: Arc<dyn PromptLibrary>,
}

impl From<Services> for AppState {
    fn from(services: Services) -> Self {
        Self {
            controller: services.controller,
            library: services.library,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub prompt: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/optimize", post(optimize))
        .route("/api/save_prompt", post(save_prompt))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Dropping the response stream drops the session's receiver, which the
/// controller treats as cancellation.
async fn optimize(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OptimizeRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = state.controller.start(body.prompt);
    info!(session = %session.session_id, "Optimize session opened");

    let stream = session
        .events
        .into_stream()
        .map(|event| Ok(Event::default().data(event.to_sse_data())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn save_prompt(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveRequest>,
) -> Json<SaveOutcome> {
    Json(save_to_library(state.library.as_ref(), request).await)
}

pub async fn start_server(bind_addr: &str, services: Services) -> Result<()> {
    let app = build_router(Arc::new(AppState::from(services)));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "prompt-refiner listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{GenerationRequest, TextGenerator};
    use crate::refine::{RefineError, RefinementSettings};
    use crate::retrieval::NoRetrieval;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct QuickApproval;

    #[async_trait]
    impl TextGenerator for QuickApproval {
        fn name(&self) -> &str {
            "quick"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String, RefineError> {
            if request.system.contains("is_complete") {
                Ok(r#"{"critique":"done","is_complete":true}"#.into())
            } else {
                Ok("better prompt".into())
            }
        }
    }

    fn test_router() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = Arc::new(RefinementController::new(
            Arc::new(QuickApproval),
            Arc::new(NoRetrieval),
            store.clone(),
            RefinementSettings::default(),
        ));
        let state = Arc::new(AppState {
            controller,
            library: store.clone(),
        });
        (build_router(state), store)
    }

    fn json_post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_optimize_streams_full_session() {
        let (app, _) = test_router();
        let resp = app
            .oneshot(json_post("/api/optimize", r#"{"prompt":"write a cover letter"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let data: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();

        assert!(data[0].contains(r#""status":"init""#));
        assert_eq!(data.iter().filter(|d| d.contains(r#""status":"end""#)).count(), 3);
        assert!(data.iter().any(|d| d.contains(r#""token":"better prompt""#)));
        assert_eq!(*data.last().unwrap(), "[DONE]");
    }

    #[tokio::test]
    async fn test_optimize_rejects_missing_prompt() {
        let (app, _) = test_router();
        let resp = app
            .oneshot(json_post("/api/optimize", r#"{"text":"wrong field"}"#))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_save_prompt_empty_content() {
        let (app, store) = test_router();
        let resp = app
            .oneshot(json_post("/api/save_prompt", r#"{"title":"x","content":""}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let outcome: SaveOutcome = serde_json::from_slice(&body).unwrap();
        assert!(!outcome.success);
        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn test_save_prompt_persists_entry() {
        let (app, store) = test_router();
        let resp = app
            .oneshot(json_post(
                "/api/save_prompt",
                r#"{"content":"You are a recruiter...","session_id":"ab12cd34"}"#,
            ))
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let outcome: SaveOutcome = serde_json::from_slice(&body).unwrap();
        assert!(outcome.success);

        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id.as_deref(), Some("ab12cd34"));
        assert_eq!(entries[0].tags, "ai-refined");
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let (app, _) = test_router();
        let req = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }
}
