//! API routes
//!
//! A thin presentation surface over the state projector: every command
//! returns the resulting `ChatState` snapshot.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::core::ChatState;
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub content: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn state(State(app): State<AppState>) -> Json<ChatState> {
    Json(app.projector.snapshot())
}

/// Long-poll: resolves with the next snapshot after any state change.
async fn state_watch(State(app): State<AppState>) -> Json<ChatState> {
    let mut changes = app.projector.subscribe();
    let _ = changes.changed().await;
    let snapshot = changes.borrow().clone();
    Json(snapshot)
}

async fn send(State(app): State<AppState>, Json(request): Json<SendRequest>) -> Json<ChatState> {
    app.projector.send_message(&request.content).await;
    Json(app.projector.snapshot())
}

async fn create_conversation(State(app): State<AppState>) -> Json<ChatState> {
    app.projector.create_conversation().await;
    Json(app.projector.snapshot())
}

async fn select_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Json<ChatState> {
    app.projector.select_conversation(&id).await;
    Json(app.projector.snapshot())
}

async fn delete_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Json<ChatState> {
    app.projector.delete_conversation(&id).await;
    Json(app.projector.snapshot())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/state", get(state))
        .route("/v1/state/watch", get(state_watch))
        .route("/v1/chat", post(send))
        .route("/v1/conversations", post(create_conversation))
        .route("/v1/conversations/:id/select", post(select_conversation))
        .route("/v1/conversations/:id", delete(delete_conversation))
}
