//! Route handlers and the router that mounts them.

pub mod health;
pub mod requests;
pub mod tasks;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use engine::WorkflowExecutor;
use queue::Tracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pipeline::RequestStep;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<WorkflowExecutor<RequestStep>>,
    pub tracker: Tracker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/requests", post(requests::create))
        .route("/api/v1/tasks/:id", get(tasks::get))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
