//! `api` crate: the request pipeline and its HTTP surface.
//!
//! Exposes:
//!   GET    /health
//!   POST   /api/v1/requests
//!   GET    /api/v1/tasks/:id

pub mod error;
pub mod handlers;
pub mod jobs;
pub mod pipeline;
pub mod resources;

pub use error::ApiError;
pub use handlers::{router, AppState};
pub use pipeline::{request_graph, PipelineDeps, RequestStep};
pub use resources::{Answering, EchoResponder, Responder, ResourceSession};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the API on `bind` until `shutdown` is cancelled.
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind = %listener.local_addr()?, "API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
