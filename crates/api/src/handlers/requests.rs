use axum::extract::State;
use axum::Json;
use nodes::{ErrorInfo, State as Traversal};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::pipeline::{CONNECTION, QUESTION, RESPONSE};
use crate::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestDto {
    pub request_id: Option<String>,
    /// Resume and persist under this conversation thread.
    pub thread_id: Option<String>,
    pub question: String,
    pub connection: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_id: String,
    pub response: Option<String>,
    pub error: Option<ErrorInfo>,
    /// Final traversal State.
    pub state: Traversal,
}

/// POST /api/v1/requests
///
/// Runs the request pipeline to completion.  Pipeline failures are part of
/// the response body; only malformed requests are rejected.
pub async fn create(
    State(state): State<AppState>,
    Json(dto): Json<CreateRequestDto>,
) -> Result<Json<RequestResponse>, ApiError> {
    if !dto.connection.is_object() {
        return Err(ApiError::BadRequest("connection must be a JSON object".into()));
    }

    let request_id = dto.request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut initial = Traversal::new(&request_id);
    initial
        .set(QUESTION, dto.question)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    initial.insert_raw(CONNECTION.name(), dto.connection);

    info!(request_id = %request_id, thread_id = ?dto.thread_id, "request received");
    let final_state = state.executor.invoke(initial, dto.thread_id.as_deref()).await;

    Ok(Json(RequestResponse {
        request_id,
        response: final_state.get(RESPONSE),
        error: final_state.error().cloned(),
        state: final_state,
    }))
}
