use axum::extract::{Path, State};
use axum::Json;
use queue::{TaskId, TaskRecord};

use super::AppState;
use crate::ApiError;

/// GET /api/v1/tasks/:id
pub async fn get(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TaskRecord>, ApiError> {
    let record = state.tracker.status(&TaskId::new(id)).await?;
    Ok(Json(record))
}
