use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::key_parse::ParseRunResponse;
use crate::services::key_review::{complete_key_review, KeyReviewCompletion};

pub(in crate::api::exams) async fn parse_answer_key(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    match state.key_parse().parse_exam(&exam_id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(failure) => failure.into_response(),
    }
}

/// Newest run first.
pub(in crate::api::exams) async fn list_parse_runs(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ParseRunResponse>>, ApiError> {
    if state.key_store().find_exam(&exam_id).await?.is_none() {
        return Err(ApiError::NotFound("Exam not found".to_string()));
    }

    let runs = state.key_store().list_runs(&exam_id).await?;
    Ok(Json(runs.into_iter().map(ParseRunResponse::from).collect()))
}

pub(in crate::api::exams) async fn complete_review(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<KeyReviewCompletion>, ApiError> {
    complete_key_review(state.key_store(), &exam_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Exam not found".to_string()))
}
