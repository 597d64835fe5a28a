use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::bulk::{BulkFinalizeRequest, BulkUploadRequest};
use crate::services::bulk_uploads::{BulkFinalizeOutcome, BulkPreview};

pub(in crate::api::bulk) async fn create_bulk_upload(
    Path(exam_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<BulkUploadRequest>,
) -> Result<(StatusCode, Json<BulkPreview>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let preview = state.bulk_uploads().create_preview(&exam_id, payload.into()).await?;
    Ok((StatusCode::CREATED, Json(preview)))
}

pub(in crate::api::bulk) async fn get_bulk_upload(
    Path((exam_id, bulk_upload_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<BulkPreview>, ApiError> {
    let preview = state.bulk_uploads().get_preview(&exam_id, &bulk_upload_id).await?;
    Ok(Json(preview))
}

pub(in crate::api::bulk) async fn finalize_bulk_upload(
    Path((exam_id, bulk_upload_id)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(payload): Json<BulkFinalizeRequest>,
) -> Result<Json<BulkFinalizeOutcome>, ApiError> {
    let outcome =
        state.bulk_uploads().finalize(&exam_id, &bulk_upload_id, &payload.candidates).await?;
    Ok(Json(outcome))
}
