use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::bulk_uploads::BulkUploadError;
use crate::services::key_parse::{KeyParseFailure, StoreError};

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, Json(ErrorResponse { status: status.as_u16(), detail: message }))
                    .into_response()
            }
        }
    }
}

impl From<BulkUploadError> for ApiError {
    fn from(err: BulkUploadError) -> Self {
        match err {
            BulkUploadError::NotFound(message) => Self::NotFound(message),
            BulkUploadError::BadRequest(message) => Self::BadRequest(message),
            BulkUploadError::Store(err) => Self::internal(err, "Bulk upload storage failed"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err, "Exam storage failed")
    }
}

impl IntoResponse for KeyParseFailure {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;

    use super::ApiError;
    use crate::services::bulk_uploads::BulkUploadError;
    use crate::test_support;

    #[tokio::test]
    async fn bulk_errors_keep_their_status() {
        let response =
            ApiError::from(BulkUploadError::NotFound("Bulk upload not found".to_string()))
                .into_response();
        assert_eq!(response.status().as_u16(), 404);
        let json = test_support::read_json(response).await;
        assert_eq!(json["status"], 404);
        assert_eq!(json["detail"], "Bulk upload not found");

        let response =
            ApiError::from(BulkUploadError::BadRequest("Invalid page range for Ann".to_string()))
                .into_response();
        assert_eq!(response.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn store_errors_hide_their_cause() {
        let err = crate::services::key_parse::StoreError::Storage("bucket exploded".to_string());
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status().as_u16(), 500);
        let json = test_support::read_json(response).await;
        assert_eq!(json["detail"], "Exam storage failed");
    }
}
