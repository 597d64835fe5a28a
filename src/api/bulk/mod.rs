mod handlers;

use axum::{routing::get, routing::post, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:exam_id/submissions/bulk", post(handlers::create_bulk_upload))
        .route("/:exam_id/submissions/bulk/:bulk_upload_id", get(handlers::get_bulk_upload))
        .route(
            "/:exam_id/submissions/bulk/:bulk_upload_id/finalize",
            post(handlers::finalize_bulk_upload),
        )
}
