mod handlers;

use axum::{routing::get, routing::post, Router};

use crate::core::state::AppState;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/:exam_id/key/parse", post(handlers::parse_answer_key))
        .route("/:exam_id/key/parse-runs", get(handlers::list_parse_runs))
        .route("/:exam_id/key/review/complete", post(handlers::complete_review))
}
