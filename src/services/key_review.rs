use serde::Serialize;

use crate::db::types::ExamStatus;
use crate::services::key_parse::{ExamKeyStore, StoreError};

pub(crate) const NO_QUESTIONS_READY_WARNING: &str =
    "No questions exist. Exam marked READY for manual setup.";

#[derive(Debug, Clone, Serialize)]
pub(crate) struct KeyReviewCompletion {
    pub(crate) exam_id: String,
    pub(crate) status: ExamStatus,
    pub(crate) warnings: Vec<String>,
}

/// Marks the exam `READY` whatever its question count. `None` when the exam
/// does not exist.
pub(crate) async fn complete_key_review(
    store: &dyn ExamKeyStore,
    exam_id: &str,
) -> Result<Option<KeyReviewCompletion>, StoreError> {
    if store.find_exam(exam_id).await?.is_none() {
        return Ok(None);
    }

    let mut warnings = Vec::new();
    if store.count_questions(exam_id).await? == 0 {
        warnings.push(NO_QUESTIONS_READY_WARNING.to_string());
    }

    store.set_exam_status(exam_id, ExamStatus::Ready).await?;
    tracing::info!(exam_id, warnings = warnings.len(), "Answer key review completed");

    Ok(Some(KeyReviewCompletion { exam_id: exam_id.to_string(), status: ExamStatus::Ready, warnings }))
}
