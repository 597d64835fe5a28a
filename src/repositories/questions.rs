use sqlx::types::Json;
use time::PrimitiveDateTime;

use crate::db::models::QuestionRubric;
use crate::db::types::EvidenceKind;

pub(crate) struct NewEvidence<'a> {
    pub(crate) id: &'a str,
    pub(crate) question_id: &'a str,
    pub(crate) exam_id: &'a str,
    pub(crate) page_number: i32,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) w: f64,
    pub(crate) h: f64,
    pub(crate) kind: EvidenceKind,
    pub(crate) confidence: f64,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Inserts the question or overwrites max marks and rubric of the existing
/// row with the same `(exam_id, label)`. Returns the question id.
pub(crate) async fn upsert_by_label(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    exam_id: &str,
    label: &str,
    max_marks: i32,
    rubric: &QuestionRubric,
    now: PrimitiveDateTime,
) -> Result<String, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO questions (id, exam_id, label, max_marks, rubric_json, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $6)
         ON CONFLICT (exam_id, label) DO UPDATE
         SET max_marks = EXCLUDED.max_marks,
             rubric_json = EXCLUDED.rubric_json,
             updated_at = EXCLUDED.updated_at
         RETURNING id",
    )
    .bind(id)
    .bind(exam_id)
    .bind(label)
    .bind(max_marks)
    .bind(Json(rubric))
    .bind(now)
    .fetch_one(executor)
    .await
}

pub(crate) async fn delete_evidence(
    executor: impl sqlx::PgExecutor<'_>,
    question_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM question_parse_evidence WHERE question_id = $1")
        .bind(question_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn insert_evidence(
    executor: impl sqlx::PgExecutor<'_>,
    evidence: NewEvidence<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO question_parse_evidence (
            id, question_id, exam_id, page_number, x, y, w, h, evidence_kind, confidence, created_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(evidence.id)
    .bind(evidence.question_id)
    .bind(evidence.exam_id)
    .bind(evidence.page_number)
    .bind(evidence.x)
    .bind(evidence.y)
    .bind(evidence.w)
    .bind(evidence.h)
    .bind(evidence.kind)
    .bind(evidence.confidence)
    .bind(evidence.created_at)
    .execute(executor)
    .await?;
    Ok(())
}
