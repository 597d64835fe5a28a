use sqlx::types::Json;
use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::ExamKeyParseRun;
use crate::db::types::ParseRunStatus;

pub(crate) const COLUMNS: &str = "\
    id, exam_id, request_id, model_used, status, started_at, finished_at, \
    error_json, timings_json, usage_json";

pub(crate) struct FinishRun<'a> {
    pub(crate) id: &'a str,
    pub(crate) status: ParseRunStatus,
    pub(crate) model_used: &'a str,
    pub(crate) finished_at: PrimitiveDateTime,
    pub(crate) error: Option<serde_json::Value>,
    pub(crate) timings: serde_json::Value,
    pub(crate) usage: serde_json::Value,
}

pub(crate) async fn insert_running(
    pool: &PgPool,
    id: &str,
    exam_id: &str,
    request_id: &str,
    started_at: PrimitiveDateTime,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO exam_key_parse_runs (id, exam_id, request_id, model_used, status, started_at)
         VALUES ($1, $2, $3, '', $4, $5)",
    )
    .bind(id)
    .bind(exam_id)
    .bind(request_id)
    .bind(ParseRunStatus::Running)
    .bind(started_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn finish(pool: &PgPool, params: FinishRun<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE exam_key_parse_runs
         SET status = $1,
             model_used = $2,
             finished_at = $3,
             error_json = $4,
             timings_json = $5,
             usage_json = $6
         WHERE id = $7",
    )
    .bind(params.status)
    .bind(params.model_used)
    .bind(params.finished_at)
    .bind(params.error.map(Json))
    .bind(Json(params.timings))
    .bind(Json(params.usage))
    .bind(params.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn list_by_exam(
    pool: &PgPool,
    exam_id: &str,
) -> Result<Vec<ExamKeyParseRun>, sqlx::Error> {
    sqlx::query_as::<_, ExamKeyParseRun>(&format!(
        "SELECT {COLUMNS}
         FROM exam_key_parse_runs
         WHERE exam_id = $1
         ORDER BY started_at DESC"
    ))
    .bind(exam_id)
    .fetch_all(pool)
    .await
}
