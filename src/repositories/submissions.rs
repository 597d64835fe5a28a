use time::PrimitiveDateTime;

use crate::db::models::Submission;
use crate::db::types::SubmissionStatus;

pub(crate) const COLUMNS: &str =
    "id, exam_id, bulk_upload_id, student_name, status, created_at";

pub(crate) async fn insert_from_bulk(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    exam_id: &str,
    bulk_upload_id: &str,
    student_name: &str,
    created_at: PrimitiveDateTime,
) -> Result<Submission, sqlx::Error> {
    sqlx::query_as::<_, Submission>(&format!(
        "INSERT INTO submissions (id, exam_id, bulk_upload_id, student_name, status, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(exam_id)
    .bind(bulk_upload_id)
    .bind(student_name)
    .bind(SubmissionStatus::PagesReady)
    .bind(created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn insert_page(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    submission_id: &str,
    page_number: i32,
    image_key: &str,
    width: i32,
    height: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO submission_pages (id, submission_id, page_number, image_key, width, height)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(submission_id)
    .bind(page_number)
    .bind(image_key)
    .bind(width)
    .bind(height)
    .execute(executor)
    .await?;
    Ok(())
}
