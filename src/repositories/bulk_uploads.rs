use sqlx::types::Json;
use time::PrimitiveDateTime;

use crate::db::models::{BulkUpload, BulkUploadPage, NameEvidence};

pub(crate) const COLUMNS: &str = "id, exam_id, original_filename, stored_path, created_at";

pub(crate) const PAGE_COLUMNS: &str = "\
    id, bulk_upload_id, page_number, image_key, width, height, \
    detected_student_name, detection_confidence, detection_evidence, created_at";

pub(crate) struct NewBulkPage<'a> {
    pub(crate) id: &'a str,
    pub(crate) bulk_upload_id: &'a str,
    pub(crate) page_number: i32,
    pub(crate) image_key: &'a str,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) detected_student_name: Option<&'a str>,
    pub(crate) detection_confidence: f64,
    pub(crate) detection_evidence: Option<NameEvidence>,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    exam_id: &str,
    original_filename: &str,
    stored_path: &str,
    created_at: PrimitiveDateTime,
) -> Result<BulkUpload, sqlx::Error> {
    sqlx::query_as::<_, BulkUpload>(&format!(
        "INSERT INTO bulk_uploads (id, exam_id, original_filename, stored_path, created_at)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {COLUMNS}"
    ))
    .bind(id)
    .bind(exam_id)
    .bind(original_filename)
    .bind(stored_path)
    .bind(created_at)
    .fetch_one(executor)
    .await
}

pub(crate) async fn insert_page(
    executor: impl sqlx::PgExecutor<'_>,
    page: NewBulkPage<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO bulk_upload_pages (
            id, bulk_upload_id, page_number, image_key, width, height,
            detected_student_name, detection_confidence, detection_evidence, created_at
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(page.id)
    .bind(page.bulk_upload_id)
    .bind(page.page_number)
    .bind(page.image_key)
    .bind(page.width)
    .bind(page.height)
    .bind(page.detected_student_name)
    .bind(page.detection_confidence)
    .bind(page.detection_evidence.map(Json))
    .bind(page.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn find_for_exam(
    executor: impl sqlx::PgExecutor<'_>,
    exam_id: &str,
    bulk_upload_id: &str,
) -> Result<Option<BulkUpload>, sqlx::Error> {
    sqlx::query_as::<_, BulkUpload>(&format!(
        "SELECT {COLUMNS} FROM bulk_uploads WHERE id = $1 AND exam_id = $2"
    ))
    .bind(bulk_upload_id)
    .bind(exam_id)
    .fetch_optional(executor)
    .await
}

pub(crate) async fn list_pages(
    executor: impl sqlx::PgExecutor<'_>,
    bulk_upload_id: &str,
) -> Result<Vec<BulkUploadPage>, sqlx::Error> {
    sqlx::query_as::<_, BulkUploadPage>(&format!(
        "SELECT {PAGE_COLUMNS}
         FROM bulk_upload_pages
         WHERE bulk_upload_id = $1
         ORDER BY page_number"
    ))
    .bind(bulk_upload_id)
    .fetch_all(executor)
    .await
}
