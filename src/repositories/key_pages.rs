use sqlx::PgPool;

use crate::db::models::ExamKeyPage;

pub(crate) const COLUMNS: &str = "id, exam_id, page_number, image_key, width, height, created_at";

pub(crate) async fn list_by_exam(
    pool: &PgPool,
    exam_id: &str,
) -> Result<Vec<ExamKeyPage>, sqlx::Error> {
    sqlx::query_as::<_, ExamKeyPage>(&format!(
        "SELECT {COLUMNS}
         FROM exam_key_pages
         WHERE exam_id = $1
         ORDER BY page_number"
    ))
    .bind(exam_id)
    .fetch_all(pool)
    .await
}
