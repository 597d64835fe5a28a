use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::core::time::primitive_now_utc;
use crate::db::models::{EvidenceRegion, Exam, ExamKeyPage, ExamKeyParseRun, QuestionRubric};
use crate::db::types::{EvidenceKind, ExamStatus, ParseRunStatus};
use crate::repositories;
use crate::services::inference::PageImage;
use crate::services::storage::{image_mime_type, StorageService};

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

/// One question ready to be upserted by label, with its normalized evidence.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QuestionDraft {
    pub(crate) label: String,
    pub(crate) max_marks: i32,
    pub(crate) rubric: QuestionRubric,
}

impl QuestionDraft {
    /// Evidence rows to persist; kinds outside the known set stay in the rubric only.
    pub(crate) fn persisted_evidence(&self) -> impl Iterator<Item = (&EvidenceRegion, EvidenceKind)> {
        self.rubric
            .evidence
            .iter()
            .filter_map(|region| EvidenceKind::parse(&region.kind).map(|kind| (region, kind)))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunCompletion {
    pub(crate) status: ParseRunStatus,
    pub(crate) model_used: String,
    pub(crate) error: Option<Value>,
    pub(crate) timings: Value,
    pub(crate) usage: Value,
}

#[async_trait]
pub(crate) trait ExamKeyStore: Send + Sync {
    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError>;

    async fn list_key_pages(&self, exam_id: &str) -> Result<Vec<ExamKeyPage>, StoreError>;

    async fn load_key_page_image(&self, page: &ExamKeyPage) -> Result<PageImage, StoreError>;

    async fn set_exam_status(&self, exam_id: &str, status: ExamStatus) -> Result<(), StoreError>;

    async fn start_run(&self, run_id: &str, exam_id: &str, request_id: &str)
        -> Result<(), StoreError>;

    async fn finish_run(&self, run_id: &str, completion: RunCompletion) -> Result<(), StoreError>;

    /// Upserts every draft, replaces its evidence and sets the exam status,
    /// all or nothing.
    async fn save_parsed_questions(
        &self,
        exam_id: &str,
        drafts: &[QuestionDraft],
        status: ExamStatus,
    ) -> Result<(), StoreError>;

    async fn count_questions(&self, exam_id: &str) -> Result<i64, StoreError>;

    async fn list_runs(&self, exam_id: &str) -> Result<Vec<ExamKeyParseRun>, StoreError>;
}

#[derive(Debug, Clone)]
pub(crate) struct PgExamKeyStore {
    pool: PgPool,
    storage: Option<StorageService>,
}

impl PgExamKeyStore {
    pub(crate) fn new(pool: PgPool, storage: Option<StorageService>) -> Self {
        Self { pool, storage }
    }
}

#[async_trait]
impl ExamKeyStore for PgExamKeyStore {
    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError> {
        Ok(repositories::exams::find_by_id(&self.pool, exam_id).await?)
    }

    async fn list_key_pages(&self, exam_id: &str) -> Result<Vec<ExamKeyPage>, StoreError> {
        Ok(repositories::key_pages::list_by_exam(&self.pool, exam_id).await?)
    }

    async fn load_key_page_image(&self, page: &ExamKeyPage) -> Result<PageImage, StoreError> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| StoreError::Storage("S3 storage is not configured".to_string()))?;
        let bytes = storage
            .download_bytes(&page.image_key)
            .await
            .map_err(|err| StoreError::Storage(format!("{err:#}")))?;

        Ok(PageImage {
            page_number: page.page_number,
            mime_type: image_mime_type(&page.image_key).to_string(),
            bytes,
        })
    }

    async fn set_exam_status(&self, exam_id: &str, status: ExamStatus) -> Result<(), StoreError> {
        repositories::exams::update_status(&self.pool, exam_id, status, primitive_now_utc())
            .await?;
        Ok(())
    }

    async fn start_run(
        &self,
        run_id: &str,
        exam_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        repositories::parse_runs::insert_running(
            &self.pool,
            run_id,
            exam_id,
            request_id,
            primitive_now_utc(),
        )
        .await?;
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, completion: RunCompletion) -> Result<(), StoreError> {
        repositories::parse_runs::finish(
            &self.pool,
            repositories::parse_runs::FinishRun {
                id: run_id,
                status: completion.status,
                model_used: &completion.model_used,
                finished_at: primitive_now_utc(),
                error: completion.error,
                timings: completion.timings,
                usage: completion.usage,
            },
        )
        .await?;
        Ok(())
    }

    async fn save_parsed_questions(
        &self,
        exam_id: &str,
        drafts: &[QuestionDraft],
        status: ExamStatus,
    ) -> Result<(), StoreError> {
        let now = primitive_now_utc();
        let mut tx = self.pool.begin().await?;

        for draft in drafts {
            let question_id = repositories::questions::upsert_by_label(
                &mut *tx,
                &Uuid::new_v4().to_string(),
                exam_id,
                &draft.label,
                draft.max_marks,
                &draft.rubric,
                now,
            )
            .await?;

            repositories::questions::delete_evidence(&mut *tx, &question_id).await?;

            for (region, kind) in draft.persisted_evidence() {
                repositories::questions::insert_evidence(
                    &mut *tx,
                    repositories::questions::NewEvidence {
                        id: &Uuid::new_v4().to_string(),
                        question_id: &question_id,
                        exam_id,
                        page_number: region.page_number,
                        x: region.x,
                        y: region.y,
                        w: region.w,
                        h: region.h,
                        kind,
                        confidence: region.confidence,
                        created_at: now,
                    },
                )
                .await?;
            }
        }

        repositories::exams::update_status(&mut *tx, exam_id, status, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn count_questions(&self, exam_id: &str) -> Result<i64, StoreError> {
        Ok(repositories::exams::count_questions(&self.pool, exam_id).await?)
    }

    async fn list_runs(&self, exam_id: &str) -> Result<Vec<ExamKeyParseRun>, StoreError> {
        Ok(repositories::parse_runs::list_by_exam(&self.pool, exam_id).await?)
    }
}
