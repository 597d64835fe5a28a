//! Bulk scan intake: per-page name detection, segmentation preview and
//! materialization of the accepted candidates as submissions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::db::models::{BulkUpload, BulkUploadPage, Exam, Submission};
use crate::repositories;
use crate::services::bulk_segmentation::{
    parse_roster, segment_bulk_candidates, validate_finalize_candidates, BulkCandidate,
    FinalizeCandidate, FinalizeError, PageDetection, SegmentationConfig,
};
use crate::services::inference::{BulkNameDetector, NameDetection, PageImage};
use crate::services::key_parse::StoreError;
use crate::services::storage::{image_mime_type, StorageService};

#[derive(Debug, Clone)]
pub(crate) struct BulkUploadConfig {
    pub(crate) nano_model: String,
    pub(crate) mini_model: String,
    pub(crate) detect_escalation_confidence: f64,
    pub(crate) name_match_threshold: f64,
    pub(crate) max_carry_forward_pages: usize,
    pub(crate) max_pages: usize,
}

impl BulkUploadConfig {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            nano_model: settings.key_parse().nano_model.clone(),
            mini_model: settings.key_parse().mini_model.clone(),
            detect_escalation_confidence: settings.bulk().detect_escalation_confidence,
            name_match_threshold: settings.bulk().name_match_threshold,
            max_carry_forward_pages: settings.bulk().max_carry_forward_pages,
            max_pages: settings.bulk().max_pages,
        }
    }

    fn segmentation(&self, min_pages_per_student: usize) -> SegmentationConfig {
        SegmentationConfig {
            name_match_threshold: self.name_match_threshold,
            max_carry_forward_pages: self.max_carry_forward_pages,
            min_pages_per_student: min_pages_per_student.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BulkPageInput {
    pub(crate) page_number: i32,
    pub(crate) image_key: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct NewBulkUpload {
    pub(crate) original_filename: String,
    pub(crate) stored_path: String,
    pub(crate) pages: Vec<BulkPageInput>,
    pub(crate) roster: Option<String>,
    pub(crate) min_pages_per_student: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BulkPreview {
    pub(crate) bulk_upload_id: String,
    pub(crate) page_count: usize,
    pub(crate) candidates: Vec<BulkCandidate>,
    pub(crate) warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct SubmissionPagePlan {
    pub(crate) page_number: i32,
    pub(crate) image_key: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
}

/// One accepted candidate, with its bulk pages renumbered from 1.
#[derive(Debug, Clone)]
pub(crate) struct SubmissionPlan {
    pub(crate) student_name: String,
    pub(crate) page_start: i32,
    pub(crate) page_end: i32,
    pub(crate) pages: Vec<SubmissionPagePlan>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FinalizedSubmission {
    pub(crate) id: String,
    pub(crate) student_name: String,
    pub(crate) page_start: i32,
    pub(crate) page_end: i32,
    pub(crate) page_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct BulkFinalizeOutcome {
    pub(crate) submissions: Vec<FinalizedSubmission>,
    pub(crate) warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub(crate) enum BulkUploadError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FinalizeError> for BulkUploadError {
    fn from(err: FinalizeError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

#[async_trait]
pub(crate) trait BulkUploadStore: Send + Sync {
    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError>;

    async fn load_page_image(&self, page: &BulkPageInput) -> Result<PageImage, StoreError>;

    /// Inserts the upload with all of its pages, all or nothing.
    async fn create_bulk_upload(
        &self,
        upload: &BulkUpload,
        pages: &[BulkUploadPage],
    ) -> Result<(), StoreError>;

    async fn find_bulk_upload(
        &self,
        exam_id: &str,
        bulk_upload_id: &str,
    ) -> Result<Option<BulkUpload>, StoreError>;

    async fn list_bulk_pages(&self, bulk_upload_id: &str) -> Result<Vec<BulkUploadPage>, StoreError>;

    /// Creates one submission per plan with its pages, all or nothing.
    async fn create_submissions(
        &self,
        upload: &BulkUpload,
        plans: &[SubmissionPlan],
    ) -> Result<Vec<Submission>, StoreError>;
}

#[derive(Debug, Clone)]
pub(crate) struct PgBulkUploadStore {
    pool: PgPool,
    storage: Option<StorageService>,
}

impl PgBulkUploadStore {
    pub(crate) fn new(pool: PgPool, storage: Option<StorageService>) -> Self {
        Self { pool, storage }
    }
}

#[async_trait]
impl BulkUploadStore for PgBulkUploadStore {
    async fn find_exam(&self, exam_id: &str) -> Result<Option<Exam>, StoreError> {
        Ok(repositories::exams::find_by_id(&self.pool, exam_id).await?)
    }

    async fn load_page_image(&self, page: &BulkPageInput) -> Result<PageImage, StoreError> {
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

    async fn create_bulk_upload(
        &self,
        upload: &BulkUpload,
        pages: &[BulkUploadPage],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        repositories::bulk_uploads::insert(
            &mut *tx,
            &upload.id,
            &upload.exam_id,
            &upload.original_filename,
            &upload.stored_path,
            upload.created_at,
        )
        .await?;

        for page in pages {
            repositories::bulk_uploads::insert_page(
                &mut *tx,
                repositories::bulk_uploads::NewBulkPage {
                    id: &page.id,
                    bulk_upload_id: &page.bulk_upload_id,
                    page_number: page.page_number,
                    image_key: &page.image_key,
                    width: page.width,
                    height: page.height,
                    detected_student_name: page.detected_student_name.as_deref(),
                    detection_confidence: page.detection_confidence,
                    detection_evidence: page.detection_evidence.as_ref().map(|evidence| evidence.0),
                    created_at: page.created_at,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_bulk_upload(
        &self,
        exam_id: &str,
        bulk_upload_id: &str,
    ) -> Result<Option<BulkUpload>, StoreError> {
        Ok(repositories::bulk_uploads::find_for_exam(&self.pool, exam_id, bulk_upload_id).await?)
    }

    async fn list_bulk_pages(&self, bulk_upload_id: &str) -> Result<Vec<BulkUploadPage>, StoreError> {
        Ok(repositories::bulk_uploads::list_pages(&self.pool, bulk_upload_id).await?)
    }

    async fn create_submissions(
        &self,
        upload: &BulkUpload,
        plans: &[SubmissionPlan],
    ) -> Result<Vec<Submission>, StoreError> {
        let now = primitive_now_utc();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(plans.len());

        for plan in plans {
            let submission = repositories::submissions::insert_from_bulk(
                &mut *tx,
                &Uuid::new_v4().to_string(),
                &upload.exam_id,
                &upload.id,
                &plan.student_name,
                now,
            )
            .await?;

            for page in &plan.pages {
                repositories::submissions::insert_page(
                    &mut *tx,
                    &Uuid::new_v4().to_string(),
                    &submission.id,
                    page.page_number,
                    &page.image_key,
                    page.width,
                    page.height,
                )
                .await?;
            }
            created.push(submission);
        }

        tx.commit().await?;
        Ok(created)
    }
}

fn detection_from_page(page: &BulkUploadPage) -> PageDetection {
    PageDetection {
        page_number: page.page_number,
        student_name: page.detected_student_name.clone(),
        confidence: page.detection_confidence,
        evidence: page.detection_evidence.as_ref().map(|evidence| evidence.0),
    }
}

pub(crate) struct BulkUploadService {
    config: BulkUploadConfig,
    detector: Arc<dyn BulkNameDetector>,
    store: Arc<dyn BulkUploadStore>,
}

impl BulkUploadService {
    pub(crate) fn new(
        config: BulkUploadConfig,
        detector: Arc<dyn BulkNameDetector>,
        store: Arc<dyn BulkUploadStore>,
    ) -> Self {
        Self { config, detector, store }
    }

    pub(crate) async fn create_preview(
        &self,
        exam_id: &str,
        input: NewBulkUpload,
    ) -> Result<BulkPreview, BulkUploadError> {
        if self.store.find_exam(exam_id).await?.is_none() {
            return Err(BulkUploadError::NotFound("Exam not found".to_string()));
        }
        self.validate_pages(&input.pages)?;

        let bulk_upload_id = Uuid::new_v4().to_string();
        let now = primitive_now_utc();
        let mut pages = Vec::with_capacity(input.pages.len());

        for page in &input.pages {
            let detection = self.detect_page(exam_id, page).await?;
            pages.push(BulkUploadPage {
                id: Uuid::new_v4().to_string(),
                bulk_upload_id: bulk_upload_id.clone(),
                page_number: page.page_number,
                image_key: page.image_key.clone(),
                width: page.width,
                height: page.height,
                detected_student_name: detection.student_name,
                detection_confidence: detection.confidence,
                detection_evidence: detection.evidence.map(Json),
                created_at: now,
            });
        }

        let upload = BulkUpload {
            id: bulk_upload_id.clone(),
            exam_id: exam_id.to_string(),
            original_filename: input.original_filename,
            stored_path: input.stored_path,
            created_at: now,
        };
        self.store.create_bulk_upload(&upload, &pages).await?;

        let roster = parse_roster(input.roster.as_deref());
        let detections: Vec<PageDetection> = pages.iter().map(detection_from_page).collect();
        let segmentation = segment_bulk_candidates(
            &detections,
            &roster,
            &self.config.segmentation(input.min_pages_per_student),
            pages.len(),
        );

        tracing::info!(
            exam_id,
            bulk_upload_id = %bulk_upload_id,
            pages = pages.len(),
            roster = roster.len(),
            candidates = segmentation.candidates.len(),
            warnings = segmentation.warnings.len(),
            "Bulk upload preview created"
        );

        Ok(BulkPreview {
            bulk_upload_id,
            page_count: pages.len(),
            candidates: segmentation.candidates,
            warnings: segmentation.warnings,
        })
    }

    /// Re-segments stored detections without a roster.
    pub(crate) async fn get_preview(
        &self,
        exam_id: &str,
        bulk_upload_id: &str,
    ) -> Result<BulkPreview, BulkUploadError> {
        let upload = self.find_upload(exam_id, bulk_upload_id).await?;
        let pages = self.store.list_bulk_pages(&upload.id).await?;
        let detections: Vec<PageDetection> = pages.iter().map(detection_from_page).collect();
        let segmentation =
            segment_bulk_candidates(&detections, &[], &self.config.segmentation(1), pages.len());

        Ok(BulkPreview {
            bulk_upload_id: upload.id,
            page_count: pages.len(),
            candidates: segmentation.candidates,
            warnings: segmentation.warnings,
        })
    }

    pub(crate) async fn finalize(
        &self,
        exam_id: &str,
        bulk_upload_id: &str,
        candidates: &[FinalizeCandidate],
    ) -> Result<BulkFinalizeOutcome, BulkUploadError> {
        let upload = self.find_upload(exam_id, bulk_upload_id).await?;
        let pages = self.store.list_bulk_pages(&upload.id).await?;
        let Some(last_page) = pages.last() else {
            return Err(BulkUploadError::BadRequest("No rendered pages available".to_string()));
        };

        let warnings = validate_finalize_candidates(candidates, last_page.page_number as usize)?;

        let mut plans = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut plan_pages = Vec::new();
            for page_number in candidate.page_start..=candidate.page_end {
                let Some(page) = pages.iter().find(|page| page.page_number == page_number) else {
                    return Err(BulkUploadError::BadRequest(format!(
                        "Page {page_number} is missing from bulk upload"
                    )));
                };
                plan_pages.push(SubmissionPagePlan {
                    page_number: plan_pages.len() as i32 + 1,
                    image_key: page.image_key.clone(),
                    width: page.width,
                    height: page.height,
                });
            }
            plans.push(SubmissionPlan {
                student_name: candidate.student_name.clone(),
                page_start: candidate.page_start,
                page_end: candidate.page_end,
                pages: plan_pages,
            });
        }

        let created = self.store.create_submissions(&upload, &plans).await?;
        let submissions = created
            .into_iter()
            .zip(&plans)
            .map(|(submission, plan)| FinalizedSubmission {
                id: submission.id,
                student_name: submission.student_name,
                page_start: plan.page_start,
                page_end: plan.page_end,
                page_count: plan.pages.len(),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            exam_id,
            bulk_upload_id,
            submissions = submissions.len(),
            warnings = warnings.len(),
            "Bulk upload finalized"
        );

        Ok(BulkFinalizeOutcome { submissions, warnings })
    }

    async fn find_upload(
        &self,
        exam_id: &str,
        bulk_upload_id: &str,
    ) -> Result<BulkUpload, BulkUploadError> {
        self.store
            .find_bulk_upload(exam_id, bulk_upload_id)
            .await?
            .ok_or_else(|| BulkUploadError::NotFound("Bulk upload not found".to_string()))
    }

    fn validate_pages(&self, pages: &[BulkPageInput]) -> Result<(), BulkUploadError> {
        if pages.is_empty() {
            return Err(BulkUploadError::BadRequest("Bulk upload has no pages".to_string()));
        }
        if pages.len() > self.config.max_pages {
            return Err(BulkUploadError::BadRequest(format!(
                "Bulk upload has {} pages; at most {} are supported",
                pages.len(),
                self.config.max_pages
            )));
        }
        for (offset, page) in pages.iter().enumerate() {
            if page.page_number != offset as i32 + 1 {
                return Err(BulkUploadError::BadRequest(
                    "Bulk pages must be numbered consecutively from 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fast tier first, strong tier when no name or a weak one comes back.
    /// Inference failures leave the page undetected.
    async fn detect_page(
        &self,
        exam_id: &str,
        page: &BulkPageInput,
    ) -> Result<NameDetection, BulkUploadError> {
        let image = self.store.load_page_image(page).await?;

        let fast = self
            .detector
            .detect(&image, &self.config.nano_model, &Uuid::new_v4().simple().to_string())
            .await;
        let result = match fast {
            Ok(found)
                if found.student_name.is_some()
                    && found.confidence >= self.config.detect_escalation_confidence =>
            {
                Ok(found)
            }
            Ok(_) => {
                self.detector
                    .detect(&image, &self.config.mini_model, &Uuid::new_v4().simple().to_string())
                    .await
            }
            Err(err) => Err(err),
        };

        Ok(result.unwrap_or_else(|err| {
            tracing::warn!(
                exam_id,
                page_number = page.page_number,
                status = ?err.status_code,
                error = %err,
                "Name detection failed; page left undetected"
            );
            NameDetection::empty()
        }))
    }
}
