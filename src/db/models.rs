use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{EvidenceKind, ExamStatus, MarksSource, ParseRunStatus, SubmissionStatus};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Exam {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) status: ExamStatus,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ExamKeyPage {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) page_number: i32,
    pub(crate) image_key: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ExamKeyParseRun {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) request_id: String,
    pub(crate) model_used: String,
    pub(crate) status: ParseRunStatus,
    pub(crate) started_at: PrimitiveDateTime,
    pub(crate) finished_at: Option<PrimitiveDateTime>,
    pub(crate) error_json: Option<Json<serde_json::Value>>,
    pub(crate) timings_json: Option<Json<serde_json::Value>>,
    pub(crate) usage_json: Option<Json<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Question {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) label: String,
    pub(crate) max_marks: i32,
    pub(crate) rubric_json: Json<QuestionRubric>,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct QuestionParseEvidence {
    pub(crate) id: String,
    pub(crate) question_id: String,
    pub(crate) exam_id: String,
    pub(crate) page_number: i32,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) w: f64,
    pub(crate) h: f64,
    pub(crate) evidence_kind: EvidenceKind,
    pub(crate) confidence: f64,
    pub(crate) created_at: PrimitiveDateTime,
}

/// Rubric blob stored on each question.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub(crate) struct QuestionRubric {
    pub(crate) total_marks: i32,
    #[serde(default)]
    pub(crate) criteria: Vec<Criterion>,
    #[serde(default)]
    pub(crate) answer_key: String,
    #[serde(default)]
    pub(crate) model_solution: String,
    #[serde(default)]
    pub(crate) question_text: String,
    #[serde(default)]
    pub(crate) marks_source: MarksSource,
    #[serde(default)]
    pub(crate) marks_confidence: f64,
    #[serde(default)]
    pub(crate) warnings: Vec<String>,
    #[serde(default)]
    pub(crate) marks_reason: String,
    #[serde(default)]
    pub(crate) evidence: Vec<EvidenceRegion>,
    #[serde(default)]
    pub(crate) needs_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Criterion {
    #[serde(alias = "description")]
    pub(crate) desc: String,
    pub(crate) marks: f64,
}

/// Normalized evidence box; coordinates are page fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EvidenceRegion {
    pub(crate) page_number: i32,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) w: f64,
    pub(crate) h: f64,
    pub(crate) kind: String,
    pub(crate) confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BulkUpload {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) original_filename: String,
    pub(crate) stored_path: String,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct BulkUploadPage {
    pub(crate) id: String,
    pub(crate) bulk_upload_id: String,
    pub(crate) page_number: i32,
    pub(crate) image_key: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) detected_student_name: Option<String>,
    pub(crate) detection_confidence: f64,
    pub(crate) detection_evidence: Option<Json<NameEvidence>>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct NameEvidence {
    pub(crate) page_number: i32,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) w: f64,
    pub(crate) h: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Submission {
    pub(crate) id: String,
    pub(crate) exam_id: String,
    pub(crate) bulk_upload_id: Option<String>,
    pub(crate) student_name: String,
    pub(crate) status: SubmissionStatus,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct SubmissionPage {
    pub(crate) id: String,
    pub(crate) submission_id: String,
    pub(crate) page_number: i32,
    pub(crate) image_key: String,
    pub(crate) width: i32,
    pub(crate) height: i32,
}
