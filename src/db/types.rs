use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Exam lifecycle: `DRAFT -> KEY_UPLOADED -> KEY_PAGES_READY -> PARSED -> REVIEWING -> READY`.
/// `FAILED` is reachable from any in-progress step but a failed parse run does not route here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "examstatus", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum ExamStatus {
    Draft,
    KeyUploaded,
    KeyPagesReady,
    Parsed,
    Reviewing,
    Ready,
    Failed,
}

impl ExamStatus {
    /// True while the key pages have not been produced yet.
    pub(crate) fn precedes_key_pages(self) -> bool {
        matches!(self, Self::Draft | Self::KeyUploaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "parserunstatus", rename_all = "lowercase")]
pub(crate) enum ParseRunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "evidencekind", rename_all = "snake_case")]
pub(crate) enum EvidenceKind {
    QuestionBox,
    AnswerBox,
    MarksBox,
}

impl EvidenceKind {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "question_box" => Some(Self::QuestionBox),
            "answer_box" => Some(Self::AnswerBox),
            "marks_box" => Some(Self::MarksBox),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum MarksSource {
    Explicit,
    Inferred,
    #[default]
    Unknown,
}

impl MarksSource {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "explicit" => Some(Self::Explicit),
            "inferred" => Some(Self::Inferred),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "submissionstatus", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum SubmissionStatus {
    Uploaded,
    PagesReady,
}
