//! Validation and coercion of raw answer-key model output into typed records.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::db::models::{Criterion, EvidenceRegion};
use crate::db::types::MarksSource;

pub(crate) const INVALID_OUTPUT_WARNING: &str =
    "Model output invalid; please add questions manually in review.";
pub(crate) const NO_QUESTIONS_WARNING: &str = "No questions extracted; please review manually.";

const DEFAULT_EVIDENCE_SIZE: f64 = 0.1;
const DEFAULT_EVIDENCE_KIND: &str = "question_box";

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid model payload: {0}")]
pub(crate) struct PayloadValidationError(pub(crate) String);

fn invalid(message: impl Into<String>) -> PayloadValidationError {
    PayloadValidationError(message.into())
}

/// Evidence as returned by the model; every field is optional until the
/// box is normalized against the page it was found on.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RawEvidence {
    pub(crate) page_number: Option<i64>,
    pub(crate) x: Option<f64>,
    pub(crate) y: Option<f64>,
    pub(crate) w: Option<f64>,
    pub(crate) h: Option<f64>,
    pub(crate) kind: Option<String>,
    pub(crate) confidence: Option<f64>,
}

impl RawEvidence {
    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        Some(Self {
            page_number: object.get("page_number").and_then(Value::as_i64),
            x: object.get("x").and_then(Value::as_f64),
            y: object.get("y").and_then(Value::as_f64),
            w: object.get("w").and_then(Value::as_f64),
            h: object.get("h").and_then(Value::as_f64),
            kind: object.get("kind").and_then(Value::as_str).map(str::to_string),
            confidence: object.get("confidence").and_then(Value::as_f64),
        })
    }

    /// Fills gaps with defaults; a missing page falls back to the page being parsed.
    pub(crate) fn normalize(&self, default_page: i32) -> EvidenceRegion {
        let page_number = self
            .page_number
            .and_then(|page| i32::try_from(page).ok())
            .filter(|page| *page >= 1)
            .unwrap_or(default_page);

        EvidenceRegion {
            page_number,
            x: self.x.unwrap_or(0.0),
            y: self.y.unwrap_or(0.0),
            w: self.w.unwrap_or(DEFAULT_EVIDENCE_SIZE),
            h: self.h.unwrap_or(DEFAULT_EVIDENCE_SIZE),
            kind: self.kind.clone().unwrap_or_else(|| DEFAULT_EVIDENCE_KIND.to_string()),
            confidence: self.confidence.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedQuestion {
    pub(crate) label: String,
    pub(crate) max_marks: f64,
    pub(crate) marks_source: MarksSource,
    pub(crate) marks_confidence: f64,
    pub(crate) marks_reason: String,
    pub(crate) question_text: String,
    pub(crate) answer_key: String,
    pub(crate) model_solution: String,
    pub(crate) warnings: Vec<String>,
    pub(crate) criteria: Vec<Criterion>,
    pub(crate) evidence: Vec<RawEvidence>,
}

impl ParsedQuestion {
    /// Review is required unless marks were printed and read with confidence.
    pub(crate) fn needs_review(&self) -> bool {
        self.marks_source != MarksSource::Explicit || self.marks_confidence < 0.6
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValidatedPage {
    pub(crate) confidence: f64,
    pub(crate) questions: Vec<ParsedQuestion>,
    pub(crate) warnings: Vec<String>,
}

impl ValidatedPage {
    /// Result used when the payload could not be trusted at all.
    pub(crate) fn invalid_output(mut prior_warnings: Vec<String>) -> Self {
        prior_warnings.push(INVALID_OUTPUT_WARNING.to_string());
        Self { confidence: 0.0, questions: Vec::new(), warnings: prior_warnings }
    }
}

/// Page summary shape used by the API response and the run audit.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct QuestionSummary {
    pub(crate) label: String,
    pub(crate) max_marks: f64,
    pub(crate) marks_source: MarksSource,
    pub(crate) marks_confidence: f64,
    pub(crate) needs_review: bool,
    pub(crate) criteria: Vec<Criterion>,
    pub(crate) evidence: Vec<EvidenceRegion>,
}

pub(crate) fn validate_parse_payload(payload: &Value) -> Result<ValidatedPage, PayloadValidationError> {
    let Some(object) = payload.as_object() else {
        return Err(invalid("payload must be an object"));
    };

    let confidence = match object.get("confidence_score").and_then(Value::as_f64) {
        Some(value) if (0.0..=1.0).contains(&value) => value,
        Some(value) => return Err(invalid(format!("confidence_score out of range: {value}"))),
        None => return Err(invalid("confidence_score must be a number")),
    };

    let Some(raw_questions) = object.get("questions").and_then(Value::as_array) else {
        return Err(invalid("questions must be a list"));
    };

    let mut warnings = string_list(object.get("warnings"));
    let questions = raw_questions
        .iter()
        .enumerate()
        .map(|(idx, raw)| validate_question(idx, raw))
        .collect::<Result<Vec<_>, _>>()?;

    if questions.is_empty() {
        warnings.push(NO_QUESTIONS_WARNING.to_string());
    }

    Ok(ValidatedPage { confidence, questions, warnings })
}

fn validate_question(idx: usize, raw: &Value) -> Result<ParsedQuestion, PayloadValidationError> {
    let Some(object) = raw.as_object() else {
        return Err(invalid(format!("questions[{idx}] must be an object")));
    };

    let label = object.get("label").and_then(Value::as_str).map(str::trim).unwrap_or_default();
    if label.is_empty() {
        return Err(invalid(format!("questions[{idx}].label must be a non-empty string")));
    }

    let Some(max_marks) = object.get("max_marks").and_then(Value::as_f64) else {
        return Err(invalid(format!("questions[{idx}].max_marks must be numeric")));
    };

    let criteria = match object.get("criteria") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(coerce_criterion).collect(),
        Some(_) => return Err(invalid(format!("questions[{idx}].criteria must be a list"))),
    };

    let evidence = object
        .get("evidence")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(RawEvidence::from_value).collect())
        .unwrap_or_default();

    let marks_source = object
        .get("marks_source")
        .and_then(Value::as_str)
        .and_then(MarksSource::parse)
        .unwrap_or_default();

    let marks_confidence =
        object.get("marks_confidence").and_then(Value::as_f64).unwrap_or(0.0).clamp(0.0, 1.0);

    Ok(ParsedQuestion {
        label: label.to_string(),
        max_marks: max_marks.max(0.0),
        marks_source,
        marks_confidence,
        marks_reason: text_field(object.get("marks_reason")),
        question_text: text_field(object.get("question_text")),
        answer_key: text_field(object.get("answer_key")),
        model_solution: text_field(object.get("model_solution")),
        warnings: string_list(object.get("warnings")),
        criteria,
        evidence,
    })
}

fn coerce_criterion(value: &Value) -> Option<Criterion> {
    let object = value.as_object()?;
    let marks = object.get("marks").and_then(Value::as_f64)?;
    let desc = object
        .get("desc")
        .or_else(|| object.get("description"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(Criterion { desc, marks })
}

fn text_field(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
