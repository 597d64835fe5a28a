use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::db::models::NameEvidence;

/// Truncation limit for upstream error bodies kept in the run audit.
pub(crate) const ERROR_BODY_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub(crate) struct PageImage {
    pub(crate) page_number: i32,
    pub(crate) mime_type: String,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct TokenUsage {
    pub(crate) input_tokens: u64,
    pub(crate) output_tokens: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ParseRequest<'a> {
    pub(crate) pages: &'a [PageImage],
    pub(crate) model: &'a str,
    pub(crate) prompt: &'a str,
    pub(crate) schema: &'a Value,
    pub(crate) request_id: &'a str,
}

/// Raw structured output of one call plus the model that produced it.
#[derive(Debug, Clone)]
pub(crate) struct ParseResult {
    pub(crate) payload: Value,
    pub(crate) model: String,
    pub(crate) usage: TokenUsage,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub(crate) struct InferenceError {
    pub(crate) status_code: Option<u16>,
    pub(crate) body: String,
    pub(crate) message: String,
    pub(crate) timed_out: bool,
}

impl InferenceError {
    pub(crate) fn timeout(message: impl Into<String>) -> Self {
        Self {
            status_code: Some(504),
            body: String::new(),
            message: message.into(),
            timed_out: true,
        }
    }

    pub(crate) fn status(status_code: u16, body: impl Into<String>) -> Self {
        let body = truncate_chars(&body.into(), ERROR_BODY_LIMIT);
        Self {
            status_code: Some(status_code),
            message: format!("inference request failed with status {status_code}"),
            body,
            timed_out: false,
        }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self { status_code: None, body: String::new(), message: message.into(), timed_out: false }
    }

    /// Transient failures: rate limiting, unavailable upstream, or timeout.
    pub(crate) fn is_retryable(&self) -> bool {
        self.timed_out || matches!(self.status_code, Some(429 | 503 | 504))
    }
}

pub(crate) fn truncate_chars(value: &str, limit: usize) -> String {
    match value.char_indices().nth(limit) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[async_trait]
pub(crate) trait AnswerKeyParser: Send + Sync {
    async fn parse(&self, request: ParseRequest<'_>) -> Result<ParseResult, InferenceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct NameDetection {
    pub(crate) student_name: Option<String>,
    pub(crate) confidence: f64,
    pub(crate) evidence: Option<NameEvidence>,
}

impl NameDetection {
    pub(crate) fn empty() -> Self {
        Self { student_name: None, confidence: 0.0, evidence: None }
    }
}

#[async_trait]
pub(crate) trait BulkNameDetector: Send + Sync {
    async fn detect(
        &self,
        page: &PageImage,
        model: &str,
        request_id: &str,
    ) -> Result<NameDetection, InferenceError>;
}

/// Canned parser used when `OPENAI_MOCK` is set. The fast tier always comes
/// back unsure so the escalation path runs end to end.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockAnswerKeyParser;

#[async_trait]
impl AnswerKeyParser for MockAnswerKeyParser {
    async fn parse(&self, request: ParseRequest<'_>) -> Result<ParseResult, InferenceError> {
        let page_number = request.pages.first().map(|page| page.page_number).unwrap_or(1);
        let payload = if request.model.contains("nano") {
            json!({"confidence_score": 0.4, "warnings": [], "questions": []})
        } else {
            json!({
                "confidence_score": 0.8,
                "warnings": [],
                "questions": [
                    {
                        "label": "Q1",
                        "max_marks": 5,
                        "marks_source": "explicit",
                        "marks_confidence": 0.9,
                        "marks_reason": "Printed [5] next to the question",
                        "question_text": "Solve for x",
                        "answer_key": "x=4",
                        "model_solution": "x+3=7 so x=4",
                        "warnings": [],
                        "criteria": [
                            {"desc": "Correct algebra", "marks": 3},
                            {"desc": "Correct final answer", "marks": 2}
                        ],
                        "evidence": [
                            {"page_number": page_number, "x": 0.05, "y": 0.1, "w": 0.9, "h": 0.2,
                             "kind": "question_box", "confidence": 0.8}
                        ]
                    },
                    {
                        "label": "Q2",
                        "max_marks": 3,
                        "marks_source": "explicit",
                        "marks_confidence": 0.85,
                        "marks_reason": "Printed (3 marks)",
                        "question_text": "Find y",
                        "answer_key": "y=7",
                        "model_solution": "Substitute and solve",
                        "warnings": [],
                        "criteria": [
                            {"desc": "Method", "marks": 1},
                            {"desc": "Correct final answer", "marks": 2}
                        ],
                        "evidence": [
                            {"page_number": page_number, "x": 0.05, "y": 0.4, "w": 0.9, "h": 0.2,
                             "kind": "question_box", "confidence": 0.75}
                        ]
                    }
                ]
            })
        };

        Ok(ParseResult {
            payload,
            model: request.model.to_string(),
            usage: TokenUsage { input_tokens: 1200, output_tokens: 300 },
        })
    }
}

/// Reads the name from page bytes of the form `name:<student>`; anything
/// else is reported as undetected.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockNameDetector;

#[async_trait]
impl BulkNameDetector for MockNameDetector {
    async fn detect(
        &self,
        page: &PageImage,
        _model: &str,
        _request_id: &str,
    ) -> Result<NameDetection, InferenceError> {
        let text = String::from_utf8_lossy(&page.bytes);
        let Some(name) = text.trim().strip_prefix("name:").map(str::trim) else {
            return Ok(NameDetection::empty());
        };
        if name.is_empty() {
            return Ok(NameDetection::empty());
        }

        Ok(NameDetection {
            student_name: Some(name.to_string()),
            confidence: 0.9,
            evidence: Some(NameEvidence {
                page_number: page.page_number,
                x: 0.05,
                y: 0.02,
                w: 0.4,
                h: 0.06,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_and_timeouts() {
        assert!(InferenceError::status(429, "slow down").is_retryable());
        assert!(InferenceError::status(503, "").is_retryable());
        assert!(InferenceError::status(504, "").is_retryable());
        assert!(InferenceError::timeout("timed out").is_retryable());
        assert!(!InferenceError::status(400, "bad schema").is_retryable());
        assert!(!InferenceError::status(500, "").is_retryable());
        assert!(!InferenceError::transport("connection reset").is_retryable());
    }

    #[test]
    fn status_error_body_is_truncated() {
        let err = InferenceError::status(500, "x".repeat(ERROR_BODY_LIMIT + 50));
        assert_eq!(err.body.len(), ERROR_BODY_LIMIT);
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[tokio::test]
    async fn mock_parser_is_unsure_on_fast_tier_only() {
        let schema = json!({});
        let pages = vec![PageImage { page_number: 2, mime_type: "image/png".into(), bytes: vec![] }];
        let request = |model| ParseRequest {
            pages: &pages,
            model,
            prompt: "",
            schema: &schema,
            request_id: "req",
        };

        let nano = MockAnswerKeyParser.parse(request("gpt-5-nano")).await.unwrap();
        assert_eq!(nano.payload["confidence_score"], 0.4);
        assert_eq!(nano.payload["questions"], json!([]));

        let mini = MockAnswerKeyParser.parse(request("gpt-5-mini")).await.unwrap();
        assert_eq!(mini.payload["questions"][0]["label"], "Q1");
        assert_eq!(mini.payload["questions"][1]["evidence"][0]["page_number"], 2);
    }

    #[tokio::test]
    async fn mock_detector_reads_name_prefix() {
        let page = PageImage { page_number: 1, mime_type: "image/png".into(), bytes: b"name: Alice".to_vec() };
        let found = MockNameDetector.detect(&page, "m", "r").await.unwrap();
        assert_eq!(found.student_name.as_deref(), Some("Alice"));

        let blank = PageImage { page_number: 2, mime_type: "image/png".into(), bytes: vec![0xff, 0xd8] };
        assert_eq!(MockNameDetector.detect(&blank, "m", "r").await.unwrap(), NameDetection::empty());
    }
}
