//! Answer-key parsing: page by page, fast tier first, with retry and
//! escalation to the strong tier, then a single all-or-nothing save.

mod retry;
mod store;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::config::{ModelPrice, Settings};
use crate::core::time::elapsed_ms;
use crate::db::models::{ExamKeyPage, QuestionRubric};
use crate::db::types::{ExamStatus, ParseRunStatus};
use crate::services::answer_key_schema::{build_answer_key_response_schema, SchemaBuildError};
use crate::services::inference::{
    truncate_chars, AnswerKeyParser, InferenceError, PageImage, ParseRequest,
};
use crate::services::parse_payload::{
    validate_parse_payload, ParsedQuestion, QuestionSummary, ValidatedPage,
};
use crate::services::usage::{UsageLedger, UsageSummary};

pub(crate) use retry::{AttemptRecord, RetryPolicy};
pub(crate) use store::{ExamKeyStore, PgExamKeyStore, QuestionDraft, RunCompletion, StoreError};

const UNCLASSIFIED_MESSAGE_LIMIT: usize = 300;

pub(crate) const NO_QUESTIONS_SAVED_WARNING: &str =
    "No questions extracted; manual question entry is required.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ParseStage {
    LoadExam,
    BuildKeyPages,
    ModelConfig,
    CallPageNano,
    CallPageMini,
    ValidateOutput,
    SaveQuestions,
}

impl ParseStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::LoadExam => "load_exam",
            Self::BuildKeyPages => "build_key_pages",
            Self::ModelConfig => "model_config",
            Self::CallPageNano => "call_page_nano",
            Self::CallPageMini => "call_page_mini",
            Self::ValidateOutput => "validate_output",
            Self::SaveQuestions => "save_questions",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct KeyParseConfig {
    pub(crate) allowed_models: Vec<String>,
    pub(crate) nano_model: String,
    pub(crate) mini_model: String,
    pub(crate) nano_retry: RetryPolicy,
    pub(crate) mini_retry: RetryPolicy,
    pub(crate) escalation_confidence: f64,
    pub(crate) max_pages: usize,
    pub(crate) pricing: BTreeMap<String, ModelPrice>,
}

impl KeyParseConfig {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        let key_parse = settings.key_parse();
        Self {
            allowed_models: key_parse.allowed_models.clone(),
            nano_model: key_parse.nano_model.clone(),
            mini_model: key_parse.mini_model.clone(),
            nano_retry: RetryPolicy::from_millis(&key_parse.nano_backoff_ms),
            mini_retry: RetryPolicy::from_millis(&key_parse.mini_backoff_ms),
            escalation_confidence: key_parse.escalation_confidence,
            max_pages: key_parse.max_pages,
            pricing: settings.pricing().models.clone(),
        }
    }

    fn resolve_models(&self) -> Result<(&str, &str), KeyParseError> {
        for model in [&self.nano_model, &self.mini_model] {
            if !self.allowed_models.contains(model) {
                return Err(KeyParseError::Config(format!(
                    "Model allowlist is missing required model: {model}"
                )));
            }
        }
        Ok((&self.nano_model, &self.mini_model))
    }
}

#[derive(Debug, Error)]
pub(crate) enum KeyParseError {
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Schema(#[from] SchemaBuildError),
    #[error("inference timed out on page {page_index}")]
    UpstreamTimeout { page_index: usize, source: InferenceError },
    #[error("inference failed on page {page_index}")]
    Upstream { page_index: usize, source: InferenceError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KeyParseError {
    fn upstream(page_index: usize, source: InferenceError) -> Self {
        if source.is_retryable() {
            Self::UpstreamTimeout { page_index, source }
        } else {
            Self::Upstream { page_index, source }
        }
    }

    pub(crate) fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) | Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::Schema(_) | Self::Store(_) => 500,
            Self::Upstream { .. } => 502,
            Self::UpstreamTimeout { .. } => 504,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Config(message) | Self::NotFound(message) | Self::BadRequest(message) => {
                message.clone()
            }
            Self::Schema(err) => unclassified("SchemaBuildError", &err.to_string()),
            Self::Store(err) => unclassified("StoreError", &err.to_string()),
            Self::UpstreamTimeout { page_index, .. } => {
                format!("OpenAI timed out on page {page_index}")
            }
            Self::Upstream { page_index, source } => {
                format!("OpenAI request failed on page {page_index}: {}", source.message)
            }
        }
    }

    fn inference_error(&self) -> Option<&InferenceError> {
        match self {
            Self::UpstreamTimeout { source, .. } | Self::Upstream { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn unclassified(kind: &str, message: &str) -> String {
    format!("Key parsing failed: {kind}: {}", truncate_chars(message, UNCLASSIFIED_MESSAGE_LIMIT))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub(crate) struct KeyPageMeta {
    pub(crate) page_number: i32,
    pub(crate) width: i32,
    pub(crate) height: i32,
}

impl From<&ExamKeyPage> for KeyPageMeta {
    fn from(page: &ExamKeyPage) -> Self {
        Self { page_number: page.page_number, width: page.width, height: page.height }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub(crate) struct StageTimings {
    pub(crate) build_pages_ms: u64,
    pub(crate) inference_ms: u64,
    pub(crate) validate_ms: u64,
    pub(crate) save_ms: u64,
}

/// Client-visible body of a failed parse.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct KeyParseFailure {
    #[serde(skip)]
    pub(crate) status_code: u16,
    pub(crate) detail: String,
    pub(crate) request_id: String,
    pub(crate) stage: ParseStage,
    pub(crate) openai_status: Option<u16>,
    pub(crate) openai_error: Option<String>,
    pub(crate) page_index: Option<usize>,
    pub(crate) page_count: usize,
    pub(crate) key_pages: Vec<KeyPageMeta>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct KeyParseOutcome {
    pub(crate) exam_id: String,
    pub(crate) request_id: String,
    pub(crate) status: ExamStatus,
    pub(crate) model_used: String,
    pub(crate) confidence_score: f64,
    pub(crate) questions_count: usize,
    pub(crate) questions: Vec<QuestionSummary>,
    pub(crate) warnings: Vec<String>,
    pub(crate) timings: StageTimings,
    pub(crate) attempts: Vec<AttemptRecord>,
    pub(crate) usage: UsageSummary,
    pub(crate) page_count: usize,
    pub(crate) key_pages: Vec<KeyPageMeta>,
}

/// Run-wide confidence is the weakest page; no pages means no confidence.
pub(crate) fn combine_confidence(pages: &[f64]) -> f64 {
    pages.iter().copied().reduce(f64::min).unwrap_or(0.0)
}

fn page_prompt(page_number: i32, page_count: usize) -> String {
    format!(
        "You are parsing page {page_number} of {page_count} of an exam answer key and must \
         produce exam-aware structured output for this page only. \
         Identify question boundaries using patterns like Q1, Q2, Question 1, 1., 2), (a), (b). \
         Identify marks using patterns like [3 marks], (5 marks), /5, out of 5, 5 pts. \
         For each question extract: label, max_marks, question_text, answer_key (final answer token), \
         model_solution, and criteria[] with desc + marks. Set marks_source to explicit when marks \
         are printed, inferred when you estimated them, unknown otherwise, and explain in marks_reason. \
         Add evidence boxes as page fractions for the question, answer and marks regions. \
         If problem text exists but reliable question splitting is not possible, return exactly one \
         fallback question with label='Q1', max_marks=0, \
         criteria=[{{\"desc\":\"Needs teacher review\",\"marks\":0}}]. \
         Return ONLY JSON matching the provided schema."
    )
}

fn draft_from_parsed(question: &ParsedQuestion, page_number: i32) -> QuestionDraft {
    let max_marks = question.max_marks as i32;
    QuestionDraft {
        label: question.label.clone(),
        max_marks,
        rubric: QuestionRubric {
            total_marks: max_marks,
            criteria: question.criteria.clone(),
            answer_key: question.answer_key.clone(),
            model_solution: question.model_solution.clone(),
            question_text: question.question_text.clone(),
            marks_source: question.marks_source,
            marks_confidence: question.marks_confidence,
            warnings: question.warnings.clone(),
            marks_reason: question.marks_reason.clone(),
            evidence: question.evidence.iter().map(|raw| raw.normalize(page_number)).collect(),
            needs_review: question.needs_review(),
        },
    }
}

struct RunContext {
    request_id: String,
    stage: ParseStage,
    page_index: Option<usize>,
    page_count: usize,
    key_pages: Vec<KeyPageMeta>,
    model_used: String,
    timings: StageTimings,
    attempts: Vec<AttemptRecord>,
    usage: UsageLedger,
}

impl RunContext {
    fn failure(&self, err: &KeyParseError) -> KeyParseFailure {
        let upstream = err.inference_error();
        KeyParseFailure {
            status_code: err.status_code(),
            detail: err.detail(),
            request_id: self.request_id.clone(),
            stage: self.stage,
            openai_status: upstream.and_then(|source| source.status_code),
            openai_error: upstream.map(|source| {
                if source.body.is_empty() {
                    source.message.clone()
                } else {
                    source.body.clone()
                }
            }),
            page_index: self.page_index,
            page_count: self.page_count,
            key_pages: self.key_pages.clone(),
        }
    }

    fn completion(&self, status: ParseRunStatus, error: Option<Value>) -> RunCompletion {
        RunCompletion {
            status,
            model_used: self.model_used.clone(),
            error,
            timings: serde_json::to_value(self.timings).unwrap_or(Value::Null),
            usage: serde_json::to_value(self.usage.summary()).unwrap_or(Value::Null),
        }
    }
}

pub(crate) struct KeyParseOrchestrator {
    config: KeyParseConfig,
    parser: Arc<dyn AnswerKeyParser>,
    store: Arc<dyn ExamKeyStore>,
}

impl KeyParseOrchestrator {
    pub(crate) fn new(
        config: KeyParseConfig,
        parser: Arc<dyn AnswerKeyParser>,
        store: Arc<dyn ExamKeyStore>,
    ) -> Self {
        Self { config, parser, store }
    }

    pub(crate) async fn parse_exam(&self, exam_id: &str) -> Result<KeyParseOutcome, KeyParseFailure> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut run = RunContext {
            request_id: Uuid::new_v4().to_string(),
            stage: ParseStage::LoadExam,
            page_index: None,
            page_count: 0,
            key_pages: Vec::new(),
            model_used: String::new(),
            timings: StageTimings::default(),
            attempts: Vec::new(),
            usage: UsageLedger::new(self.config.pricing.clone()),
        };

        tracing::info!(exam_id, request_id = %run.request_id, "Answer key parse started");

        if let Err(err) = self.store.start_run(&run_id, exam_id, &run.request_id).await {
            let err = KeyParseError::Store(err);
            tracing::error!(exam_id, request_id = %run.request_id, error = %err, "Failed to record parse run");
            return Err(run.failure(&err));
        }

        let result = self.execute(exam_id, &mut run).await;
        metrics::histogram!("key_parse_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                metrics::counter!("key_parse_runs_total", "status" => "success").increment(1);
                if let Err(err) =
                    self.store.finish_run(&run_id, run.completion(ParseRunStatus::Success, None)).await
                {
                    tracing::error!(
                        exam_id,
                        request_id = %run.request_id,
                        error = %err,
                        "Failed to finalize successful parse run"
                    );
                }
                tracing::info!(
                    exam_id,
                    request_id = %run.request_id,
                    model = %outcome.model_used,
                    questions = outcome.questions_count,
                    confidence = outcome.confidence_score,
                    elapsed_ms = elapsed_ms(started.elapsed()),
                    "Answer key parse finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                metrics::counter!("key_parse_runs_total", "status" => "failed").increment(1);
                let failure = run.failure(&err);
                if failure.status_code >= 500 {
                    tracing::error!(
                        exam_id,
                        request_id = %run.request_id,
                        stage = run.stage.as_str(),
                        page_index = ?run.page_index,
                        page_count = run.page_count,
                        error = %err,
                        "Answer key parse failed"
                    );
                } else {
                    tracing::warn!(
                        exam_id,
                        request_id = %run.request_id,
                        stage = run.stage.as_str(),
                        error = %err,
                        "Answer key parse rejected"
                    );
                }

                let error_json = serde_json::to_value(&failure).ok();
                if let Err(store_err) = self
                    .store
                    .finish_run(&run_id, run.completion(ParseRunStatus::Failed, error_json))
                    .await
                {
                    tracing::error!(
                        exam_id,
                        request_id = %run.request_id,
                        error = %store_err,
                        "Failed to finalize failed parse run"
                    );
                }
                Err(failure)
            }
        }
    }

    async fn execute(
        &self,
        exam_id: &str,
        run: &mut RunContext,
    ) -> Result<KeyParseOutcome, KeyParseError> {
        run.stage = ParseStage::LoadExam;
        let Some(exam) = self.store.find_exam(exam_id).await? else {
            return Err(KeyParseError::NotFound("Exam not found".to_string()));
        };

        run.stage = ParseStage::BuildKeyPages;
        let build_started = Instant::now();
        let pages = self.store.list_key_pages(exam_id).await?;
        run.page_count = pages.len();
        run.key_pages = pages.iter().map(KeyPageMeta::from).collect();

        if pages.is_empty() {
            return Err(KeyParseError::BadRequest(
                "No key pages available. Upload and build pages first.".to_string(),
            ));
        }
        if pages.len() > self.config.max_pages {
            return Err(KeyParseError::BadRequest(format!(
                "Answer key has {} pages; at most {} can be parsed",
                pages.len(),
                self.config.max_pages
            )));
        }

        let mut images = Vec::with_capacity(pages.len());
        for page in &pages {
            images.push(self.store.load_key_page_image(page).await?);
        }
        if exam.status.precedes_key_pages() {
            self.store.set_exam_status(exam_id, ExamStatus::KeyPagesReady).await?;
        }
        run.timings.build_pages_ms = elapsed_ms(build_started.elapsed());

        run.stage = ParseStage::ModelConfig;
        let (nano_model, mini_model) = self.config.resolve_models()?;
        let schema = build_answer_key_response_schema()?;
        run.model_used = nano_model.to_string();

        let mut confidences = Vec::with_capacity(images.len());
        let mut drafts = Vec::new();
        let mut summaries = Vec::new();
        let mut warnings = Vec::new();

        for (offset, image) in images.iter().enumerate() {
            let page_index = offset + 1;
            run.page_index = Some(page_index);

            let page =
                self.parse_page(run, image, page_index, nano_model, mini_model, &schema).await?;

            confidences.push(page.confidence);
            for question in &page.questions {
                let draft = draft_from_parsed(question, image.page_number);
                summaries.push(QuestionSummary {
                    label: draft.label.clone(),
                    max_marks: question.max_marks,
                    marks_source: question.marks_source,
                    marks_confidence: question.marks_confidence,
                    needs_review: draft.rubric.needs_review,
                    criteria: draft.rubric.criteria.clone(),
                    evidence: draft.rubric.evidence.clone(),
                });
                drafts.push(draft);
            }
            warnings.extend(page.warnings);
        }

        run.stage = ParseStage::SaveQuestions;
        let save_started = Instant::now();
        let status = if drafts.is_empty() {
            warnings.push(NO_QUESTIONS_SAVED_WARNING.to_string());
            ExamStatus::Parsed
        } else {
            ExamStatus::Reviewing
        };
        self.store.save_parsed_questions(exam_id, &drafts, status).await?;
        run.timings.save_ms = elapsed_ms(save_started.elapsed());

        Ok(KeyParseOutcome {
            exam_id: exam_id.to_string(),
            request_id: run.request_id.clone(),
            status,
            model_used: run.model_used.clone(),
            confidence_score: combine_confidence(&confidences),
            questions_count: summaries.len(),
            questions: summaries,
            warnings,
            timings: run.timings,
            attempts: run.attempts.clone(),
            usage: run.usage.summary(),
            page_count: run.page_count,
            key_pages: run.key_pages.clone(),
        })
    }

    async fn parse_page(
        &self,
        run: &mut RunContext,
        image: &PageImage,
        page_index: usize,
        nano_model: &str,
        mini_model: &str,
        schema: &Value,
    ) -> Result<ValidatedPage, KeyParseError> {
        let prompt = page_prompt(image.page_number, run.page_count);
        let request_id = run.request_id.clone();
        let pages = std::slice::from_ref(image);
        let request = |model| ParseRequest {
            pages,
            model,
            prompt: &prompt,
            schema,
            request_id: &request_id,
        };

        run.stage = ParseStage::CallPageNano;
        let inference_started = Instant::now();
        let fast = retry::call_tier(
            self.parser.as_ref(),
            request(nano_model),
            &self.config.nano_retry,
            page_index,
            &mut run.attempts,
        )
        .await;
        run.timings.inference_ms += elapsed_ms(inference_started.elapsed());

        let fast_page = match fast {
            Ok(result) => {
                run.usage.record(&result.model, result.usage);
                self.validate(run, &result.payload, Vec::new())
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %request_id,
                    page_index,
                    status = ?err.status_code,
                    retryable = err.is_retryable(),
                    "Fast tier failed; escalating page to strong tier"
                );
                metrics::counter!("key_parse_escalations_total").increment(1);
                return self.escalate(run, request(mini_model), page_index, Vec::new()).await;
            }
        };

        if !fast_page.questions.is_empty() && fast_page.confidence >= self.config.escalation_confidence
        {
            return Ok(fast_page);
        }

        tracing::info!(
            request_id = %request_id,
            page_index,
            questions = fast_page.questions.len(),
            confidence = fast_page.confidence,
            "Fast tier result is empty or unsure; escalating page to strong tier"
        );
        metrics::counter!("key_parse_escalations_total").increment(1);
        self.escalate(run, request(mini_model), page_index, fast_page.warnings).await
    }

    /// Strong-tier call for one page. `fallback_warnings` are kept if the
    /// strong output does not validate.
    async fn escalate(
        &self,
        run: &mut RunContext,
        request: ParseRequest<'_>,
        page_index: usize,
        fallback_warnings: Vec<String>,
    ) -> Result<ValidatedPage, KeyParseError> {
        run.stage = ParseStage::CallPageMini;
        run.model_used = request.model.to_string();
        let started = Instant::now();
        let strong = retry::call_tier(
            self.parser.as_ref(),
            request,
            &self.config.mini_retry,
            page_index,
            &mut run.attempts,
        )
        .await;
        run.timings.inference_ms += elapsed_ms(started.elapsed());

        let result = strong.map_err(|err| KeyParseError::upstream(page_index, err))?;
        run.usage.record(&result.model, result.usage);
        run.model_used = result.model.clone();
        Ok(self.validate(run, &result.payload, fallback_warnings))
    }

    fn validate(
        &self,
        run: &mut RunContext,
        payload: &Value,
        fallback_warnings: Vec<String>,
    ) -> ValidatedPage {
        run.stage = ParseStage::ValidateOutput;
        let started = Instant::now();
        let page = validate_parse_payload(payload).unwrap_or_else(|err| {
            tracing::warn!(
                request_id = %run.request_id,
                page_index = ?run.page_index,
                error = %err,
                "Model output failed validation"
            );
            ValidatedPage::invalid_output(fallback_warnings)
        });
        run.timings.validate_ms += elapsed_ms(started.elapsed());
        page
    }
}
