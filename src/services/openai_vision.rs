use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::core::time::elapsed_ms;
use crate::db::models::NameEvidence;
use crate::services::answer_key_schema::{
    build_name_detection_schema, ANSWER_KEY_SCHEMA_NAME, NAME_DETECTION_SCHEMA_NAME,
};
use crate::services::inference::{
    AnswerKeyParser, BulkNameDetector, InferenceError, NameDetection, PageImage, ParseRequest,
    ParseResult, TokenUsage,
};

const NAME_DETECTION_PROMPT: &str = "This is one scanned page from a stack of student exam \
    submissions. Find the handwritten or printed student name, usually near the top of the page \
    in a Name field. Return student_name exactly as written, or null when no name is visible. \
    Set confidence between 0 and 1 and give the name region as page fractions in evidence, or \
    null when there is no name. Return ONLY JSON matching the provided schema.";

/// Responses API client for both answer-key parsing and bulk name detection.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiVisionClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiVisionClient {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let timeout = Duration::from_secs(settings.ai().request_timeout_seconds);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn create_response(
        &self,
        payload: &Value,
        model: &str,
        request_id: &str,
    ) -> Result<(Value, TokenUsage), InferenceError> {
        let url = format!("{}/responses", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Client-Request-Id", request_id)
            .json(payload)
            .send()
            .await
            .map_err(|err| classify_transport_error(&err))?;

        let status = response.status();
        let body = response.text().await.map_err(|err| classify_transport_error(&err))?;

        tracing::info!(
            request_id,
            model,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms(started.elapsed()),
            "OpenAI responses call finished"
        );

        if !status.is_success() {
            return Err(InferenceError::status(status.as_u16(), body));
        }

        let envelope: Value = serde_json::from_str(&body).map_err(|err| {
            InferenceError::transport(format!("OpenAI returned a non-JSON envelope: {err}"))
        })?;
        let usage = extract_usage(&envelope);

        let payload = match extract_output_text(&envelope) {
            Some(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                tracing::warn!(request_id, model, error = %err, "Model output is not valid JSON");
                Value::Null
            }),
            None => {
                tracing::warn!(request_id, model, "OpenAI response has no output text");
                Value::Null
            }
        };

        Ok((payload, usage))
    }
}

fn classify_transport_error(err: &reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::timeout(format!("OpenAI request timed out: {err}"))
    } else {
        InferenceError::transport(format!("OpenAI request failed: {err}"))
    }
}

/// Builds a strict structured-output request with one text part followed by
/// the page images as data URLs.
pub(crate) fn build_responses_request(
    model: &str,
    prompt: &str,
    pages: &[PageImage],
    schema_name: &str,
    schema: &Value,
) -> Value {
    let mut content = vec![json!({"type": "input_text", "text": prompt})];
    for page in pages {
        content.push(json!({
            "type": "input_image",
            "image_url": format!("data:{};base64,{}", page.mime_type, STANDARD.encode(&page.bytes)),
        }));
    }

    json!({
        "model": model,
        "input": [{"role": "user", "content": content}],
        "text": {
            "format": {
                "type": "json_schema",
                "name": schema_name,
                "strict": true,
                "schema": schema,
            }
        }
    })
}

/// Prefers the `output_text` convenience field, otherwise joins every
/// `output_text` content item.
pub(crate) fn extract_output_text(envelope: &Value) -> Option<String> {
    if let Some(text) = envelope.get("output_text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    let parts: Vec<&str> = envelope
        .get("output")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}

fn extract_usage(envelope: &Value) -> TokenUsage {
    let usage = envelope.get("usage");
    let read = |field: &str| usage.and_then(|u| u.get(field)).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage { input_tokens: read("input_tokens"), output_tokens: read("output_tokens") }
}

fn name_detection_from_payload(payload: &Value, page_number: i32) -> NameDetection {
    let student_name = payload
        .get("student_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let confidence =
        payload.get("confidence").and_then(Value::as_f64).unwrap_or(0.0).clamp(0.0, 1.0);
    let evidence = payload.get("evidence").filter(|value| value.is_object()).map(|value| {
        let read = |field: &str| value.get(field).and_then(Value::as_f64).unwrap_or(0.0);
        NameEvidence { page_number, x: read("x"), y: read("y"), w: read("w"), h: read("h") }
    });

    NameDetection { student_name, confidence, evidence }
}

#[async_trait]
impl AnswerKeyParser for OpenAiVisionClient {
    async fn parse(&self, request: ParseRequest<'_>) -> Result<ParseResult, InferenceError> {
        let payload = build_responses_request(
            request.model,
            request.prompt,
            request.pages,
            ANSWER_KEY_SCHEMA_NAME,
            request.schema,
        );
        let (payload, usage) =
            self.create_response(&payload, request.model, request.request_id).await?;

        Ok(ParseResult { payload, model: request.model.to_string(), usage })
    }
}

#[async_trait]
impl BulkNameDetector for OpenAiVisionClient {
    async fn detect(
        &self,
        page: &PageImage,
        model: &str,
        request_id: &str,
    ) -> Result<NameDetection, InferenceError> {
        let schema = build_name_detection_schema()
            .map_err(|err| InferenceError::transport(err.to_string()))?;
        let request = build_responses_request(
            model,
            NAME_DETECTION_PROMPT,
            std::slice::from_ref(page),
            NAME_DETECTION_SCHEMA_NAME,
            &schema,
        );
        let (payload, _usage) = self.create_response(&request, model, request_id).await?;

        Ok(name_detection_from_payload(&payload, page.page_number))
    }
}
