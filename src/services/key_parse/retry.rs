use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::time::elapsed_ms;
use crate::services::inference::{AnswerKeyParser, InferenceError, ParseRequest, ParseResult};

/// Per-tier retry schedule. One delay per retry; an empty schedule means a
/// single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl RetryPolicy {
    pub(crate) fn from_millis(delays: &[u64]) -> Self {
        Self { backoff: delays.iter().copied().map(Duration::from_millis).collect() }
    }

    pub(crate) fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Delay before the retry that follows the zero-based `attempt`.
    pub(crate) fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.backoff.get(attempt).copied()
    }
}

/// One inference call, successful or not, as written to the attempts log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct AttemptRecord {
    pub(crate) model: String,
    pub(crate) page_index: usize,
    pub(crate) attempt: usize,
    pub(crate) elapsed_ms: u64,
    pub(crate) failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) status_code: Option<u16>,
    pub(crate) input_tokens: u64,
    pub(crate) output_tokens: u64,
}

/// Calls one tier until it succeeds, fails non-retryably, or the schedule
/// runs out. Every call is appended to `attempts`.
pub(crate) async fn call_tier(
    parser: &dyn AnswerKeyParser,
    request: ParseRequest<'_>,
    policy: &RetryPolicy,
    page_index: usize,
    attempts: &mut Vec<AttemptRecord>,
) -> Result<ParseResult, InferenceError> {
    let mut attempt = 0;

    loop {
        let started = Instant::now();
        let outcome = parser.parse(request).await;
        let elapsed = elapsed_ms(started.elapsed());

        match outcome {
            Ok(result) => {
                metrics::counter!(
                    "inference_calls_total",
                    "model" => request.model.to_string(),
                    "outcome" => "success"
                )
                .increment(1);
                attempts.push(AttemptRecord {
                    model: request.model.to_string(),
                    page_index,
                    attempt: attempt + 1,
                    elapsed_ms: elapsed,
                    failed: false,
                    confidence_score: result.payload.get("confidence_score").and_then(|v| v.as_f64()),
                    status_code: None,
                    input_tokens: result.usage.input_tokens,
                    output_tokens: result.usage.output_tokens,
                });
                return Ok(result);
            }
            Err(err) => {
                metrics::counter!(
                    "inference_calls_total",
                    "model" => request.model.to_string(),
                    "outcome" => if err.timed_out { "timeout" } else { "error" }
                )
                .increment(1);
                attempts.push(AttemptRecord {
                    model: request.model.to_string(),
                    page_index,
                    attempt: attempt + 1,
                    elapsed_ms: elapsed,
                    failed: true,
                    confidence_score: None,
                    status_code: err.status_code,
                    input_tokens: 0,
                    output_tokens: 0,
                });

                let delay = if err.is_retryable() { policy.delay_after(attempt) } else { None };
                let Some(delay) = delay else {
                    return Err(err);
                };

                tracing::warn!(
                    request_id = %request.request_id,
                    model = %request.model,
                    page_index,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts(),
                    status = ?err.status_code,
                    delay_ms = elapsed_ms(delay),
                    "Retrying inference call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_controls_attempt_count() {
        let none = RetryPolicy::from_millis(&[]);
        assert_eq!(none.max_attempts(), 1);
        assert_eq!(none.delay_after(0), None);

        let two = RetryPolicy::from_millis(&[1000, 2000]);
        assert_eq!(two.max_attempts(), 3);
        assert_eq!(two.delay_after(1), Some(Duration::from_secs(2)));
        assert_eq!(two.delay_after(2), None);
    }
}
