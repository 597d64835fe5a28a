use serde::Serialize;

use crate::core::time::format_primitive;
use crate::db::models::ExamKeyParseRun;
use crate::db::types::ParseRunStatus;

#[derive(Debug, Serialize)]
pub(crate) struct ParseRunResponse {
    pub(crate) id: String,
    pub(crate) request_id: String,
    pub(crate) model_used: String,
    pub(crate) status: ParseRunStatus,
    pub(crate) started_at: String,
    pub(crate) finished_at: Option<String>,
    pub(crate) error: Option<serde_json::Value>,
    pub(crate) timings: Option<serde_json::Value>,
    pub(crate) usage: Option<serde_json::Value>,
}

impl From<ExamKeyParseRun> for ParseRunResponse {
    fn from(run: ExamKeyParseRun) -> Self {
        Self {
            id: run.id,
            request_id: run.request_id,
            model_used: run.model_used,
            status: run.status,
            started_at: format_primitive(run.started_at),
            finished_at: run.finished_at.map(format_primitive),
            error: run.error_json.map(|value| value.0),
            timings: run.timings_json.map(|value| value.0),
            usage: run.usage_json.map(|value| value.0),
        }
    }
}
