pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod schemas;
pub(crate) mod services;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{
    config::Settings,
    state::{AppState, Backends},
    telemetry,
};
use crate::services::bulk_uploads::PgBulkUploadStore;
use crate::services::inference::{
    AnswerKeyParser, BulkNameDetector, MockAnswerKeyParser, MockNameDetector,
};
use crate::services::key_parse::PgExamKeyStore;
use crate::services::openai_vision::OpenAiVisionClient;
use crate::services::storage::StorageService;

pub async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let storage = StorageService::from_settings(&settings).await?;
    match &storage {
        Some(storage) => tracing::info!(bucket = %storage.bucket(), "S3 storage configured"),
        None => tracing::warn!("S3 storage is not configured; page images cannot be loaded"),
    }

    let (parser, detector): (Arc<dyn AnswerKeyParser>, Arc<dyn BulkNameDetector>) =
        if settings.ai().mock {
            tracing::warn!("OPENAI_MOCK is set; using canned inference responses");
            (Arc::new(MockAnswerKeyParser), Arc::new(MockNameDetector))
        } else {
            let client = Arc::new(OpenAiVisionClient::from_settings(&settings)?);
            (client.clone(), client)
        };

    let backends = Backends {
        key_store: Arc::new(PgExamKeyStore::new(db_pool.clone(), storage.clone())),
        bulk_store: Arc::new(PgBulkUploadStore::new(db_pool.clone(), storage)),
        parser,
        detector,
    };
    let state = AppState::new(settings, db_pool, backends);

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "SuperMarks API listening"
    );

    axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await?;

    Ok(())
}
