use std::sync::Arc;

use sqlx::PgPool;

use crate::core::config::Settings;
use crate::services::bulk_uploads::{BulkUploadConfig, BulkUploadService, BulkUploadStore};
use crate::services::inference::{AnswerKeyParser, BulkNameDetector};
use crate::services::key_parse::{ExamKeyStore, KeyParseConfig, KeyParseOrchestrator};

/// Persistence and inference implementations the services are built on.
pub(crate) struct Backends {
    pub(crate) key_store: Arc<dyn ExamKeyStore>,
    pub(crate) bulk_store: Arc<dyn BulkUploadStore>,
    pub(crate) parser: Arc<dyn AnswerKeyParser>,
    pub(crate) detector: Arc<dyn BulkNameDetector>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    key_store: Arc<dyn ExamKeyStore>,
    key_parse: KeyParseOrchestrator,
    bulk_uploads: BulkUploadService,
}

impl AppState {
    pub(crate) fn new(settings: Settings, db: PgPool, backends: Backends) -> Self {
        let key_parse = KeyParseOrchestrator::new(
            KeyParseConfig::from_settings(&settings),
            backends.parser,
            backends.key_store.clone(),
        );
        let bulk_uploads = BulkUploadService::new(
            BulkUploadConfig::from_settings(&settings),
            backends.detector,
            backends.bulk_store,
        );

        Self {
            inner: Arc::new(InnerState {
                settings,
                db,
                key_store: backends.key_store,
                key_parse,
                bulk_uploads,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn key_store(&self) -> &dyn ExamKeyStore {
        self.inner.key_store.as_ref()
    }

    pub(crate) fn key_parse(&self) -> &KeyParseOrchestrator {
        &self.inner.key_parse
    }

    pub(crate) fn bulk_uploads(&self) -> &BulkUploadService {
        &self.inner.bulk_uploads
    }
}
