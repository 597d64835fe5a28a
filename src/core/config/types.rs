use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(super) server: ServerSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) api: ApiSettings,
    pub(super) cors: CorsSettings,
    pub(super) database: DatabaseSettings,
    pub(super) ai: AiSettings,
    pub(super) key_parse: KeyParseSettings,
    pub(super) bulk: BulkSettings,
    pub(super) pricing: PricingSettings,
    pub(super) s3: S3Settings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerSettings {
    pub(super) host: ServerHost,
    pub(super) port: ServerPort,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiSettings {
    pub(crate) project_name: String,
    pub(crate) version: String,
    pub(crate) api_v1_str: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CorsSettings {
    pub(crate) origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseSettings {
    pub(crate) postgres_server: String,
    pub(crate) postgres_port: u16,
    pub(crate) postgres_user: String,
    pub(crate) postgres_password: String,
    pub(crate) postgres_db: String,
    pub(crate) database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AiSettings {
    pub(crate) openai_api_key: String,
    pub(crate) openai_base_url: String,
    pub(crate) mock: bool,
    pub(crate) request_timeout_seconds: u64,
}

/// Answer-key parsing knobs. Model names refer to the fast ("nano") and
/// strong ("mini") tiers; both must appear in `allowed_models`.
#[derive(Debug, Clone)]
pub(crate) struct KeyParseSettings {
    pub(crate) allowed_models: Vec<String>,
    pub(crate) nano_model: String,
    pub(crate) mini_model: String,
    pub(crate) nano_backoff_ms: Vec<u64>,
    pub(crate) mini_backoff_ms: Vec<u64>,
    pub(crate) escalation_confidence: f64,
    pub(crate) max_pages: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct BulkSettings {
    pub(crate) name_match_threshold: f64,
    pub(crate) max_carry_forward_pages: usize,
    pub(crate) detect_escalation_confidence: f64,
    pub(crate) max_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub(crate) struct ModelPrice {
    pub(crate) input_per_million: f64,
    pub(crate) output_per_million: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct PricingSettings {
    pub(crate) models: BTreeMap<String, ModelPrice>,
}

#[derive(Debug, Clone)]
pub(crate) struct S3Settings {
    pub(crate) endpoint: String,
    pub(crate) access_key: String,
    pub(crate) secret_key: String,
    pub(crate) bucket: String,
    pub(crate) region: String,
}

#[derive(Debug, Clone)]
pub(crate) struct TelemetrySettings {
    pub(crate) log_level: String,
    pub(crate) json: bool,
    pub(crate) prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeSettings {
    pub(crate) environment: Environment,
    pub(crate) strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ServerHost(pub(super) String);

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerPort(pub(super) u16);

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid cors origins: {0}")]
    InvalidCors(String),
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub(crate) fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl KeyParseSettings {
    /// Returns `(nano, mini)` once both tiers are confirmed present in the allowlist.
    pub(crate) fn resolve_models(&self) -> Result<(String, String), ConfigError> {
        for model in [&self.nano_model, &self.mini_model] {
            if !self.allowed_models.iter().any(|allowed| allowed == model) {
                return Err(ConfigError::InvalidValue {
                    field: "SUPERMARKS_KEY_PARSE_MODELS",
                    value: format!("missing required model in allowlist: {model}"),
                });
            }
        }

        Ok((self.nano_model.clone(), self.mini_model.clone()))
    }
}

impl ServerHost {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }

        Ok(Self(value))
    }
}

impl ServerPort {
    pub(super) fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }

        Ok(Self(parsed))
    }
}
