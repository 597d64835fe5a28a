use super::parsing::{
    env_optional, env_or_default, parse_backoff_ms, parse_bool, parse_cors_origins,
    parse_environment, parse_model_pricing, parse_string_list, parse_u16, parse_u64,
    parse_unit_interval, parse_usize,
};
use super::types::{
    AiSettings, ApiSettings, BulkSettings, ConfigError, CorsSettings, DatabaseSettings,
    KeyParseSettings, ModelPrice, PricingSettings, RuntimeSettings, S3Settings, ServerHost,
    ServerPort, ServerSettings, Settings, TelemetrySettings,
};

const DEFAULT_NANO_MODEL: &str = "gpt-5-nano";
const DEFAULT_MINI_MODEL: &str = "gpt-5-mini";

const DEFAULT_PRICING: &[(&str, ModelPrice)] = &[
    (DEFAULT_NANO_MODEL, ModelPrice { input_per_million: 0.05, output_per_million: 0.40 }),
    (DEFAULT_MINI_MODEL, ModelPrice { input_per_million: 0.25, output_per_million: 2.00 }),
];

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("SUPERMARKS_HOST", "0.0.0.0");
        let port = env_or_default("SUPERMARKS_PORT", "8000");

        let environment = parse_environment(
            env_optional("SUPERMARKS_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("SUPERMARKS_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "SuperMarks API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "supermarks");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "supermarks");
        let database_url = env_optional("DATABASE_URL");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let mock = env_optional("OPENAI_MOCK").map(|value| parse_bool(&value)).unwrap_or(false);
        let request_timeout_seconds =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "20"))?;

        let allowed_models = parse_string_list(
            env_optional("SUPERMARKS_KEY_PARSE_MODELS"),
            &[DEFAULT_NANO_MODEL, DEFAULT_MINI_MODEL],
        );
        let nano_model = env_or_default("KEY_PARSE_NANO_MODEL", DEFAULT_NANO_MODEL);
        let mini_model = env_or_default("KEY_PARSE_MINI_MODEL", DEFAULT_MINI_MODEL);
        let nano_backoff_ms =
            parse_backoff_ms("KEY_PARSE_NANO_BACKOFF_MS", env_optional("KEY_PARSE_NANO_BACKOFF_MS"), &[])?;
        let mini_backoff_ms = parse_backoff_ms(
            "KEY_PARSE_MINI_BACKOFF_MS",
            env_optional("KEY_PARSE_MINI_BACKOFF_MS"),
            &[1000, 2000],
        )?;
        let escalation_confidence = parse_unit_interval(
            "KEY_PARSE_ESCALATION_CONFIDENCE",
            env_or_default("KEY_PARSE_ESCALATION_CONFIDENCE", "0.60"),
        )?;
        let key_max_pages =
            parse_usize("KEY_PARSE_MAX_PAGES", env_or_default("KEY_PARSE_MAX_PAGES", "10"))?;

        let name_match_threshold = parse_unit_interval(
            "BULK_NAME_MATCH_THRESHOLD",
            env_or_default("BULK_NAME_MATCH_THRESHOLD", "0.65"),
        )?;
        let max_carry_forward_pages = parse_usize(
            "BULK_MAX_CARRY_FORWARD_PAGES",
            env_or_default("BULK_MAX_CARRY_FORWARD_PAGES", "2"),
        )?;
        let detect_escalation_confidence = parse_unit_interval(
            "BULK_DETECT_ESCALATION_CONFIDENCE",
            env_or_default("BULK_DETECT_ESCALATION_CONFIDENCE", "0.5"),
        )?;
        let bulk_max_pages =
            parse_usize("BULK_MAX_PAGES", env_or_default("BULK_MAX_PAGES", "500"))?;

        let pricing = parse_model_pricing(env_optional("MODEL_PRICING"), DEFAULT_PRICING)?;

        let s3_endpoint = env_or_default("S3_ENDPOINT", "https://s3.amazonaws.com");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "supermarks-data");
        let s3_region = env_or_default("S3_REGION", "us-east-1");

        let log_level = env_or_default("SUPERMARKS_LOG_LEVEL", "info");
        let json = env_optional("SUPERMARKS_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            ai: AiSettings { openai_api_key, openai_base_url, mock, request_timeout_seconds },
            key_parse: KeyParseSettings {
                allowed_models,
                nano_model,
                mini_model,
                nano_backoff_ms,
                mini_backoff_ms,
                escalation_confidence,
                max_pages: key_max_pages,
            },
            bulk: BulkSettings {
                name_match_threshold,
                max_carry_forward_pages,
                detect_escalation_confidence,
                max_pages: bulk_max_pages,
            },
            pricing: PricingSettings { models: pricing },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn key_parse(&self) -> &KeyParseSettings {
        &self.key_parse
    }

    pub(crate) fn bulk(&self) -> &BulkSettings {
        &self.bulk
    }

    pub(crate) fn pricing(&self) -> &PricingSettings {
        &self.pricing
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.key_parse.resolve_models()?;

        if self.key_parse.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "KEY_PARSE_MAX_PAGES",
                value: "0".to_string(),
            });
        }

        if self.bulk.max_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "BULK_MAX_PAGES",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if !self.ai.mock && self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::config::Settings;
    use crate::test_support;

    #[tokio::test]
    async fn load_uses_tier_defaults() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        let key_parse = settings.key_parse();
        assert_eq!(key_parse.nano_model, "gpt-5-nano");
        assert_eq!(key_parse.mini_model, "gpt-5-mini");
        assert!(key_parse.nano_backoff_ms.is_empty());
        assert_eq!(key_parse.mini_backoff_ms, vec![1000, 2000]);
        assert!((key_parse.escalation_confidence - 0.60).abs() < f64::EPSILON);
        assert_eq!(settings.bulk().max_carry_forward_pages, 2);
        assert!(settings.pricing().models.contains_key("gpt-5-mini"));
    }

    #[tokio::test]
    async fn load_rejects_allowlist_missing_strong_tier() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("SUPERMARKS_KEY_PARSE_MODELS", "gpt-5-nano");

        let result = Settings::load();
        std::env::remove_var("SUPERMARKS_KEY_PARSE_MODELS");

        let err = result.expect_err("allowlist without mini must fail");
        assert!(err.to_string().contains("gpt-5-mini"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn strict_mode_requires_openai_key_unless_mocked() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("SUPERMARKS_STRICT_CONFIG", "1");
        std::env::set_var("S3_ACCESS_KEY", "access");
        std::env::set_var("S3_SECRET_KEY", "secret");
        std::env::set_var("OPENAI_MOCK", "0");

        let strict = Settings::load();

        std::env::set_var("OPENAI_MOCK", "1");
        let mocked = Settings::load();

        std::env::set_var("SUPERMARKS_STRICT_CONFIG", "0");
        std::env::remove_var("S3_ACCESS_KEY");
        std::env::remove_var("S3_SECRET_KEY");

        assert!(strict.is_err());
        assert!(mocked.is_ok());
    }
}
