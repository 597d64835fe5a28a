use std::collections::BTreeMap;
use std::env;

use super::types::{ConfigError, Environment, ModelPrice};

const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
];

pub(super) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

pub(super) fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

pub(super) fn parse_u16(field: &'static str, value: String) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_usize(field: &'static str, value: String) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidValue { field, value })
}

pub(super) fn parse_unit_interval(field: &'static str, value: String) -> Result<f64, ConfigError> {
    match value.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => Ok(parsed),
        _ => Err(ConfigError::InvalidValue { field, value }),
    }
}

/// Comma separated millisecond delays; an empty value means "no retries".
pub(super) fn parse_backoff_ms(
    field: &'static str,
    value: Option<String>,
    defaults: &[u64],
) -> Result<Vec<u64>, ConfigError> {
    let Some(raw) = value else {
        return Ok(defaults.to_vec());
    };

    if raw.trim() == "none" {
        return Ok(Vec::new());
    }

    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue { field, value: raw.clone() })
        })
        .collect()
}

pub(super) fn parse_cors_origins(value: Option<String>) -> Result<Vec<String>, ConfigError> {
    let Some(raw) = value else {
        return Ok(default_cors_origins());
    };

    if raw.trim().is_empty() {
        return Ok(default_cors_origins());
    }

    if raw.trim_start().starts_with('[') {
        let parsed: Vec<String> =
            serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidCors(raw.clone()))?;
        if parsed.is_empty() {
            return Ok(default_cors_origins());
        }
        return Ok(parsed);
    }

    let items: Vec<String> = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() {
        return Ok(default_cors_origins());
    }

    Ok(items)
}

pub(super) fn parse_string_list(value: Option<String>, defaults: &[&str]) -> Vec<String> {
    match value {
        Some(raw) => {
            raw.split(',').map(|item| item.trim().to_string()).filter(|item| !item.is_empty()).collect()
        }
        None => defaults.iter().map(|item| item.to_string()).collect(),
    }
}

pub(super) fn parse_model_pricing(
    value: Option<String>,
    defaults: &[(&str, ModelPrice)],
) -> Result<BTreeMap<String, ModelPrice>, ConfigError> {
    let mut pricing: BTreeMap<String, ModelPrice> =
        defaults.iter().map(|(model, price)| (model.to_string(), *price)).collect();

    if let Some(raw) = value {
        let overrides: BTreeMap<String, ModelPrice> = serde_json::from_str(&raw)
            .map_err(|_| ConfigError::InvalidValue { field: "MODEL_PRICING", value: raw.clone() })?;
        pricing.extend(overrides);
    }

    Ok(pricing)
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

pub(super) fn parse_environment(value: Option<String>) -> Environment {
    match value.as_deref().map(|item| item.to_lowercase()) {
        Some(ref val) if val == "production" || val == "prod" => Environment::Production,
        Some(ref val) if val == "staging" => Environment::Staging,
        Some(ref val) if val == "test" || val == "testing" => Environment::Test,
        _ => Environment::Development,
    }
}

fn default_cors_origins() -> Vec<String> {
    DEFAULT_CORS_ORIGINS.iter().map(|item| item.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cors_origins_json() {
        let raw = "[\"http://a\",\"http://b\"]".to_string();
        let parsed = parse_cors_origins(Some(raw)).expect("cors json");
        assert_eq!(parsed, vec!["http://a".to_string(), "http://b".to_string()]);
    }

    #[test]
    fn parse_cors_origins_defaults_on_empty() {
        let parsed = parse_cors_origins(Some(" ".to_string())).expect("cors empty");
        assert_eq!(parsed, default_cors_origins());
    }

    #[test]
    fn parse_backoff_defaults_and_overrides() {
        assert_eq!(parse_backoff_ms("X", None, &[1000, 2000]).unwrap(), vec![1000, 2000]);
        assert_eq!(parse_backoff_ms("X", Some("250, 500".into()), &[]).unwrap(), vec![250, 500]);
        assert!(parse_backoff_ms("X", Some("none".into()), &[1]).unwrap().is_empty());
        assert!(parse_backoff_ms("X", Some("fast".into()), &[]).is_err());
    }

    #[test]
    fn parse_unit_interval_rejects_out_of_range() {
        assert_eq!(parse_unit_interval("X", "0.65".into()).unwrap(), 0.65);
        assert!(parse_unit_interval("X", "1.5".into()).is_err());
        assert!(parse_unit_interval("X", "-0.1".into()).is_err());
    }

    #[test]
    fn parse_model_pricing_merges_overrides() {
        let defaults = [("gpt-5-nano", ModelPrice { input_per_million: 0.05, output_per_million: 0.4 })];
        let raw = r#"{"gpt-5-mini": {"input_per_million": 0.25, "output_per_million": 2.0}}"#;
        let pricing = parse_model_pricing(Some(raw.to_string()), &defaults).expect("pricing");
        assert_eq!(pricing.len(), 2);
        assert_eq!(pricing["gpt-5-mini"].output_per_million, 2.0);
        assert!(parse_model_pricing(Some("{".to_string()), &defaults).is_err());
    }

    #[test]
    fn parse_environment_variants() {
        assert_eq!(parse_environment(Some("prod".to_string())), Environment::Production);
        assert_eq!(parse_environment(Some("staging".to_string())), Environment::Staging);
        assert_eq!(parse_environment(Some("testing".to_string())), Environment::Test);
        assert_eq!(parse_environment(None), Environment::Development);
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
    }
}
