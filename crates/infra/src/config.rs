//! Environment configuration.
//!
//! Providers are seeded from the `PRIMARY_API_KEY` / `SECONDARY_API_KEY`
//! credentials. Each configured provider gets the built-in model set;
//! `MODEL_CONFIG_<PROVIDER>_<MODEL>=minute,day` overrides one model's limits
//! (the value `off` disables it) and `PROVIDER_ENABLED_<PROVIDER>=false`
//! disables a provider without removing its credential.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Built-in model set every provider carries: (key, upstream name,
/// per-minute limit, per-day limit).
const DEFAULT_MODELS: &[(&str, &str, i64, i64)] = &[
    ("fast", "gpt-4o-mini", 30, 1500),
    ("deep", "gpt-4o", 10, 200),
];

/// Secrets that mean "nobody configured this".
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "secret", "default", "dev-secret"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("INTERNAL_SECRET must be set to a non-default value")]
    InsecureSecret,

    #[error("no provider credentials configured (set PRIMARY_API_KEY or SECONDARY_API_KEY)")]
    NoProviders,

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Stable id used as the rate-counter key, e.g. `primary/fast`.
    pub id: String,
    /// The name the upstream API understands.
    pub model_name: String,
    pub per_minute_limit: i64,
    pub per_day_limit: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    pub credential: String,
    pub priority: i64,
    pub enabled: bool,
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub bind_addr: String,
    pub callback_url: String,
    pub internal_secret: String,
    pub upstream_url: String,
    pub upstream_timeout: Duration,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build a config from an explicit variable map (tests pass one in
    /// instead of mutating process-global env).
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let internal_secret = match vars.get("INTERNAL_SECRET") {
            None => return Err(ConfigError::Missing("INTERNAL_SECRET")),
            Some(s) if PLACEHOLDER_SECRETS.contains(&s.trim()) => {
                return Err(ConfigError::InsecureSecret)
            }
            Some(s) => s.clone(),
        };

        let callback_url = vars
            .get("CALLBACK_URL")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .ok_or(ConfigError::Missing("CALLBACK_URL"))?;

        let providers = parse_providers(&vars)?;
        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        Ok(Self {
            database_path: string_or(&vars, "DATABASE_PATH", "briefly.db"),
            bind_addr: string_or(&vars, "BIND_ADDR", "0.0.0.0:8080"),
            callback_url,
            internal_secret,
            upstream_url: string_or(
                &vars,
                "UPSTREAM_URL",
                "https://api.openai.com/v1/chat/completions",
            ),
            upstream_timeout: Duration::from_secs(parse_or(&vars, "UPSTREAM_TIMEOUT_SECS", 60)?),
            worker_concurrency: parse_or(&vars, "WORKER_CONCURRENCY", 1_usize)?.max(1),
            poll_interval: Duration::from_millis(parse_or(&vars, "POLL_INTERVAL_MS", 1_000)?),
            stale_timeout: Duration::from_secs(60 * parse_or(&vars, "STALE_TIMEOUT_MIN", 10)?),
            providers,
        })
    }
}

fn parse_providers(vars: &HashMap<String, String>) -> Result<Vec<ProviderConfig>, ConfigError> {
    let mut providers = Vec::new();

    for (id, name, credential_key, priority) in [
        ("primary", "Primary", "PRIMARY_API_KEY", 1),
        ("secondary", "Secondary", "SECONDARY_API_KEY", 2),
    ] {
        let Some(credential) = vars.get(credential_key).filter(|s| !s.trim().is_empty()) else {
            continue;
        };

        let enabled_key = format!("PROVIDER_ENABLED_{}", id.to_uppercase());
        let enabled = match vars.get(&enabled_key).map(String::as_str) {
            None => true,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: enabled_key,
                    reason: format!("expected true/false, got '{}'", other),
                })
            }
        };

        let mut models = Vec::new();
        for (key, model_name, per_minute, per_day) in DEFAULT_MODELS {
            let override_key = format!(
                "MODEL_CONFIG_{}_{}",
                id.to_uppercase(),
                key.to_uppercase()
            );
            let model = match vars.get(&override_key).map(String::as_str) {
                None => ModelConfig {
                    id: format!("{}/{}", id, key),
                    model_name: model_name.to_string(),
                    per_minute_limit: *per_minute,
                    per_day_limit: *per_day,
                    enabled: true,
                },
                Some("off") => ModelConfig {
                    id: format!("{}/{}", id, key),
                    model_name: model_name.to_string(),
                    per_minute_limit: *per_minute,
                    per_day_limit: *per_day,
                    enabled: false,
                },
                Some(value) => {
                    let (minute, day) = parse_limits(&override_key, value)?;
                    ModelConfig {
                        id: format!("{}/{}", id, key),
                        model_name: model_name.to_string(),
                        per_minute_limit: minute,
                        per_day_limit: day,
                        enabled: true,
                    }
                }
            };
            models.push(model);
        }

        providers.push(ProviderConfig {
            id: id.to_string(),
            name: name.to_string(),
            credential: credential.clone(),
            priority,
            enabled,
            models,
        });
    }

    Ok(providers)
}

fn parse_limits(key: &str, value: &str) -> Result<(i64, i64), ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: key.to_string(),
        reason,
    };

    let (minute, day) = value
        .split_once(',')
        .ok_or_else(|| invalid("expected 'minute,day'".to_string()))?;
    let minute: i64 = minute
        .trim()
        .parse()
        .map_err(|_| invalid(format!("bad minute limit '{}'", minute)))?;
    let day: i64 = day
        .trim()
        .parse()
        .map_err(|_| invalid(format!("bad day limit '{}'", day)))?;
    if minute < 1 || day < 1 {
        return Err(invalid("limits must be at least 1".to_string()));
    }
    Ok((minute, day))
}

fn string_or(vars: &HashMap<String, String>, key: &str, default: &str) -> String {
    vars.get(key)
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("cannot parse '{}'", raw),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("INTERNAL_SECRET".to_string(), "s3cr3t-value".to_string()),
            ("CALLBACK_URL".to_string(), "http://callback.local/hook".to_string()),
            ("PRIMARY_API_KEY".to_string(), "key-1".to_string()),
        ])
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = AppConfig::from_vars(base_vars()).unwrap();

        assert_eq!(config.database_path, "briefly.db");
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.stale_timeout, Duration::from_secs(600));

        assert_eq!(config.providers.len(), 1);
        let primary = &config.providers[0];
        assert_eq!(primary.id, "primary");
        assert_eq!(primary.priority, 1);
        assert!(primary.enabled);
        assert_eq!(primary.models.len(), 2);
        assert_eq!(primary.models[0].id, "primary/fast");
        assert_eq!(primary.models[0].per_minute_limit, 30);
    }

    #[test]
    fn secret_must_be_present_and_non_default() {
        let mut vars = base_vars();
        vars.remove("INTERNAL_SECRET");
        assert!(matches!(
            AppConfig::from_vars(vars),
            Err(ConfigError::Missing("INTERNAL_SECRET"))
        ));

        let mut vars = base_vars();
        vars.insert("INTERNAL_SECRET".to_string(), "changeme".to_string());
        assert!(matches!(
            AppConfig::from_vars(vars),
            Err(ConfigError::InsecureSecret)
        ));
    }

    #[test]
    fn at_least_one_credential_is_required() {
        let mut vars = base_vars();
        vars.remove("PRIMARY_API_KEY");
        assert!(matches!(
            AppConfig::from_vars(vars),
            Err(ConfigError::NoProviders)
        ));
    }

    #[test]
    fn both_providers_seed_in_priority_order() {
        let mut vars = base_vars();
        vars.insert("SECONDARY_API_KEY".to_string(), "key-2".to_string());

        let config = AppConfig::from_vars(vars).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].id, "primary");
        assert_eq!(config.providers[0].priority, 1);
        assert_eq!(config.providers[1].id, "secondary");
        assert_eq!(config.providers[1].priority, 2);
    }

    #[test]
    fn model_limit_overrides_apply_per_provider_model_pair() {
        let mut vars = base_vars();
        vars.insert("MODEL_CONFIG_PRIMARY_FAST".to_string(), "60,3000".to_string());
        vars.insert("MODEL_CONFIG_PRIMARY_DEEP".to_string(), "off".to_string());

        let config = AppConfig::from_vars(vars).unwrap();
        let models = &config.providers[0].models;
        assert_eq!(models[0].per_minute_limit, 60);
        assert_eq!(models[0].per_day_limit, 3000);
        assert!(models[0].enabled);
        assert!(!models[1].enabled);
    }

    #[test]
    fn bad_override_values_are_rejected() {
        for bad in ["60", "x,10", "10,y", "0,10", "10,0"] {
            let mut vars = base_vars();
            vars.insert("MODEL_CONFIG_PRIMARY_FAST".to_string(), bad.to_string());
            assert!(
                matches!(AppConfig::from_vars(vars), Err(ConfigError::Invalid { .. })),
                "'{}' should be rejected",
                bad
            );
        }
    }

    #[test]
    fn provider_enable_flag_is_honored() {
        let mut vars = base_vars();
        vars.insert("PROVIDER_ENABLED_PRIMARY".to_string(), "false".to_string());

        let config = AppConfig::from_vars(vars).unwrap();
        assert!(!config.providers[0].enabled);
    }

    #[test]
    fn worker_tuning_parses_from_env() {
        let mut vars = base_vars();
        vars.insert("WORKER_CONCURRENCY".to_string(), "4".to_string());
        vars.insert("POLL_INTERVAL_MS".to_string(), "250".to_string());
        vars.insert("STALE_TIMEOUT_MIN".to_string(), "5".to_string());

        let config = AppConfig::from_vars(vars).unwrap();
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.stale_timeout, Duration::from_secs(300));
    }
}
