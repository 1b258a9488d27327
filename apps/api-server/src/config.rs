//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time.

use axum::http::{HeaderValue, Method};
use callback_dispatcher::RetryPolicy;
use domain::token::{DEFAULT_TOKEN_LIFETIME, MIN_SECRET_LEN};
use domain::validate::MAX_DELAY_SECONDS;
use std::env;
use std::time::Duration;

/// Placeholder secrets that must never reach production.
const KNOWN_PLACEHOLDER_SECRETS: &[&str] = &["default-key-please-change", "dev-only-secret-change-me"];

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[error("Configuration error for {field}: {message}")]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl ConfigError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Server configuration loaded from environment variables.
///
/// All fields are validated at construction time.
#[derive(Clone)]
pub struct Config {
    /// Server port (default: 3001)
    pub port: u16,
    /// HMAC key for link tokens
    pub link_secret: String,
    /// How long an unvisited link stays valid (default: 30 days)
    pub token_lifetime: Duration,
    /// Upper bound for the callback delay in seconds (default: 3600)
    pub max_delay: u32,
    /// Method used for outbound callbacks (default: POST)
    pub callback_method: Method,
    /// Attempt ceiling, backoff, and per-attempt timeout for callbacks
    pub retry: RetryPolicy,
    /// Base for generated links; derived from request headers when unset
    pub public_base_url: Option<String>,
    /// CORS allow origin
    pub cors_allow_origin: HeaderValue,
    /// Log format
    pub log_format: LogFormat,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("link_secret", &"<redacted>")
            .field("token_lifetime", &self.token_lifetime)
            .field("max_delay", &self.max_delay)
            .field("callback_method", &self.callback_method)
            .field("retry", &self.retry)
            .field("public_base_url", &self.public_base_url)
            .field("cors_allow_origin", &self.cors_allow_origin)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// Fails fast on invalid configuration.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // Port
        let port = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(3001);

        // Signing secret (SECRET_KEY accepted for older deployments)
        let link_secret = get("LINK_SECRET")
            .or_else(|| get("SECRET_KEY"))
            .ok_or_else(|| ConfigError::new("LINK_SECRET", "Required"))?;
        if link_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::new(
                "LINK_SECRET",
                format!("Must be at least {} bytes", MIN_SECRET_LEN),
            ));
        }

        // Delay bound
        let max_delay = parse_or("MAX_DELAY_SECS", get("MAX_DELAY_SECS"), MAX_DELAY_SECONDS)?;
        if !(1..=MAX_DELAY_SECONDS).contains(&max_delay) {
            return Err(ConfigError::new(
                "MAX_DELAY_SECS",
                format!("Must be between 1 and {}", MAX_DELAY_SECONDS),
            ));
        }

        // Token lifetime must outlive the longest delay
        let ttl_secs = parse_or("LINK_TTL_SECS", get("LINK_TTL_SECS"), DEFAULT_TOKEN_LIFETIME.as_secs())?;
        if ttl_secs < u64::from(max_delay) {
            return Err(ConfigError::new(
                "LINK_TTL_SECS",
                format!("Must be at least MAX_DELAY_SECS ({})", max_delay),
            ));
        }

        // Callback method
        let callback_method = match get("CALLBACK_METHOD") {
            None => Method::POST,
            Some(m) => match m.to_ascii_uppercase().as_str() {
                "GET" => Method::GET,
                "POST" => Method::POST,
                "PUT" => Method::PUT,
                "PATCH" => Method::PATCH,
                other => {
                    return Err(ConfigError::new(
                        "CALLBACK_METHOD",
                        format!("Unsupported method '{}'", other),
                    ))
                }
            },
        };

        // Retry policy
        let defaults = RetryPolicy::default();
        let max_attempts = parse_or("CALLBACK_MAX_ATTEMPTS", get("CALLBACK_MAX_ATTEMPTS"), defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::new("CALLBACK_MAX_ATTEMPTS", "Must be at least 1"));
        }
        let initial_backoff_ms = parse_or(
            "CALLBACK_INITIAL_BACKOFF_MS",
            get("CALLBACK_INITIAL_BACKOFF_MS"),
            duration_ms(defaults.initial_backoff),
        )?;
        let max_backoff_ms = parse_or(
            "CALLBACK_MAX_BACKOFF_MS",
            get("CALLBACK_MAX_BACKOFF_MS"),
            duration_ms(defaults.max_backoff),
        )?;
        if max_backoff_ms < initial_backoff_ms {
            return Err(ConfigError::new(
                "CALLBACK_MAX_BACKOFF_MS",
                "Must not be below CALLBACK_INITIAL_BACKOFF_MS",
            ));
        }
        let timeout_secs = parse_or(
            "CALLBACK_TIMEOUT_SECS",
            get("CALLBACK_TIMEOUT_SECS"),
            defaults.attempt_timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::new("CALLBACK_TIMEOUT_SECS", "Must be at least 1"));
        }
        let retry = RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            attempt_timeout: Duration::from_secs(timeout_secs),
        };

        // Public base URL
        let public_base_url = get("PUBLIC_BASE_URL").map(|s| s.trim_end_matches('/').to_string());
        if let Some(ref base) = public_base_url {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return Err(ConfigError::new(
                    "PUBLIC_BASE_URL",
                    "Must start with http:// or https://",
                ));
            }
        }

        // CORS allow origin
        let cors_origin_str = get("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".into());
        let cors_allow_origin = if cors_origin_str == "*" {
            HeaderValue::from_static("*")
        } else {
            HeaderValue::from_str(&cors_origin_str).map_err(|e| {
                ConfigError::new(
                    "CORS_ALLOW_ORIGIN",
                    format!("Invalid header value '{}': {}", cors_origin_str, e),
                )
            })?
        };

        // Log format
        let log_format = LogFormat::from_str(&get("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            port,
            link_secret,
            token_lifetime: Duration::from_secs(ttl_secs),
            max_delay,
            callback_method,
            retry,
            public_base_url,
            cors_allow_origin,
            log_format,
        })
    }

    /// Log warnings about insecure configuration.
    pub fn warn_if_insecure(&self) {
        if KNOWN_PLACEHOLDER_SECRETS.contains(&self.link_secret.as_str()) {
            tracing::warn!(
                "LINK_SECRET is a well-known placeholder: anyone can forge links. \
                 DO NOT USE IN PRODUCTION."
            );
        }
        if self.public_base_url.is_none() {
            tracing::warn!(
                "PUBLIC_BASE_URL not set: link URLs are derived from request Host / \
                 X-Forwarded-* headers."
            );
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    field: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(s) => s
            .parse()
            .map_err(|_| ConfigError::new(field, format!("Invalid number '{}'", s))),
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SECRET: &str = "config-test-secret-0123";

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::from_str("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("json"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("anything"), LogFormat::Pretty);
    }

    #[test]
    fn defaults_with_only_secret() {
        let cfg = load(&[("LINK_SECRET", SECRET)]).unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.max_delay, 3600);
        assert_eq!(cfg.token_lifetime, DEFAULT_TOKEN_LIFETIME);
        assert_eq!(cfg.callback_method, Method::POST);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.public_base_url, None);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn secret_is_required_and_checked() {
        let err = load(&[]).unwrap_err();
        assert_eq!(err.field, "LINK_SECRET");
        let err = load(&[("LINK_SECRET", "short")]).unwrap_err();
        assert_eq!(err.field, "LINK_SECRET");
        // Fallback name
        assert!(load(&[("SECRET_KEY", SECRET)]).is_ok());
    }

    #[test]
    fn secret_is_redacted_in_debug() {
        let cfg = load(&[("LINK_SECRET", SECRET)]).unwrap();
        assert!(!format!("{:?}", cfg).contains(SECRET));
    }

    #[test]
    fn delay_and_lifetime_bounds() {
        assert!(load(&[("LINK_SECRET", SECRET), ("MAX_DELAY_SECS", "0")]).is_err());
        assert!(load(&[("LINK_SECRET", SECRET), ("MAX_DELAY_SECS", "3601")]).is_err());
        let err = load(&[("LINK_SECRET", SECRET), ("LINK_TTL_SECS", "60")]).unwrap_err();
        assert_eq!(err.field, "LINK_TTL_SECS");
        let cfg = load(&[
            ("LINK_SECRET", SECRET),
            ("MAX_DELAY_SECS", "60"),
            ("LINK_TTL_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(cfg.max_delay, 60);
        assert_eq!(cfg.token_lifetime, Duration::from_secs(60));
    }

    #[test]
    fn callback_settings() {
        let cfg = load(&[
            ("LINK_SECRET", SECRET),
            ("CALLBACK_METHOD", "put"),
            ("CALLBACK_MAX_ATTEMPTS", "5"),
            ("CALLBACK_INITIAL_BACKOFF_MS", "200"),
            ("CALLBACK_MAX_BACKOFF_MS", "1000"),
            ("CALLBACK_TIMEOUT_SECS", "2"),
        ])
        .unwrap();
        assert_eq!(cfg.callback_method, Method::PUT);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(200));
        assert_eq!(cfg.retry.max_backoff, Duration::from_secs(1));
        assert_eq!(cfg.retry.attempt_timeout, Duration::from_secs(2));

        assert!(load(&[("LINK_SECRET", SECRET), ("CALLBACK_METHOD", "DELETE")]).is_err());
        assert!(load(&[("LINK_SECRET", SECRET), ("CALLBACK_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("LINK_SECRET", SECRET), ("CALLBACK_TIMEOUT_SECS", "abc")]).is_err());
        assert!(load(&[
            ("LINK_SECRET", SECRET),
            ("CALLBACK_INITIAL_BACKOFF_MS", "500"),
            ("CALLBACK_MAX_BACKOFF_MS", "100"),
        ])
        .is_err());
    }

    #[test]
    fn public_base_url_is_trimmed_and_checked() {
        let cfg = load(&[("LINK_SECRET", SECRET), ("PUBLIC_BASE_URL", "https://l.example/")]).unwrap();
        assert_eq!(cfg.public_base_url.as_deref(), Some("https://l.example"));
        assert!(load(&[("LINK_SECRET", SECRET), ("PUBLIC_BASE_URL", "l.example")]).is_err());
    }
}
