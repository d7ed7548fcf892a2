//! Service Configuration
//!
//! Environment-driven configuration for the ingestion service. Every knob has a
//! default exposed as a constant so tests and callers can build a config without
//! touching the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// OAuth token endpoint, production
pub const PRODUCTION_TOKEN_URL: &str = "https://oauth.bb.com.br/oauth/token";

/// PIX API base URL, production
pub const PRODUCTION_API_URL: &str = "https://api-pix.bb.com.br/pix/v2";

/// OAuth token endpoint, sandbox
pub const SANDBOX_TOKEN_URL: &str = "https://oauth.sandbox.bb.com.br/oauth/token";

/// PIX API base URL, sandbox
pub const SANDBOX_API_URL: &str = "https://api.sandbox.bb.com.br/pix/v2";

/// Scope requested on every client-credentials exchange
pub const OAUTH_SCOPE: &str = "pix.read pix.write";

/// Default listen address for the HTTP surface
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

/// Default Redis channel for mirrored realtime events
pub const DEFAULT_REDIS_CHANNEL: &str = "pix_channel";

/// Default period of the built-in poll scheduler
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default trailing window queried on each poll cycle
pub const DEFAULT_POLL_WINDOW_MINUTES: u64 = 120;

/// Longest accepted trailing window (7 days)
pub const MAX_POLL_WINDOW_MINUTES: u64 = 7 * 24 * 60;

/// Default timeout for outbound HTTP requests
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Default SQLite file name under the data directory
pub const DEFAULT_DATABASE_FILE: &str = "pix.db";

/// Errors raised while reading configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Upstream bank environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankEnvironment {
    Production,
    Sandbox,
}

impl BankEnvironment {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "producao" | "production" | "prod" => Some(Self::Production),
            "sandbox" | "homologacao" => Some(Self::Sandbox),
            _ => None,
        }
    }

    pub fn token_url(&self) -> &'static str {
        match self {
            Self::Production => PRODUCTION_TOKEN_URL,
            Self::Sandbox => SANDBOX_TOKEN_URL,
        }
    }

    pub fn api_url(&self) -> &'static str {
        match self {
            Self::Production => PRODUCTION_API_URL,
            Self::Sandbox => SANDBOX_API_URL,
        }
    }
}

/// OAuth client-credentials settings
#[derive(Clone, Default, PartialEq)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Pre-issued token used until the first rejection
    pub seed_token: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("seed_token", &self.seed_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Received-transactions API settings
#[derive(Debug, Clone, PartialEq)]
pub struct BankApiConfig {
    pub base_url: String,
    /// Receiving PIX key; polling is refused without one
    pub pix_key: Option<String>,
    pub timeout: Duration,
}

/// Full service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub environment: BankEnvironment,
    pub oauth: OAuthConfig,
    pub bank: BankApiConfig,
    /// Shared secret for the webhook bearer check; `None` disables the check
    pub webhook_secret: Option<String>,
    pub database_path: PathBuf,
    pub redis_url: Option<String>,
    pub redis_channel: String,
    pub http_bind: String,
    /// Built-in scheduler period; `None` leaves polling to an external trigger
    pub poll_interval: Option<Duration>,
    pub poll_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let timeout = Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS);
        let environment = BankEnvironment::Production;
        Self {
            environment,
            oauth: OAuthConfig {
                token_url: environment.token_url().to_string(),
                timeout,
                ..Default::default()
            },
            bank: BankApiConfig {
                base_url: environment.api_url().to_string(),
                pix_key: None,
                timeout,
            },
            webhook_secret: None,
            database_path: default_database_path(),
            redis_url: None,
            redis_channel: DEFAULT_REDIS_CHANNEL.to_string(),
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            poll_interval: Some(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            poll_window: Duration::from_secs(DEFAULT_POLL_WINDOW_MINUTES * 60),
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Read configuration from an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            vars.get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let environment = match get("BB_ENVIRONMENT") {
            Some(value) => BankEnvironment::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                var: "BB_ENVIRONMENT",
                value,
                reason: "expected producao or sandbox".to_string(),
            })?,
            None => BankEnvironment::Production,
        };

        let timeout = Duration::from_millis(parse_u64(
            "HTTP_TIMEOUT_MS",
            get("HTTP_TIMEOUT_MS"),
            DEFAULT_HTTP_TIMEOUT_MS,
        )?);
        let poll_interval_secs = parse_u64(
            "POLL_INTERVAL_SECS",
            get("POLL_INTERVAL_SECS"),
            DEFAULT_POLL_INTERVAL_SECS,
        )?;
        let poll_window_minutes = parse_u64(
            "POLL_WINDOW_MINUTES",
            get("POLL_WINDOW_MINUTES"),
            DEFAULT_POLL_WINDOW_MINUTES,
        )?;
        if poll_window_minutes == 0 || poll_window_minutes > MAX_POLL_WINDOW_MINUTES {
            return Err(ConfigError::InvalidValue {
                var: "POLL_WINDOW_MINUTES",
                value: poll_window_minutes.to_string(),
                reason: format!("window must be between 1 and {MAX_POLL_WINDOW_MINUTES} minutes"),
            });
        }

        Ok(Self {
            environment,
            oauth: OAuthConfig {
                token_url: get("BB_TOKEN_URL").unwrap_or_else(|| environment.token_url().to_string()),
                client_id: get("BB_CLIENT_ID"),
                client_secret: get("BB_CLIENT_SECRET"),
                seed_token: get("BB_BEARER_TOKEN"),
                timeout,
            },
            bank: BankApiConfig {
                base_url: get("BB_API_URL").unwrap_or_else(|| environment.api_url().to_string()),
                pix_key: get("CHAVE_PIX"),
                timeout,
            },
            webhook_secret: get("PAINEL_SECRET"),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_database_path),
            redis_url: get("REDIS_URL"),
            redis_channel: get("REDIS_CHANNEL").unwrap_or_else(|| DEFAULT_REDIS_CHANNEL.to_string()),
            http_bind: get("HTTP_BIND").unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
            poll_interval: (poll_interval_secs > 0).then(|| Duration::from_secs(poll_interval_secs)),
            poll_window: Duration::from_secs(poll_window_minutes * 60),
        })
    }
}

fn parse_u64(var: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}

/// `<data_dir>/pixwatch/pix.db`, falling back to the working directory
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("pixwatch"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_DATABASE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ==================== Default tests ====================

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.environment, BankEnvironment::Production);
        assert_eq!(config.oauth.token_url, PRODUCTION_TOKEN_URL);
        assert_eq!(config.bank.base_url, PRODUCTION_API_URL);
        assert_eq!(config.http_bind, DEFAULT_HTTP_BIND);
        assert_eq!(config.redis_channel, DEFAULT_REDIS_CHANNEL);
        assert_eq!(config.poll_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.poll_window, Duration::from_secs(2 * 60 * 60));
        assert!(config.oauth.client_id.is_none());
        assert!(config.webhook_secret.is_none());
        assert!(config.database_path.ends_with(DEFAULT_DATABASE_FILE));
    }

    #[test]
    fn test_default_matches_empty_environment() {
        assert_eq!(Config::default(), Config::from_vars(&HashMap::new()).unwrap());
    }

    // ==================== Environment tests ====================

    #[test]
    fn test_sandbox_switches_urls() {
        let config = Config::from_vars(&vars(&[("BB_ENVIRONMENT", "sandbox")])).unwrap();
        assert_eq!(config.oauth.token_url, SANDBOX_TOKEN_URL);
        assert_eq!(config.bank.base_url, SANDBOX_API_URL);
    }

    #[test]
    fn test_explicit_urls_override_environment() {
        let config = Config::from_vars(&vars(&[
            ("BB_ENVIRONMENT", "sandbox"),
            ("BB_TOKEN_URL", "http://127.0.0.1:9000/oauth/token"),
            ("BB_API_URL", "http://127.0.0.1:9000/pix/v2"),
        ]))
        .unwrap();
        assert_eq!(config.oauth.token_url, "http://127.0.0.1:9000/oauth/token");
        assert_eq!(config.bank.base_url, "http://127.0.0.1:9000/pix/v2");
    }

    #[test]
    fn test_unknown_environment_is_rejected() {
        let err = Config::from_vars(&vars(&[("BB_ENVIRONMENT", "staging")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "BB_ENVIRONMENT", .. }));
    }

    // ==================== Credential tests ====================

    #[test]
    fn test_credentials_and_secret_are_read() {
        let config = Config::from_vars(&vars(&[
            ("BB_CLIENT_ID", "client"),
            ("BB_CLIENT_SECRET", "secret"),
            ("BB_BEARER_TOKEN", "seed"),
            ("CHAVE_PIX", "pix@example.com"),
            ("PAINEL_SECRET", "painel"),
        ]))
        .unwrap();
        assert_eq!(config.oauth.client_id.as_deref(), Some("client"));
        assert_eq!(config.oauth.client_secret.as_deref(), Some("secret"));
        assert_eq!(config.oauth.seed_token.as_deref(), Some("seed"));
        assert_eq!(config.bank.pix_key.as_deref(), Some("pix@example.com"));
        assert_eq!(config.webhook_secret.as_deref(), Some("painel"));
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let config = Config::from_vars(&vars(&[("BB_CLIENT_ID", "   "), ("PAINEL_SECRET", "")])).unwrap();
        assert!(config.oauth.client_id.is_none());
        assert!(config.webhook_secret.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_vars(&vars(&[
            ("BB_CLIENT_SECRET", "top-secret"),
            ("BB_BEARER_TOKEN", "seed-token"),
        ]))
        .unwrap();
        let printed = format!("{:?}", config.oauth);
        assert!(!printed.contains("top-secret"));
        assert!(!printed.contains("seed-token"));
        assert!(printed.contains("<redacted>"));
    }

    // ==================== Numeric tests ====================

    #[test]
    fn test_zero_poll_interval_disables_scheduler() {
        let config = Config::from_vars(&vars(&[("POLL_INTERVAL_SECS", "0")])).unwrap();
        assert_eq!(config.poll_interval, None);
    }

    #[test]
    fn test_invalid_number_names_variable() {
        let err = Config::from_vars(&vars(&[("HTTP_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("HTTP_TIMEOUT_MS"));
    }

    #[test]
    fn test_zero_poll_window_is_rejected() {
        let err = Config::from_vars(&vars(&[("POLL_WINDOW_MINUTES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "POLL_WINDOW_MINUTES", .. }));
    }

    #[test]
    fn test_oversized_poll_window_is_rejected() {
        let max = u64::MAX.to_string();
        for value in ["1000000000000", max.as_str()] {
            let err = Config::from_vars(&vars(&[("POLL_WINDOW_MINUTES", value)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { var: "POLL_WINDOW_MINUTES", .. }));
        }
    }

    #[test]
    fn test_longest_poll_window_is_accepted() {
        let longest = MAX_POLL_WINDOW_MINUTES.to_string();
        let config = Config::from_vars(&vars(&[("POLL_WINDOW_MINUTES", longest.as_str())])).unwrap();
        assert_eq!(config.poll_window, Duration::from_secs(7 * 24 * 60 * 60));
    }
}
