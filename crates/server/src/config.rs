//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub port: u16,
    pub instance_id: String,
    pub allowed_origins: Vec<String>,
    pub log_format: LogFormat,

    // Authentication
    pub ws_token_secret: String,

    // Upstream persistence API
    pub api_base_url: String,
    pub internal_api_secret: String,
    pub upstream_timeout: Duration,

    // Broker
    pub broker: BrokerConfig,

    // Relay behaviour
    pub heartbeat_interval: Duration,
    pub max_message_length: usize,
}

/// Cross-instance broker selected by `BROKER_URL`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerConfig {
    /// Native pub/sub (`redis://` / `rediss://`)
    Redis { url: String },
    /// Bounded list per channel behind a REST command API (`http(s)://`)
    RestList {
        url: String,
        token: String,
        poll_interval: Duration,
        capacity: usize,
    },
    /// Process-local broker (`memory://`), single instance only
    Memory,
}

impl BrokerConfig {
    pub fn transport_name(&self) -> &'static str {
        match self {
            BrokerConfig::Redis { .. } => "redis",
            BrokerConfig::RestList { .. } => "rest-list",
            BrokerConfig::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 3001)?,
            instance_id: env::var("INSTANCE_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },

            // Authentication
            ws_token_secret: {
                let secret = required("WS_TOKEN_SECRET")?;
                // Shared HMAC key for HS256 session tokens
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "WS_TOKEN_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Upstream persistence API
            api_base_url: {
                let raw = required("API_BASE_URL")?;
                Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                    name: "API_BASE_URL",
                    reason: e.to_string(),
                })?;
                raw.trim_end_matches('/').to_string()
            },
            internal_api_secret: required("INTERNAL_API_SECRET")?,
            upstream_timeout: Duration::from_millis(parse_or("UPSTREAM_TIMEOUT_MS", 10_000)?),

            // Broker
            broker: broker_from_env()?,

            // Relay behaviour
            heartbeat_interval: {
                let secs: u64 = parse_or("HEARTBEAT_INTERVAL_SECS", 30)?;
                if secs == 0 {
                    return Err(ConfigError::Invalid {
                        name: "HEARTBEAT_INTERVAL_SECS",
                        reason: "must be greater than zero".to_string(),
                    });
                }
                Duration::from_secs(secs)
            },
            max_message_length: parse_or("MAX_MESSAGE_LENGTH", 4000)?,
        })
    }

    /// Socket address the HTTP server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn broker_from_env() -> Result<BrokerConfig, ConfigError> {
    let raw = required("BROKER_URL")?;
    let url = Url::parse(&raw).map_err(|e| ConfigError::Invalid {
        name: "BROKER_URL",
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "redis" | "rediss" => Ok(BrokerConfig::Redis { url: raw }),
        "http" | "https" => {
            let poll_ms: u64 = parse_or("BROKER_POLL_INTERVAL_MS", 1000)?;
            let capacity: usize = parse_or("BROKER_LIST_CAPACITY", 100)?;
            if poll_ms == 0 || capacity == 0 {
                return Err(ConfigError::Invalid {
                    name: "BROKER_POLL_INTERVAL_MS",
                    reason: "poll interval and list capacity must be greater than zero"
                        .to_string(),
                });
            }
            Ok(BrokerConfig::RestList {
                url: raw.trim_end_matches('/').to_string(),
                token: required("BROKER_REST_TOKEN")?,
                poll_interval: Duration::from_millis(poll_ms),
                capacity,
            })
        }
        "memory" => Ok(BrokerConfig::Memory),
        other => Err(ConfigError::Invalid {
            name: "BROKER_URL",
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_or<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: &[&str] = &[
        "WS_TOKEN_SECRET",
        "INTERNAL_API_SECRET",
        "API_BASE_URL",
        "BROKER_URL",
        "BROKER_REST_TOKEN",
        "BROKER_POLL_INTERVAL_MS",
        "BROKER_LIST_CAPACITY",
        "PORT",
        "HEARTBEAT_INTERVAL_SECS",
        "INSTANCE_ID",
        "ALLOWED_ORIGINS",
    ];

    /// Helper to set required env vars for testing
    fn setup_minimal_config() {
        cleanup_config();
        env::set_var(
            "WS_TOKEN_SECRET",
            "test-token-secret-must-be-at-least-32-characters",
        );
        env::set_var("INTERNAL_API_SECRET", "internal-secret");
        env::set_var("API_BASE_URL", "http://api.internal/");
        env::set_var("BROKER_URL", "redis://localhost:6379");
    }

    /// Helper to clear env vars after tests
    fn cleanup_config() {
        for name in ALL_VARS {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_minimal_config_uses_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.listen_address(), "0.0.0.0:3001");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.api_base_url, "http://api.internal");
        assert_eq!(
            config.broker,
            BrokerConfig::Redis {
                url: "redis://localhost:6379".to_string()
            }
        );
        assert!(!config.instance_id.is_empty());
        assert!(config.allowed_origins.is_empty());

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_required_variables() {
        for name in ["WS_TOKEN_SECRET", "INTERNAL_API_SECRET", "API_BASE_URL", "BROKER_URL"] {
            setup_minimal_config();
            env::remove_var(name);
            match Config::from_env() {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, name),
                other => panic!("Expected Missing error for {}, got: {:?}", name, other),
            }
        }
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_token_secret_rejected() {
        setup_minimal_config();
        env::set_var("WS_TOKEN_SECRET", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WeakSecret(_))
        ));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_rest_broker_requires_token() {
        setup_minimal_config();
        env::set_var("BROKER_URL", "https://broker.example.com");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("BROKER_REST_TOKEN"))
        ));

        env::set_var("BROKER_REST_TOKEN", "rest-token");
        env::set_var("BROKER_POLL_INTERVAL_MS", "250");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.broker,
            BrokerConfig::RestList {
                url: "https://broker.example.com".to_string(),
                token: "rest-token".to_string(),
                poll_interval: Duration::from_millis(250),
                capacity: 100,
            }
        );
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_fatal() {
        setup_minimal_config();
        env::set_var("PORT", "not-a-port");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));

        setup_minimal_config();
        env::set_var("BROKER_URL", "kafka://broker:9092");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "BROKER_URL",
                ..
            })
        ));

        setup_minimal_config();
        env::set_var("HEARTBEAT_INTERVAL_SECS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "HEARTBEAT_INTERVAL_SECS",
                ..
            })
        ));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_allowed_origins_and_instance_id() {
        setup_minimal_config();
        env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example,");
        env::set_var("INSTANCE_ID", "relay-1");
        env::set_var("BROKER_URL", "memory://local");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.instance_id, "relay-1");
        assert_eq!(config.broker, BrokerConfig::Memory);
        cleanup_config();
    }
}
