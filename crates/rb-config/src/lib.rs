// Relaybox Config - Broker and retry-policy configuration
//
// Loads `AmqpConfig` from environment variables or a TOML file and validates
// it hard at startup: a missing required field is fatal, never a silent
// default.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reconnect attempts before the connection manager gives up.
pub const DEFAULT_MAX_RECONNECT_TRIES: u32 = 3;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required AMQP configuration fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl From<ConfigError> for rb_common::RelayboxError {
    fn from(err: ConfigError) -> Self {
        rb_common::RelayboxError::Config(err.to_string())
    }
}

// ============================================================================
// AmqpConfig
// ============================================================================

/// Everything the messaging layer needs: broker endpoint, topology names,
/// and the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// Broker endpoint, `amqp://` or `amqps://`.
    pub dsn: String,
    pub username: String,
    pub password: String,
    /// Identity of this application; stamps retries and scopes which
    /// redeliveries this instance processes.
    pub app_name: String,

    /// Broadcast exchange for outbound publishes.
    pub fanout_exchange: String,
    /// Direct exchange for retry and dead-letter routing.
    pub direct_exchange: String,
    /// Queue this application consumes from.
    pub primary_queue: String,
    /// Holding queue for delayed retries.
    pub retry_queue: String,
    /// Binding key routing into the retry queue.
    pub retry_binding_key: String,
    /// Binding key routing into the dead-letter destination; also names the
    /// error queue.
    pub error_binding_key: String,

    /// AMQP heartbeat, seconds.
    pub heartbeat_interval: u16,
    /// Broker-mediated (delayed) retries before a message is dead-lettered.
    pub delayed_retries_number: u32,
    /// Extra in-process handler attempts per delivery.
    pub immediate_retries_number: u32,
    /// How long a message parks in the retry queue, milliseconds.
    pub retry_queue_message_ttl: u32,

    /// Consumer prefetch; zero means unlimited.
    pub consume_message_limit: u16,
    /// Outbox records fetched per relay cycle; zero means no cap.
    pub dispatch_message_limit: u32,

    /// Connection attempts before `connect()` fails for good.
    pub max_reconnect_tries: u32,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            fanout_exchange: String::new(),
            direct_exchange: String::new(),
            primary_queue: String::new(),
            retry_queue: String::new(),
            retry_binding_key: String::new(),
            error_binding_key: String::new(),
            heartbeat_interval: 0,
            delayed_retries_number: 0,
            immediate_retries_number: 0,
            retry_queue_message_ttl: 0,
            consume_message_limit: 0,
            dispatch_message_limit: 0,
            max_reconnect_tries: DEFAULT_MAX_RECONNECT_TRIES,
        }
    }
}

impl AmqpConfig {
    /// Check the required set: every string field non-empty, every policy
    /// numeric non-zero. The consume and dispatch limits are exempt since
    /// zero is a meaningful value for both (unlimited prefetch, uncapped
    /// fetch).
    ///
    /// All offenders are collected and reported in one error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing: Vec<String> = Vec::new();

        let required_strings = [
            ("dsn", &self.dsn),
            ("username", &self.username),
            ("password", &self.password),
            ("app_name", &self.app_name),
            ("fanout_exchange", &self.fanout_exchange),
            ("direct_exchange", &self.direct_exchange),
            ("primary_queue", &self.primary_queue),
            ("retry_queue", &self.retry_queue),
            ("retry_binding_key", &self.retry_binding_key),
            ("error_binding_key", &self.error_binding_key),
        ];
        for (name, value) in required_strings {
            if value.trim().is_empty() {
                missing.push(name.to_string());
            }
        }

        if self.heartbeat_interval == 0 {
            missing.push("heartbeat_interval".to_string());
        }
        if self.delayed_retries_number == 0 {
            missing.push("delayed_retries_number".to_string());
        }
        if self.immediate_retries_number == 0 {
            missing.push("immediate_retries_number".to_string());
        }
        if self.retry_queue_message_ttl == 0 {
            missing.push("retry_queue_message_ttl".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields(missing))
        }
    }

    /// Load from `RB_*` environment variables and validate.
    ///
    /// Absent variables surface through validation as missing fields;
    /// present-but-unparsable numerics fail immediately naming the variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            dsn: env_string("RB_DSN"),
            username: env_string("RB_USERNAME"),
            password: env_string("RB_PASSWORD"),
            app_name: env_string("RB_APP_NAME"),
            fanout_exchange: env_string("RB_FANOUT_EXCHANGE"),
            direct_exchange: env_string("RB_DIRECT_EXCHANGE"),
            primary_queue: env_string("RB_PRIMARY_QUEUE"),
            retry_queue: env_string("RB_RETRY_QUEUE"),
            retry_binding_key: env_string("RB_RETRY_BINDING_KEY"),
            error_binding_key: env_string("RB_ERROR_BINDING_KEY"),
            heartbeat_interval: env_number("RB_HEARTBEAT_INTERVAL")?,
            delayed_retries_number: env_number("RB_DELAYED_RETRIES")?,
            immediate_retries_number: env_number("RB_IMMEDIATE_RETRIES")?,
            retry_queue_message_ttl: env_number("RB_RETRY_QUEUE_MESSAGE_TTL")?,
            consume_message_limit: env_number("RB_CONSUME_MESSAGE_LIMIT")?,
            dispatch_message_limit: env_number("RB_DISPATCH_MESSAGE_LIMIT")?,
            max_reconnect_tries: env_number_or(
                "RB_MAX_RECONNECT_TRIES",
                DEFAULT_MAX_RECONNECT_TRIES,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Env helpers
// ============================================================================

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_number<T>(name: &str) -> Result<T, ConfigError>
where
    T: FromStr + Default,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(T::default()),
    }
}

fn env_number_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

// ============================================================================
// Tests
// ============================================================================
