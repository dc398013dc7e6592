//! Topic service configuration.
//!
//! Configuration is loaded from environment variables. Every key has a
//! documented default; values that are present but unparseable or zero are
//! rejected rather than silently replaced.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default grace period before an idle topic shuts down, in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5_000;

/// Default debounce delay for user agent announcements, in milliseconds.
pub const DEFAULT_UA_DEBOUNCE_MS: u64 = 5_000;

/// Default cap on subscribers of a group topic.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 128;

/// Default cap on messages removed by one multi-range delete request.
pub const DEFAULT_MAX_DELETE_COUNT: u64 = 1_024;

/// Default capacity of a topic actor mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default capacity of a session's outbound queue.
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;

/// Default capacity of a session's detach queue.
pub const DEFAULT_SESSION_DETACH_CAPACITY: usize = 64;

/// Default lifetime of an idle long-poll session, in seconds.
pub const DEFAULT_LP_LIFETIME_SECONDS: u64 = 55;

/// Default time the hub waits for topics to acknowledge shutdown, in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 5;

/// Default server instance id prefix.
pub const DEFAULT_SERVER_ID_PREFIX: &str = "topic";

/// Topic service configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier of this server instance.
    pub server_id: String,

    /// How long a topic with no attached sessions stays alive.
    pub idle_timeout: Duration,

    /// Delay used to coalesce user agent changes before announcing them.
    pub ua_debounce: Duration,

    /// Maximum number of subscribers of a group topic.
    pub max_subscribers: usize,

    /// Maximum number of messages a multi-range delete may remove.
    pub max_delete_count: u64,

    /// Topic actor mailbox capacity.
    pub mailbox_capacity: usize,

    /// Session outbound queue capacity.
    pub session_queue_capacity: usize,

    /// Session detach queue capacity.
    pub session_detach_capacity: usize,

    /// Idle lifetime of long-poll sessions.
    pub lp_session_lifetime: Duration,

    /// How long the hub waits for topics to stop on shutdown.
    pub shutdown_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_id", &self.server_id)
            .field("idle_timeout_ms", &self.idle_timeout.as_millis())
            .field("ua_debounce_ms", &self.ua_debounce.as_millis())
            .field("max_subscribers", &self.max_subscribers)
            .field("max_delete_count", &self.max_delete_count)
            .field("mailbox_capacity", &self.mailbox_capacity)
            .field("session_queue_capacity", &self.session_queue_capacity)
            .field("session_detach_capacity", &self.session_detach_capacity)
            .field("lp_session_lifetime_s", &self.lp_session_lifetime.as_secs())
            .field("shutdown_timeout_s", &self.shutdown_timeout.as_secs())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: DEFAULT_SERVER_ID_PREFIX.to_string(),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            ua_debounce: Duration::from_millis(DEFAULT_UA_DEBOUNCE_MS),
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            max_delete_count: DEFAULT_MAX_DELETE_COUNT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            session_queue_capacity: DEFAULT_SESSION_QUEUE_CAPACITY,
            session_detach_capacity: DEFAULT_SESSION_DETACH_CAPACITY,
            lp_session_lifetime: Duration::from_secs(DEFAULT_LP_LIFETIME_SECONDS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a present variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a present variable cannot be
    /// parsed or is zero.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let idle_timeout_ms = parse_positive(vars, "TOPIC_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS)?;
        let ua_debounce_ms = parse_positive(vars, "TOPIC_UA_DEBOUNCE_MS", DEFAULT_UA_DEBOUNCE_MS)?;
        let max_subscribers =
            parse_positive(vars, "TOPIC_MAX_SUBSCRIBERS", DEFAULT_MAX_SUBSCRIBERS)?;
        let max_delete_count =
            parse_positive(vars, "TOPIC_MAX_DELETE_COUNT", DEFAULT_MAX_DELETE_COUNT)?;
        let mailbox_capacity =
            parse_positive(vars, "TOPIC_MAILBOX_CAPACITY", DEFAULT_MAILBOX_CAPACITY)?;
        let session_queue_capacity = parse_positive(
            vars,
            "SESSION_QUEUE_CAPACITY",
            DEFAULT_SESSION_QUEUE_CAPACITY,
        )?;
        let session_detach_capacity = parse_positive(
            vars,
            "SESSION_DETACH_CAPACITY",
            DEFAULT_SESSION_DETACH_CAPACITY,
        )?;
        let lp_lifetime_seconds = parse_positive(
            vars,
            "SESSION_LP_LIFETIME_SECONDS",
            DEFAULT_LP_LIFETIME_SECONDS,
        )?;
        let shutdown_timeout_seconds = parse_positive(
            vars,
            "HUB_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?;

        // Generate server instance ID
        let server_id = vars.get("SERVER_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVER_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            server_id,
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            ua_debounce: Duration::from_millis(ua_debounce_ms),
            max_subscribers,
            max_delete_count,
            mailbox_capacity,
            session_queue_capacity,
            session_detach_capacity,
            lp_session_lifetime: Duration::from_secs(lp_lifetime_seconds),
            shutdown_timeout: Duration::from_secs(shutdown_timeout_seconds),
        })
    }
}

/// Parse an optional positive number, falling back to `default` when absent.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key} must be a number")))?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{key} must be positive")));
    }
    Ok(value)
}
