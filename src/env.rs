use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::notification::NOTIFICATION_QUEUE;
use crate::rabbitmq::{ReconnectPolicy, MAX_RECONNECT_ATTEMPTS};

const SUPPORTED_SCHEMES: [&str; 3] = ["amqp", "amqps", "memory"];

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub rabbitmq_url: String,
    pub notification_queue: String,
    pub connection_name: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
}

fn default_connection_name() -> String {
    "notify_mq".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30000
}

impl Config {
    /// Load from the process environment after reading the env file
    /// (`.env` when `DEV_ENV=development`, `.env.prod` otherwise).
    pub fn load() -> Result<Self> {
        let env_file = match env::var("DEV_ENV").as_deref() {
            Ok("development") => ".env",
            _ => ".env.prod",
        };
        match dotenv::from_filename(env_file) {
            Ok(path) => debug!("Loaded environment from {}", path.display()),
            Err(e) => debug!("No env file {} loaded: {}", env_file, e),
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let rabbitmq_url = lookup("RABBITMQ_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| anyhow!("RABBITMQ_URL must be set"))?;

        let scheme = rabbitmq_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .unwrap_or_default();
        if !SUPPORTED_SCHEMES.contains(&scheme) {
            bail!(
                "RABBITMQ_URL must use one of the schemes {:?}",
                SUPPORTED_SCHEMES
            );
        }

        let config = Config {
            rabbitmq_url,
            notification_queue: lookup("NOTIFICATION_QUEUE")
                .unwrap_or_else(|| NOTIFICATION_QUEUE.to_string()),
            connection_name: lookup("RABBITMQ_CONNECTION_NAME")
                .unwrap_or_else(default_connection_name),
            max_reconnect_attempts: parse_or(
                &lookup,
                "RABBITMQ_MAX_RECONNECT_ATTEMPTS",
                MAX_RECONNECT_ATTEMPTS,
            )?,
            reconnect_delay_ms: parse_or(
                &lookup,
                "RABBITMQ_RECONNECT_DELAY_MS",
                default_reconnect_delay_ms(),
            )?,
            max_reconnect_delay_ms: parse_or(
                &lookup,
                "RABBITMQ_MAX_RECONNECT_DELAY_MS",
                default_max_reconnect_delay_ms(),
            )?,
        };

        if config.max_reconnect_delay_ms < config.reconnect_delay_ms {
            bail!("RABBITMQ_MAX_RECONNECT_DELAY_MS must not be below RABBITMQ_RECONNECT_DELAY_MS");
        }
        Ok(config)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, value)),
        None => Ok(default),
    }
}
