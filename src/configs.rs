// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! The resolved settings the application manager is built from. Values are
//! loaded once at startup from `RABBITMQ_*` environment variables (optionally
//! layered over a configuration file), validated, and then passed around as an
//! immutable value.
//!
//! Variable names of older deployments (`RABBITMQ_PASS`,
//! `RABBITMQ_DLQ_EXCHANGE`, `RABBITMQ_MESSAGE_TTL`, ...) are still honoured
//! when the current name is not set.

use crate::{errors::AmqpError, retry::RetryPolicy};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "RABBITMQ";

/// Older variable names and the key each one sets.
const LEGACY_ENV_KEYS: [(&str, &str); 6] = [
    ("RABBITMQ_PASS", "password"),
    ("RABBITMQ_DLQ_EXCHANGE", "dead_letter_exchange"),
    ("RABBITMQ_MESSAGE_TTL", "message_ttl_ms"),
    ("RABBITMQ_INITIAL_RETRY_INTERVAL", "initial_retry_interval_ms"),
    ("RABBITMQ_MAX_RETRY_INTERVAL", "max_retry_interval_ms"),
    ("RABBITMQ_PUBLISH_CONFIRM_TIMEOUT", "publisher_confirm_timeout_ms"),
];

/// Broker, topology and retry settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RabbitMQConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub message_ttl_ms: u32,
    pub retry_count: u32,
    pub initial_retry_interval_ms: u64,
    pub max_retry_interval_ms: u64,
    pub retry_multiplier: f64,
    pub concurrent_consumers: u16,
    pub prefetch_count: u16,
    pub publisher_confirm_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub durable: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "service".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            exchange: "service-exc".to_owned(),
            dead_letter_exchange: "dlq-exc".to_owned(),
            message_ttl_ms: 30_000,
            retry_count: 3,
            initial_retry_interval_ms: 1_000,
            max_retry_interval_ms: 10_000,
            retry_multiplier: 2.0,
            concurrent_consumers: 1,
            prefetch_count: 10,
            publisher_confirm_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
            durable: true,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the settings from the environment on top of the defaults.
    pub fn load() -> Result<RabbitMQConfigs, AmqpError> {
        Self::load_from(None)
    }

    /// Loads the settings on top of the defaults
    ///
    /// # Parameters
    /// * `path` - Optional configuration file, skipped when missing
    ///
    /// # Returns
    /// The validated settings. Environment variables win over the file, and
    /// the current variable names win over the older ones.
    pub fn load_from(path: Option<&str>) -> Result<RabbitMQConfigs, AmqpError> {
        let defaults = RabbitMQConfigs::default();

        let mut builder = Config::builder()
            .set_default("app_name", defaults.app_name)
            .and_then(|b| b.set_default("host", defaults.host))
            .and_then(|b| b.set_default("port", i64::from(defaults.port)))
            .and_then(|b| b.set_default("user", defaults.user))
            .and_then(|b| b.set_default("password", defaults.password))
            .and_then(|b| b.set_default("vhost", defaults.vhost))
            .and_then(|b| b.set_default("exchange", defaults.exchange))
            .and_then(|b| b.set_default("dead_letter_exchange", defaults.dead_letter_exchange))
            .and_then(|b| b.set_default("message_ttl_ms", i64::from(defaults.message_ttl_ms)))
            .and_then(|b| b.set_default("retry_count", i64::from(defaults.retry_count)))
            .and_then(|b| {
                b.set_default(
                    "initial_retry_interval_ms",
                    defaults.initial_retry_interval_ms as i64,
                )
            })
            .and_then(|b| {
                b.set_default("max_retry_interval_ms", defaults.max_retry_interval_ms as i64)
            })
            .and_then(|b| b.set_default("retry_multiplier", defaults.retry_multiplier))
            .and_then(|b| {
                b.set_default(
                    "concurrent_consumers",
                    i64::from(defaults.concurrent_consumers),
                )
            })
            .and_then(|b| b.set_default("prefetch_count", i64::from(defaults.prefetch_count)))
            .and_then(|b| {
                b.set_default(
                    "publisher_confirm_timeout_ms",
                    defaults.publisher_confirm_timeout_ms as i64,
                )
            })
            .and_then(|b| b.set_default("connect_timeout_ms", defaults.connect_timeout_ms as i64))
            .and_then(|b| b.set_default("durable", defaults.durable))
            .map_err(|err| AmqpError::ConfigurationError(err.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let cfg: RabbitMQConfigs = with_legacy_env(builder)?
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| AmqpError::ConfigurationError(err.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the bounds every component relies on.
    pub fn validate(&self) -> Result<(), AmqpError> {
        let invalid = |msg: &str| Err(AmqpError::ConfigurationError(msg.to_owned()));

        if self.host.is_empty() {
            return invalid("host must not be empty");
        }
        if self.exchange.is_empty() {
            return invalid("exchange must not be empty");
        }
        if self.dead_letter_exchange.is_empty() {
            return invalid("dead letter exchange must not be empty");
        }
        if self.exchange == self.dead_letter_exchange {
            return invalid("exchange and dead letter exchange must differ");
        }
        if self.concurrent_consumers < 1 {
            return invalid("concurrent consumers must be >= 1");
        }
        if self.prefetch_count < 1 {
            return invalid("prefetch count must be >= 1");
        }
        if self.publisher_confirm_timeout_ms == 0 {
            return invalid("publisher confirm timeout must be > 0");
        }
        if self.connect_timeout_ms == 0 {
            return invalid("connect timeout must be > 0");
        }

        self.retry_policy().map(|_| ())
    }

    /// Backoff shared by reconnects, publishes and consumer retries.
    pub fn retry_policy(&self) -> Result<RetryPolicy, AmqpError> {
        RetryPolicy::new(
            Duration::from_millis(self.initial_retry_interval_ms),
            self.retry_multiplier,
            Duration::from_millis(self.max_retry_interval_ms),
            self.retry_count,
        )
    }

    /// Connection descriptor handed to the connector.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            vhost: self.vhost.clone(),
            connection_name: self.app_name.clone(),
        }
    }

    pub fn publisher_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.publisher_confirm_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Maps the older variable names onto their keys. A key whose current
/// variable is set is left alone.
fn with_legacy_env(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, AmqpError> {
    for (name, key) in LEGACY_ENV_KEYS {
        let current = format!("{}_{}", ENV_PREFIX, key.to_uppercase());
        if std::env::var_os(&current).is_some() {
            continue;
        }

        builder = builder
            .set_override_option(key, std::env::var(name).ok())
            .map_err(|err| AmqpError::ConfigurationError(err.to_string()))?;
    }

    Ok(builder)
}

/// Immutable broker connection descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
}

impl BrokerEndpoint {
    /// AMQP URI for the endpoint. Credentials are carried as fields, so
    /// characters such as `@`, `:` or `/` need no escaping. A leading `/` on
    /// any vhost other than the default one is dropped.
    pub fn uri(&self) -> AMQPUri {
        let vhost = if self.vhost == "/" {
            self.vhost.clone()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };

        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost,
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("vhost", &self.vhost)
            .finish()
    }
}
