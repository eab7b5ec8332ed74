// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Configuration
//!
//! Serde model of the configuration document. The top level describes the
//! implicit default instance; `instances` holds any number of fully independent
//! broker instances sharing the same process. Keys are camelCase, durations are
//! expressed in milliseconds and the heartbeat in seconds.
//!
//! ```json
//! {
//!   "connection": { "addresses": "rabbit-1:5672,rabbit-2:5672", "virtualHost": "/" },
//!   "exchanges": { "orders.topic": { "type": "topic" } },
//!   "queues": { "orders.q": { "deadLetterExchange": "orders.dlx" } },
//!   "bindings": {
//!     "orders": { "exchange": "orders.topic", "destination": "orders.q", "routingKey": "order.*" }
//!   },
//!   "instances": { "billing": { "connection": { "addresses": "billing-mq:5672" } } }
//! }
//! ```

use crate::errors::AmqpError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, path::Path, str::FromStr, time::Duration};

/// Name under which the implicit top-level instance is registered.
pub const DEFAULT_INSTANCE: &str = "default";

/// Default AMQP port.
pub const AMQP_PORT: u16 = 5672;
/// Default AMQPS port.
pub const AMQPS_PORT: u16 = 5671;

/// Free-form `x-` arguments attached to a declaration.
pub type Arguments = BTreeMap<String, Value>;

/// The whole configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    pub connection: ConnectionConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub exchanges: BTreeMap<String, ExchangeDecl>,
    pub queues: BTreeMap<String, QueueDecl>,
    pub bindings: BTreeMap<String, BindingDecl>,
    pub instances: BTreeMap<String, InstanceConfig>,
}

/// One broker instance: connection, delivery policies and topology.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceConfig {
    pub connection: ConnectionConfig,
    pub publisher: PublisherConfig,
    pub consumer: ConsumerConfig,
    pub exchanges: BTreeMap<String, ExchangeDecl>,
    pub queues: BTreeMap<String, QueueDecl>,
    pub bindings: BTreeMap<String, BindingDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// One or more `host[:port]` entries, tried in order.
    #[serde(deserialize_with = "deserialize_addresses")]
    pub addresses: Vec<String>,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    /// Heartbeat interval in seconds.
    pub requested_heartbeat: u16,
    pub ssl_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            addresses: vec![format!("localhost:{}", AMQP_PORT)],
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            virtual_host: "/".to_owned(),
            requested_heartbeat: 30,
            ssl_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherConfig {
    pub confirms: bool,
    pub returns: bool,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            confirms: true,
            returns: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// How deliveries are acknowledged towards the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum AckMode {
    /// The broker considers a message acknowledged as soon as it is delivered.
    #[serde(rename = "auto", alias = "AUTO", alias = "Auto")]
    Auto,
    /// Every delivery is settled explicitly with the handler's disposition.
    #[default]
    #[serde(rename = "manual", alias = "MANUAL", alias = "Manual")]
    Manual,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => write!(f, "auto"),
            AckMode::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsumerConfig {
    pub concurrency: usize,
    pub max_concurrency: usize,
    pub prefetch: u16,
    pub acknowledge_mode: AckMode,
    pub retry: RetryPolicy,
    /// Delay between attempts to subscribe to a queue that is not available yet.
    pub recovery_interval: u64,
    /// Upper bound for in-flight handlers to finish on shutdown.
    pub shutdown_timeout: u64,
    /// Idle period after which workers above `concurrency` retire.
    pub idle_timeout: u64,
    /// Refuse listeners on queues without a dead-letter exchange while retries are on.
    pub require_dead_letter: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            concurrency: 3,
            max_concurrency: 10,
            prefetch: 50,
            acknowledge_mode: AckMode::Manual,
            retry: RetryPolicy {
                enabled: true,
                max_attempts: 3,
                initial_interval: 1000,
                multiplier: 2.0,
                max_interval: 10000,
            },
            recovery_interval: 5000,
            shutdown_timeout: 5000,
            idle_timeout: 60000,
            require_dead_letter: false,
        }
    }
}

impl ConsumerConfig {
    /// Lower and upper worker bounds, normalized so that `1 <= min <= max`.
    pub fn concurrency_bounds(&self) -> (usize, usize) {
        let min = self.concurrency.max(1);
        (min, self.max_concurrency.max(min))
    }

    pub fn effective_prefetch(&self) -> u16 {
        self.prefetch.max(1)
    }
}

/// Bounded exponential retry policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_interval: u64,
    pub multiplier: f64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_interval: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            enabled: true,
            max_attempts: 3,
            initial_interval: 500,
            multiplier: 2.0,
            max_interval: 5000,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs a single attempt.
    pub fn disabled() -> Self {
        RetryPolicy {
            enabled: false,
            ..RetryPolicy::default()
        }
    }

    /// True when a failed attempt is followed by at least one more.
    pub fn is_active(&self) -> bool {
        self.enabled && self.max_attempts > 1
    }

    /// Number of attempts actually performed, 1 when the policy is inactive.
    pub fn effective_max_attempts(&self) -> u32 {
        if self.is_active() {
            self.max_attempts
        } else {
            1
        }
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval.max(1))
    }

    pub fn effective_multiplier(&self) -> f64 {
        if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        }
    }

    /// `max(initialInterval, maxInterval)`, so a misconfigured ceiling never
    /// undercuts the first delay.
    pub fn effective_max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval.max(self.initial_interval.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeDecl {
    /// One of topic, direct, fanout, headers (case-insensitive).
    #[serde(rename = "type")]
    pub kind: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub delayed: bool,
    pub arguments: Arguments,
}

impl Default for ExchangeDecl {
    fn default() -> Self {
        ExchangeDecl {
            kind: "topic".to_owned(),
            durable: true,
            auto_delete: false,
            internal: false,
            delayed: false,
            arguments: Arguments::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueDecl {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Per-message time to live, in milliseconds.
    pub message_ttl: Option<u64>,
    pub max_length: Option<u64>,
}

impl Default for QueueDecl {
    fn default() -> Self {
        QueueDecl {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
            max_length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BindingDecl {
    /// Source exchange.
    pub exchange: String,
    pub destination: String,
    /// Either `queue` or `exchange` (case-insensitive).
    pub destination_type: String,
    pub routing_key: String,
    pub arguments: Arguments,
}

impl Default for BindingDecl {
    fn default() -> Self {
        BindingDecl {
            exchange: String::new(),
            destination: String::new(),
            destination_type: "queue".to_owned(),
            routing_key: String::new(),
            arguments: Arguments::new(),
        }
    }
}

/// A parsed `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parses `host[:port]`, falling back to `default_port` when no port is given.
    pub fn parse(raw: &str, default_port: u16) -> Result<Address, AmqpError> {
        let raw = raw.trim();
        let (host, port) = match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = u16::from_str(port.trim())
                    .map_err(|_| AmqpError::InvalidAddress(raw.to_owned()))?;
                (host.trim(), port)
            }
            None => (raw, default_port),
        };

        if host.is_empty() {
            return Err(AmqpError::InvalidAddress(raw.to_owned()));
        }

        Ok(Address {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl ConnectionConfig {
    pub fn default_port(&self) -> u16 {
        if self.ssl_enabled {
            AMQPS_PORT
        } else {
            AMQP_PORT
        }
    }

    pub fn parsed_addresses(&self) -> Result<Vec<Address>, AmqpError> {
        if self.addresses.is_empty() {
            return Err(AmqpError::MissingConnectionField("addresses".to_owned()));
        }

        self.addresses
            .iter()
            .map(|raw| Address::parse(raw, self.default_port()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        self.parsed_addresses()?;

        if self.username.trim().is_empty() {
            return Err(AmqpError::MissingConnectionField("username".to_owned()));
        }

        if self.virtual_host.trim().is_empty() {
            return Err(AmqpError::MissingConnectionField("virtualHost".to_owned()));
        }

        Ok(())
    }
}

impl InstanceConfig {
    pub fn validate(&self, name: &str) -> Result<(), AmqpError> {
        self.connection.validate()?;

        for (key, binding) in &self.bindings {
            if binding.exchange.trim().is_empty() {
                return Err(AmqpError::ConfigError(format!(
                    "binding `{}` of instance `{}` has no source exchange",
                    key, name
                )));
            }

            if binding.destination.trim().is_empty() {
                return Err(AmqpError::ConfigError(format!(
                    "binding `{}` of instance `{}` has no destination",
                    key, name
                )));
            }
        }

        Ok(())
    }
}

impl MessagingConfig {
    pub fn from_json_str(raw: &str) -> Result<MessagingConfig, AmqpError> {
        serde_json::from_str(raw).map_err(|err| AmqpError::ConfigError(err.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<MessagingConfig, AmqpError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AmqpError::ConfigError(format!("failure to read `{}`: {}", path.display(), err))
        })?;

        MessagingConfig::from_json_str(&raw)
    }

    /// The implicit instance built from the non-namespaced sections.
    pub fn default_instance(&self) -> InstanceConfig {
        InstanceConfig {
            connection: self.connection.clone(),
            publisher: self.publisher.clone(),
            consumer: self.consumer.clone(),
            exchanges: self.exchanges.clone(),
            queues: self.queues.clone(),
            bindings: self.bindings.clone(),
        }
    }

    /// Checks the top-level instance and reserves its name.
    ///
    /// Named instances are validated when they are started so a broken one
    /// does not prevent healthy ones from coming up.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.instances.contains_key(DEFAULT_INSTANCE) {
            return Err(AmqpError::ReservedInstanceName(DEFAULT_INSTANCE.to_owned()));
        }

        self.default_instance().validate(DEFAULT_INSTANCE)
    }
}

fn deserialize_addresses<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    };

    Ok(raw
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect())
}
