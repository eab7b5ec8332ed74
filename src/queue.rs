// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Definitions
//!
//! This module provides types for defining queues and the bindings that route
//! messages into them. Queue definitions support the dead-letter, TTL and
//! length-limit arguments that make retry-then-dead-letter consumption work.

use crate::{
    config::{Arguments, BindingDecl, QueueDecl},
    errors::AmqpError,
};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Definition of a queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) params: Arguments,
}

impl QueueDefinition {
    /// Creates a new queue definition with standard settings (non-durable, non-exclusive).
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            params: Arguments::new(),
        }
    }

    /// Builds a definition from a configuration entry, folding the dead-letter,
    /// TTL and length shortcuts into the argument table.
    pub fn from_decl(name: &str, decl: &QueueDecl) -> QueueDefinition {
        let mut def = QueueDefinition::new(name).params(decl.arguments.clone());
        def.durable = decl.durable;
        def.exclusive = decl.exclusive;
        def.auto_delete = decl.auto_delete;

        if let Some(exchange) = &decl.dead_letter_exchange {
            def = def.dead_letter_exchange(exchange);
            if let Some(key) = &decl.dead_letter_routing_key {
                def = def.dead_letter_routing_key(key);
            }
        }

        if let Some(ttl) = decl.message_ttl.filter(|ttl| *ttl > 0) {
            def = def.ttl(ttl);
        }

        if let Some(max) = decl.max_length.filter(|max| *max > 0) {
            def = def.max_length(max);
        }

        def
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn params(mut self, params: Arguments) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    /// Sets the message Time-To-Live in milliseconds.
    pub fn ttl(self, ttl: u64) -> Self {
        self.param(AMQP_HEADERS_MESSAGE_TTL, Value::from(ttl))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: u64) -> Self {
        self.param(AMQP_HEADERS_MAX_LENGTH, Value::from(max))
    }

    /// Rejected and expired messages are republished to `exchange`.
    pub fn dead_letter_exchange(self, exchange: &str) -> Self {
        self.param(AMQP_HEADERS_DEAD_LETTER_EXCHANGE, Value::from(exchange))
    }

    pub fn dead_letter_routing_key(self, key: &str) -> Self {
        self.param(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, Value::from(key))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn arguments(&self) -> &Arguments {
        &self.params
    }

    /// True when rejected messages have somewhere to go.
    pub fn has_dead_letter_exchange(&self) -> bool {
        self.params.contains_key(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
    }
}

/// What a binding routes into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DestinationType {
    #[default]
    Queue,
    Exchange,
}

impl FromStr for DestinationType {
    type Err = AmqpError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(DestinationType::Queue),
            "exchange" => Ok(DestinationType::Exchange),
            _ => Err(AmqpError::UnsupportedDestinationType(raw.to_owned())),
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::Queue => f.write_str("queue"),
            DestinationType::Exchange => f.write_str("exchange"),
        }
    }
}

/// Routing rule from a source exchange to a queue or another exchange.
///
/// An empty routing key matches everything on a fanout exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingDefinition {
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) destination_type: DestinationType,
    pub(crate) routing_key: String,
    pub(crate) params: Arguments,
}

impl BindingDefinition {
    /// Creates a binding of `queue` with an empty source exchange and routing key.
    pub fn new(queue: &str) -> BindingDefinition {
        BindingDefinition {
            source: String::new(),
            destination: queue.to_owned(),
            destination_type: DestinationType::Queue,
            routing_key: String::new(),
            params: Arguments::new(),
        }
    }

    pub fn from_decl(decl: &BindingDecl) -> Result<BindingDefinition, AmqpError> {
        Ok(BindingDefinition {
            source: decl.exchange.clone(),
            destination: decl.destination.clone(),
            destination_type: decl.destination_type.parse()?,
            routing_key: decl.routing_key.clone(),
            params: decl.arguments.clone(),
        })
    }

    /// Sets the exchange the binding listens on.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.source = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Turns the destination into an exchange (exchange-to-exchange binding).
    pub fn to_exchange(mut self) -> Self {
        self.destination_type = DestinationType::Exchange;
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn destination_type(&self) -> DestinationType {
        self.destination_type
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub fn arguments(&self) -> &Arguments {
        &self.params
    }
}
