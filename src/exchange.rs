// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides types for defining broker exchanges. Exchanges are the
//! routing objects that decide which queues receive a published message. An
//! `ExchangeDefinition` is built from configuration (see [`ExchangeDefinition::from_decl`])
//! or assembled with its builder methods.

use crate::{
    config::{Arguments, ExchangeDecl},
    errors::AmqpError,
};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Exchange type provided by the delayed message plugin
pub const AMQP_DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";

/// Represents the types of exchanges available in the broker.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "headers" => Ok(ExchangeKind::Headers),
            _ => Err(AmqpError::UnsupportedExchangeType(raw.to_owned())),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// The builder methods mirror the options accepted by `exchange.declare`.
/// A delayed exchange keeps its routing kind in `kind` and is declared as
/// `x-delayed-message` with the kind carried in the `x-delayed-type` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) delayed: bool,
    pub(crate) params: Arguments,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            delayed: false,
            params: Arguments::new(),
        }
    }

    /// Builds a definition from a configuration entry.
    ///
    /// Fails with `UnsupportedExchangeType` before anything reaches the broker.
    pub fn from_decl(name: &str, decl: &ExchangeDecl) -> Result<ExchangeDefinition, AmqpError> {
        let mut def = ExchangeDefinition::new(name)
            .kind(decl.kind.parse()?)
            .params(decl.arguments.clone());

        def.durable = decl.durable;
        def.auto_delete = decl.auto_delete;
        def.internal = decl.internal;

        if decl.delayed {
            def = def.delayed();
        }

        Ok(def)
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Declares the exchange through the delayed message plugin.
    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self.params.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            Value::String(self.kind.as_str().to_owned()),
        );
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

    /// Sets the exchange to auto-delete when its last binding is removed.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn arguments(&self) -> &Arguments {
        &self.params
    }

    /// The exchange type sent to the broker.
    pub fn lapin_kind(&self) -> lapin::ExchangeKind {
        if self.delayed {
            lapin::ExchangeKind::Custom(AMQP_DELAYED_EXCHANGE_KIND.to_owned())
        } else {
            self.kind.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_is_case_insensitive() {
        assert_eq!("TOPIC".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!("Fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!(
            "x-consistent-hash".parse::<ExchangeKind>(),
            Err(AmqpError::UnsupportedExchangeType("x-consistent-hash".to_owned()))
        );
    }

    #[test]
    fn decl_flags_are_carried_over() {
        let decl = ExchangeDecl {
            kind: "direct".to_owned(),
            durable: false,
            auto_delete: true,
            internal: true,
            ..ExchangeDecl::default()
        };

        let def = ExchangeDefinition::from_decl("audit", &decl).unwrap();

        assert_eq!(def.exchange_kind(), ExchangeKind::Direct);
        assert!(!def.is_durable());
        assert!(def.is_auto_delete());
        assert!(def.is_internal());
        assert_eq!(def.lapin_kind(), lapin::ExchangeKind::Direct);
    }

    #[test]
    fn delayed_exchange_uses_plugin_kind() {
        let decl = ExchangeDecl {
            kind: "topic".to_owned(),
            delayed: true,
            ..ExchangeDecl::default()
        };

        let def = ExchangeDefinition::from_decl("orders.delayed", &decl).unwrap();

        assert_eq!(
            def.lapin_kind(),
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert_eq!(
            def.arguments().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&Value::String("topic".to_owned()))
        );
    }
}
