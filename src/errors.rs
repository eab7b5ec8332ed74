// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum covers configuration, topology, connectivity, publishing
//! and consuming failures. Delivery outcomes (nacks and returns) are never
//! represented here: they are reported through callbacks instead.

use thiserror::Error;

/// Represents errors that can occur while configuring or operating a broker instance.
///
/// Variants are grouped by the taxonomy the layer follows:
/// configuration errors are fatal at startup, connectivity errors are
/// transient and surface as temporarily unavailable operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The configuration document could not be read or parsed
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A required connection field is absent or blank
    #[error("missing required connection field `{0}`")]
    MissingConnectionField(String),

    /// A `host[:port]` entry could not be parsed
    #[error("invalid broker address `{0}`")]
    InvalidAddress(String),

    /// Exchange type outside of topic, direct, fanout and headers
    #[error("unsupported exchange type `{0}`")]
    UnsupportedExchangeType(String),

    /// Binding destination type outside of queue and exchange
    #[error("unsupported binding destination type `{0}`")]
    UnsupportedDestinationType(String),

    /// The name is reserved for the implicit default instance
    #[error("instance name `{0}` is reserved")]
    ReservedInstanceName(String),

    /// A consumed queue has no dead-letter policy while retries are enabled
    #[error("queue `{0}` has no dead-letter exchange configured")]
    MissingDeadLetter(String),

    /// The broker refused a declaration because it conflicts with existing state
    #[error("conflicting declaration of {kind} `{name}`: {details}")]
    TopologyConflict {
        kind: String,
        name: String,
        details: String,
    },

    /// The broker could not be reached while declaring topology
    #[error("failure to declare {kind} `{name}`: {cause}")]
    TopologyUnavailable {
        kind: String,
        name: String,
        cause: String,
    },

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// TLS could not be negotiated for the instance
    #[error("failure to enable tls for instance `{instance}`: {cause}")]
    TlsError { instance: String, cause: String },

    /// Error creating or configuring a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error creating a consumer on a queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Lookup of an instance that was never configured
    #[error("unknown messaging instance `{0}`")]
    UnknownInstance(String),
}

impl AmqpError {
    /// Returns true for errors caused by configuration, which retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AmqpError::ConfigError(_)
                | AmqpError::MissingConnectionField(_)
                | AmqpError::InvalidAddress(_)
                | AmqpError::UnsupportedExchangeType(_)
                | AmqpError::UnsupportedDestinationType(_)
                | AmqpError::ReservedInstanceName(_)
                | AmqpError::MissingDeadLetter(_)
                | AmqpError::TopologyConflict { .. }
                | AmqpError::TlsError { .. }
                | AmqpError::UnknownInstance(_)
        )
    }

    /// Returns true for connectivity faults that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::TopologyUnavailable { .. }
                | AmqpError::PublishingError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_configuration_errors() {
        let err = AmqpError::TopologyConflict {
            kind: "exchange".to_owned(),
            name: "orders.topic".to_owned(),
            details: "durable mismatch".to_owned(),
        };

        assert!(err.is_configuration());
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "conflicting declaration of exchange `orders.topic`: durable mismatch"
        );
    }

    #[test]
    fn unreachable_broker_is_transient() {
        let err = AmqpError::TopologyUnavailable {
            kind: "queue".to_owned(),
            name: "orders.q".to_owned(),
            cause: "connection reset".to_owned(),
        };

        assert!(err.is_transient());
        assert!(!err.is_configuration());
    }
}
