// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! Traits separating the messaging layer from the client library underneath.
//! `ConnectionManager` implements them over lapin, `MemoryBroker` in process.
//!
//! A publish returns a [`PendingConfirm`]: a future resolving to the broker's
//! verdict on the message. It is never awaited on the send path.

use crate::{
    config::InstanceConfig,
    errors::AmqpError,
    message::Headers,
    topology::{Declarable, DeclareOutcome},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Message handed to the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to return the message when no queue matches.
    pub mandatory: bool,
    /// Ask the broker to confirm the message.
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    /// Broker refused the message, with its cause (possibly blank).
    Nack(String),
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Mandatory message the broker could not route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
}

/// Final verdict on one published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub confirmation: Confirmation,
    pub returned: Option<ReturnedMessage>,
}

pub type PendingConfirm = BoxFuture<'static, PublishOutcome>;

/// Parameters of a consumer subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch: u16,
    /// Broker-side automatic acknowledgement.
    pub no_ack: bool,
}

/// Settles one delivery towards the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Message received from a queue.
#[derive(Clone)]
pub struct InboundDelivery {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .finish()
    }
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, `None` once the subscription is over.
    async fn next(&mut self) -> Option<Result<InboundDelivery, AmqpError>>;

    /// Stops new deliveries. Deliveries already handed out stay settleable.
    async fn cancel(&mut self) -> Result<(), AmqpError>;
}

/// One connected broker instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare(&self, item: &Declarable) -> DeclareOutcome;

    /// Hands a message to the broker. Errors only when the hand-off itself fails.
    async fn publish(
        &self,
        message: OutboundMessage,
        options: PublishOptions,
    ) -> Result<PendingConfirm, AmqpError>;

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Box<dyn Subscription>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens a broker for a named instance.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, cfg: &InstanceConfig) -> Result<Arc<dyn Broker>, AmqpError>;
}
