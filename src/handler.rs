// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Application code receives deliveries through [`ConsumerHandler`]. A handler
//! returns the [`Disposition`] to apply to the delivery, or an error to have it
//! retried.

use crate::{broker::InboundDelivery, message::Headers};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, sync::Arc};
use thiserror::Error;

/// How a successfully handled delivery is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Ack,
    /// Put the message back on the queue.
    Requeue,
    /// Reject without requeue, dead-lettering the message.
    Reject,
}

/// Failure reported by a handler. Triggers the retry schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("failure to decode message: {0}")]
    Decode(String),

    #[error("failure to process message: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// A delivery as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub headers: Headers,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn new(queue: &str, data: &[u8], headers: Headers) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
            message_id: None,
            correlation_id: None,
            redelivered: false,
            headers,
            data: data.to_vec(),
        }
    }

    /// Decodes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.data).map_err(|err| HandlerError::Decode(err.to_string()))
    }
}

impl From<&InboundDelivery> for ConsumerMessage {
    fn from(delivery: &InboundDelivery) -> Self {
        ConsumerMessage {
            queue: delivery.queue.clone(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            message_id: delivery.message_id.clone(),
            correlation_id: delivery.correlation_id.clone(),
            redelivered: delivery.redelivered,
            headers: delivery.headers.clone(),
            data: delivery.payload.clone(),
        }
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Disposition, HandlerError>;
}

struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Disposition, HandlerError>> + Send,
{
    async fn exec(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage,
    ) -> Result<Disposition, HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Adapts an async closure into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Disposition, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _fut: PhantomData,
    })
}
