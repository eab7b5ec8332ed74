// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Facade
//!
//! The send-side API handed to application code. Every send serializes the
//! payload as JSON, resolves a message id, runs the interceptor chain and hands
//! the message to the instance's publisher, retrying failed hand-offs with the
//! publisher retry policy.

use crate::{
    broker::OutboundMessage,
    config::RetryPolicy,
    delivery::{ConfirmReceipt, DeliveryGuarantees},
    errors::AmqpError,
    interceptor::{Interceptors, SendContext},
    message::{HeaderValue, Headers, JSON_CONTENT_TYPE},
    publisher::RabbitMQPublisher,
    retry::ExponentialBackoff,
};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Header carrying the number of failed hand-offs before this attempt.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";

/// Send-side entry point of one instance.
#[derive(Clone)]
pub struct MessagingFacade {
    publisher: RabbitMQPublisher,
    interceptors: Interceptors,
    backoff: ExponentialBackoff,
}

impl MessagingFacade {
    pub fn new(
        publisher: RabbitMQPublisher,
        interceptors: Interceptors,
        retry: &RetryPolicy,
    ) -> MessagingFacade {
        MessagingFacade {
            publisher,
            interceptors,
            backoff: ExponentialBackoff::from(retry),
        }
    }

    pub fn instance(&self) -> &str {
        self.publisher.instance()
    }

    /// Sends `payload` as JSON.
    ///
    /// Broker confirms and returns surface only through the instance callbacks.
    pub async fn send<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        correlation_id: Option<&str>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.send_with_headers(exchange, routing_key, payload, Headers::new(), correlation_id)
            .await
    }

    pub async fn send_with_headers<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        headers: Headers,
        correlation_id: Option<&str>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serialize(payload)?;
        self.dispatch(exchange, routing_key, payload, headers, correlation_id, false)
            .await
            .map(|_| ())
    }

    /// Sends `payload` and returns a receipt resolving to the broker's verdict.
    pub async fn send_confirmed<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        headers: Headers,
        correlation_id: Option<&str>,
    ) -> Result<ConfirmReceipt, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serialize(payload)?;
        self.dispatch(exchange, routing_key, payload, headers, correlation_id, true)
            .await?
            .ok_or_else(|| AmqpError::InternalError("missing confirm receipt".to_owned()))
    }

    /// Sends an already encoded payload.
    pub async fn send_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
        correlation_id: Option<&str>,
    ) -> Result<(), AmqpError> {
        self.dispatch(exchange, routing_key, payload, headers, correlation_id, false)
            .await
            .map(|_| ())
    }

    async fn dispatch(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        headers: Headers,
        correlation_id: Option<&str>,
        with_receipt: bool,
    ) -> Result<Option<ConfirmReceipt>, AmqpError> {
        let message_id = resolve_message_id(correlation_id, &headers);
        let mut attempt = 1;

        loop {
            let mut ctx = SendContext {
                instance: self.instance().to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                payload: payload.clone(),
                headers: headers.clone(),
                attempt,
                message_id: message_id.clone(),
                correlation_id: correlation_id.map(str::to_owned),
                started_at: Instant::now(),
            };
            ctx.headers
                .entry(HEADER_RETRY_COUNT.to_owned())
                .or_insert(HeaderValue::Int(i64::from(attempt - 1)));

            for interceptor in self.interceptors.iter() {
                if let Err(err) = interceptor.before_send(&mut ctx) {
                    self.notify_error(&ctx, &err);
                    return Err(err);
                }
            }

            let (receipt, tx) = if with_receipt {
                let (receipt, tx) =
                    DeliveryGuarantees::receipt(ctx.correlation_id.as_deref().unwrap_or_default());
                (Some(receipt), Some(tx))
            } else {
                (None, None)
            };

            match self.publisher.publish(outbound(&ctx), tx).await {
                Ok(()) => {
                    for interceptor in self.interceptors.iter() {
                        interceptor.after_send(&ctx);
                    }
                    return Ok(receipt);
                }
                Err(err) => {
                    let exhausted = !self.backoff.has_next(attempt);
                    if exhausted {
                        error!(
                            instance = self.instance(),
                            attempt,
                            max_attempts = self.backoff.max_attempts(),
                            exchange = exchange,
                            routing_key = routing_key,
                            message_id = message_id,
                            error = err.to_string(),
                            "send attempt failed"
                        );
                    } else {
                        warn!(
                            instance = self.instance(),
                            attempt,
                            max_attempts = self.backoff.max_attempts(),
                            exchange = exchange,
                            routing_key = routing_key,
                            message_id = message_id,
                            error = err.to_string(),
                            "send attempt failed"
                        );
                    }

                    self.notify_error(&ctx, &err);

                    if exhausted {
                        return Err(AmqpError::PublishingError(format!(
                            "failed after {} attempts (exchange={}, routingKey={}): {}",
                            attempt, exchange, routing_key, err
                        )));
                    }

                    tokio::time::sleep(self.backoff.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn notify_error(&self, ctx: &SendContext, err: &AmqpError) {
        for interceptor in self.interceptors.iter() {
            interceptor.on_error(ctx, err);
        }
    }
}

fn serialize<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "error serializing payload");
        AmqpError::SerializePayloadError(err.to_string())
    })
}

fn outbound(ctx: &SendContext) -> OutboundMessage {
    OutboundMessage {
        exchange: ctx.exchange.clone(),
        routing_key: ctx.routing_key.clone(),
        payload: ctx.payload.clone(),
        headers: ctx.headers.clone(),
        message_id: ctx.message_id.clone(),
        correlation_id: ctx.correlation_id.clone(),
        content_type: JSON_CONTENT_TYPE.to_owned(),
    }
}

/// Caller's correlation id, else a `messageId` or `message-id` header, else a new UUID.
pub(crate) fn resolve_message_id(correlation_id: Option<&str>, headers: &Headers) -> String {
    let non_blank = |value: &&str| !value.trim().is_empty();

    correlation_id
        .filter(non_blank)
        .or_else(|| {
            headers
                .get("messageId")
                .and_then(HeaderValue::as_str)
                .filter(non_blank)
        })
        .or_else(|| {
            headers
                .get("message-id")
                .and_then(HeaderValue::as_str)
                .filter(non_blank)
        })
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Confirmation, MockBroker, PublishOutcome},
        config::PublisherConfig,
        interceptor::SendInterceptor,
    };
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    };

    #[derive(Default)]
    struct Recording {
        before: Mutex<Vec<(u32, Option<HeaderValue>)>>,
        after: AtomicU32,
        errors: AtomicU32,
    }

    impl SendInterceptor for Recording {
        fn before_send(&self, ctx: &mut SendContext) -> Result<(), AmqpError> {
            self.before
                .lock()
                .unwrap()
                .push((ctx.attempt, ctx.headers.get(HEADER_RETRY_COUNT).cloned()));
            Ok(())
        }

        fn after_send(&self, _ctx: &SendContext) {
            self.after.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _ctx: &SendContext, _err: &AmqpError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Refusing;

    impl SendInterceptor for Refusing {
        fn before_send(&self, _ctx: &mut SendContext) -> Result<(), AmqpError> {
            Err(AmqpError::InternalError("refused".to_owned()))
        }
    }

    fn facade(
        broker: MockBroker,
        interceptors: Interceptors,
        retry: RetryPolicy,
    ) -> MessagingFacade {
        let mut guarantees = DeliveryGuarantees::new("default");
        guarantees.configure(&PublisherConfig::default(), "default");

        MessagingFacade::new(
            RabbitMQPublisher::new(Arc::new(broker), guarantees),
            interceptors,
            &retry,
        )
    }

    fn acked() -> Result<crate::broker::PendingConfirm, AmqpError> {
        Ok(Box::pin(async {
            PublishOutcome {
                confirmation: Confirmation::Ack,
                returned: None,
            }
        }))
    }

    #[test]
    fn message_id_resolution_order() {
        let mut headers = Headers::new();
        headers.insert("message-id".to_owned(), HeaderValue::from("from-dash"));

        assert_eq!(resolve_message_id(Some("corr"), &headers), "corr");
        assert_eq!(resolve_message_id(Some(" "), &headers), "from-dash");

        headers.insert("messageId".to_owned(), HeaderValue::from("from-camel"));
        assert_eq!(resolve_message_id(None, &headers), "from-camel");

        let generated = resolve_message_id(None, &Headers::new());
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_hand_off_is_retried_with_retry_count_header() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut broker = MockBroker::new();
        {
            let calls = calls.clone();
            broker.expect_publish().times(2).returning(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AmqpError::ConnectionError("connection reset".to_owned()))
                } else {
                    acked()
                }
            });
        }

        let recording = Arc::new(Recording::default());
        let facade = facade(
            broker,
            Arc::new(vec![recording.clone() as Arc<dyn SendInterceptor>]),
            RetryPolicy::default(),
        );

        facade
            .send("orders.topic", "order.created", &serde_json::json!({ "id": 1 }), None)
            .await
            .unwrap();

        assert_eq!(
            *recording.before.lock().unwrap(),
            vec![(1, Some(HeaderValue::Int(0))), (2, Some(HeaderValue::Int(1)))]
        );
        assert_eq!(recording.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recording.after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_a_publishing_error() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .times(3)
            .returning(|_, _| Err(AmqpError::ConnectionError("connection reset".to_owned())));

        let facade = facade(broker, Arc::new(vec![]), RetryPolicy::default());

        let err = facade
            .send("orders.topic", "order.created", "payload", Some("c-9"))
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::PublishingError(_)));
    }

    #[tokio::test]
    async fn interceptor_errors_are_not_swallowed() {
        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let recording = Arc::new(Recording::default());
        let facade = facade(
            broker,
            Arc::new(vec![
                Arc::new(Refusing) as Arc<dyn SendInterceptor>,
                recording.clone() as Arc<dyn SendInterceptor>,
            ]),
            RetryPolicy::default(),
        );

        let err = facade
            .send("orders.topic", "order.created", "payload", None)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::InternalError("refused".to_owned()));
        assert!(recording.before.lock().unwrap().is_empty());
        assert_eq!(recording.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirmed_send_reports_the_correlation_id() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|message, _| {
                message.message_id == "order-1" && message.content_type == JSON_CONTENT_TYPE
            })
            .returning(|_, _| acked());

        let facade = facade(broker, Arc::new(vec![]), RetryPolicy::disabled());

        let receipt = facade
            .send_confirmed("orders.topic", "order.created", &1, Headers::new(), Some("order-1"))
            .await
            .unwrap();

        assert_eq!(receipt.correlation_id(), "order-1");
        let report = receipt.wait().await.unwrap();
        assert!(report.is_ack());
    }
}
