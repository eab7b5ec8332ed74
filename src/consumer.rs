// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module provides the processing of a single delivery: trace span
//! extraction, handler invocation under the retry schedule, and settlement.
//!
//! Retries are stateless and run in the worker that received the delivery.
//! When every attempt has failed the recoverer logs the queue and message id
//! and rejects the delivery without requeue, so the broker dead-letters it.

use crate::{
    broker::InboundDelivery,
    config::AckMode,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, Disposition, HandlerError},
    interceptor::HEADER_TRACE_ID,
    message::HeaderValue,
    otel,
    retry::ExponentialBackoff,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

const UNKNOWN: &str = "unknown";

/// Consumes and processes one delivery.
///
/// 1. Extracts the trace context and opens a consumer span
/// 2. Runs the handler, retrying failures with `backoff`
/// 3. Settles the delivery with the handler's disposition
/// 4. Rejects without requeue once attempts are exhausted
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    handler: &Arc<dyn ConsumerHandler>,
    backoff: &ExponentialBackoff,
    ack_mode: AckMode,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &delivery.queue);
    let message_id = delivery
        .message_id
        .clone()
        .unwrap_or_else(|| UNKNOWN.to_owned());

    debug!(
        queue = delivery.queue,
        exchange = delivery.exchange,
        message_id = message_id,
        "received"
    );

    let msg = ConsumerMessage::from(delivery);
    let mut attempt = 1;

    let result: Result<Disposition, HandlerError> = loop {
        match exec(handler, &ctx, &msg).await {
            Ok(disposition) => break Ok(disposition),
            Err(err) if backoff.has_next(attempt) => {
                let delay = backoff.delay_for(attempt);
                warn!(
                    queue = delivery.queue,
                    message_id = message_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = err.to_string(),
                    "error whiling handling msg, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => break Err(err),
        }
    };

    match result {
        Ok(disposition) => {
            debug!(queue = delivery.queue, ?disposition, "message processed");
            settle(delivery, disposition, ack_mode, &mut span).await
        }
        Err(err) => {
            error!(
                queue = delivery.queue,
                message_id = message_id,
                trace_id = trace_id(delivery, &span),
                attempts = attempt,
                error = err.to_string(),
                "retries exhausted, rejecting message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("retries exhausted"),
            });

            settle(delivery, Disposition::Reject, ack_mode, &mut span).await
        }
    }
}

/// Runs the handler, turning a panic into a failure so it follows the retry schedule.
async fn exec(
    handler: &Arc<dyn ConsumerHandler>,
    ctx: &Context,
    msg: &ConsumerMessage,
) -> Result<Disposition, HandlerError> {
    match AssertUnwindSafe(handler.exec(ctx, msg)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::failed(format!(
            "handler panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or(UNKNOWN)
}

/// Trace id of the consumer span, else the `traceId` header.
fn trace_id(delivery: &InboundDelivery, span: &BoxedSpan) -> String {
    let span_context = span.span_context();
    if span_context.is_valid() {
        return span_context.trace_id().to_string();
    }

    delivery
        .headers
        .get(HEADER_TRACE_ID)
        .and_then(HeaderValue::as_str)
        .filter(|id| !id.trim().is_empty())
        .unwrap_or(UNKNOWN)
        .to_owned()
}

async fn settle(
    delivery: &InboundDelivery,
    disposition: Disposition,
    ack_mode: AckMode,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    if ack_mode == AckMode::Auto {
        return Ok(());
    }

    let result = match disposition {
        Disposition::Ack => delivery.acker.ack().await,
        Disposition::Requeue => delivery.acker.nack(true).await,
        Disposition::Reject => delivery.acker.nack(false).await,
    };

    match &result {
        Ok(()) if disposition == Disposition::Ack => span.set_status(Status::Ok),
        Ok(()) => {}
        Err(err) => {
            error!(queue = delivery.queue, error = err.to_string(), "error whiling settling msg");
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
        }
    }

    result
}

/// Puts a delivery that will not be processed back on its queue.
pub(crate) async fn requeue(delivery: &InboundDelivery, ack_mode: AckMode) {
    if ack_mode == AckMode::Auto {
        return;
    }

    if let Err(err) = delivery.acker.nack(true).await {
        error!(queue = delivery.queue, error = err.to_string(), "error whiling requeuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::Acknowledger,
        config::RetryPolicy,
        handler::handler_fn,
        message::Headers,
    };
    use async_trait::async_trait;
    use opentelemetry::{global, trace::Tracer};
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingAcker {
        settlements: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.settlements.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            self.settlements
                .lock()
                .unwrap()
                .push(if requeue { "requeue" } else { "reject" });
            Ok(())
        }
    }

    fn delivery(acker: Arc<RecordingAcker>) -> InboundDelivery {
        InboundDelivery {
            queue: "orders.q".to_owned(),
            exchange: "orders.topic".to_owned(),
            routing_key: "order.created".to_owned(),
            redelivered: false,
            message_id: Some("m-1".to_owned()),
            correlation_id: None,
            headers: Headers::new(),
            payload: br#"{"id":1}"#.to_vec(),
            acker,
        }
    }

    fn backoff(max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff::from(&RetryPolicy {
            enabled: true,
            max_attempts,
            initial_interval: 100,
            multiplier: 2.0,
            max_interval: 1000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_runs_max_attempts_then_rejects_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_msg| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(Instant::now());
                    Err(HandlerError::failed("boom"))
                }
            })
        };
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &backoff(3),
            AckMode::Manual,
        )
        .await
        .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(110));
        assert!(
            second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(210)
        );
        assert_eq!(*acker.settlements.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test]
    async fn disabled_retry_rejects_after_a_single_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_msg| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(HandlerError::failed("boom")) }
            })
        };
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &ExponentialBackoff::from(&RetryPolicy::disabled()),
            AckMode::Manual,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*acker.settlements.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test]
    async fn disposition_drives_settlement() {
        for (disposition, expected) in [
            (Disposition::Ack, "ack"),
            (Disposition::Requeue, "requeue"),
            (Disposition::Reject, "reject"),
        ] {
            let handler = handler_fn(move |_msg| async move { Ok(disposition) });
            let acker = Arc::new(RecordingAcker::default());

            consume(
                &global::tracer("test"),
                &delivery(acker.clone()),
                &handler,
                &backoff(3),
                AckMode::Manual,
            )
            .await
            .unwrap();

            assert_eq!(*acker.settlements.lock().unwrap(), vec![expected]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_ack_never_settles() {
        let handler = handler_fn(|_msg| async { Err(HandlerError::failed("boom")) });
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &backoff(2),
            AckMode::Auto,
        )
        .await
        .unwrap();

        assert!(acker.settlements.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_rejected_like_a_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |msg: ConsumerMessage| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if !msg.data.is_empty() {
                        panic!("poison message");
                    }
                    Ok(Disposition::Ack)
                }
            })
        };
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &ExponentialBackoff::from(&RetryPolicy::disabled()),
            AckMode::Manual,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*acker.settlements.lock().unwrap(), vec!["reject"]);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_retried_before_recovery() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_msg| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        panic!("flaky dependency");
                    }
                    Ok(Disposition::Ack)
                }
            })
        };
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &backoff(3),
            AckMode::Manual,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*acker.settlements.lock().unwrap(), vec!["ack"]);
    }

    #[test]
    fn recoverer_trace_id_falls_back_to_header_then_unknown() {
        let acker = Arc::new(RecordingAcker::default());
        let span = global::tracer("test").start("orders.q");

        let mut traced = delivery(acker.clone());
        traced
            .headers
            .insert(HEADER_TRACE_ID.to_owned(), HeaderValue::from("t-42"));
        assert_eq!(trace_id(&traced, &span), "t-42");
        assert_eq!(trace_id(&delivery(acker), &span), UNKNOWN);
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_owned()), "boom");
        assert_eq!(panic_message(&42_u8), UNKNOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_recovering_on_second_attempt_is_acked() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_msg| {
                let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        Err(HandlerError::failed("transient"))
                    } else {
                        Ok(Disposition::Ack)
                    }
                }
            })
        };
        let acker = Arc::new(RecordingAcker::default());

        consume(
            &global::tracer("test"),
            &delivery(acker.clone()),
            &handler,
            &backoff(3),
            AckMode::Manual,
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*acker.settlements.lock().unwrap(), vec!["ack"]);
    }
}
