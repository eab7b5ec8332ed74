// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Send Interceptors
//!
//! An ordered chain of hooks run around every publish attempt. The chain is
//! built by the caller and shared read-only by every instance, so interceptors
//! keep no per-call state: whatever they need travels in [`SendContext`].

use crate::{
    errors::AmqpError,
    message::{HeaderValue, Headers},
    otel,
};
use chrono::{SecondsFormat, Utc};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    Context, KeyValue,
};
use std::{sync::Arc, time::Instant};

pub const HEADER_MESSAGE_ID: &str = "messageId";
pub const HEADER_SENT_AT: &str = "sentAt";
pub const HEADER_TRACE_ID: &str = "traceId";
pub const HEADER_TENANT_ID: &str = "tenantId";

/// Publish attempt seen by the interceptors.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub instance: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// 1-based attempt number.
    pub attempt: u32,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub started_at: Instant,
}

impl SendContext {
    /// String header, ignoring blank values.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(HeaderValue::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

/// Hook around a publish attempt.
///
/// An error from `before_send` aborts the send and reaches the caller.
pub trait SendInterceptor: Send + Sync {
    fn before_send(&self, _ctx: &mut SendContext) -> Result<(), AmqpError> {
        Ok(())
    }

    fn after_send(&self, _ctx: &SendContext) {}

    fn on_error(&self, _ctx: &SendContext, _err: &AmqpError) {}
}

/// Ordered, shared interceptor chain.
pub type Interceptors = Arc<Vec<Arc<dyn SendInterceptor>>>;

/// Fills the standard headers of an outbound message.
///
/// `messageId` and `sentAt` are only set when absent. `traceId` keeps an
/// existing value, else takes the current span's trace id, else the message
/// id. The current trace context is injected as well.
#[derive(Debug, Clone, Default)]
pub struct HeaderEnrichingInterceptor {
    tenant: Option<String>,
}

impl HeaderEnrichingInterceptor {
    pub fn new() -> HeaderEnrichingInterceptor {
        HeaderEnrichingInterceptor::default()
    }

    /// Tenant written when the message carries none.
    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = Some(tenant.to_owned());
        self
    }
}

impl SendInterceptor for HeaderEnrichingInterceptor {
    fn before_send(&self, ctx: &mut SendContext) -> Result<(), AmqpError> {
        let message_id = ctx.message_id.clone();

        ctx.headers
            .entry(HEADER_MESSAGE_ID.to_owned())
            .or_insert_with(|| HeaderValue::from(message_id.as_str()));
        ctx.headers.entry(HEADER_SENT_AT.to_owned()).or_insert_with(|| {
            HeaderValue::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        });

        if ctx.header_str(HEADER_TRACE_ID).is_none() {
            let trace_id = otel::current_trace_id().unwrap_or(message_id);
            ctx.headers
                .insert(HEADER_TRACE_ID.to_owned(), HeaderValue::from(trace_id));
        }

        if ctx.header_str(HEADER_TENANT_ID).is_none() {
            if let Some(tenant) = &self.tenant {
                ctx.headers
                    .insert(HEADER_TENANT_ID.to_owned(), HeaderValue::from(tenant.as_str()));
            }
        }

        otel::inject_context(&Context::current(), &mut ctx.headers);

        Ok(())
    }
}

/// Publish counters and latency through the global OpenTelemetry meter.
pub struct MetricsInterceptor {
    sent: Counter<u64>,
    failed: Counter<u64>,
    latency: Histogram<f64>,
}

impl MetricsInterceptor {
    pub fn new() -> MetricsInterceptor {
        let meter = global::meter("rabbitmq-instances");

        MetricsInterceptor {
            sent: meter
                .u64_counter("messaging.producer.sent")
                .with_description("messages handed to the broker")
                .build(),
            failed: meter
                .u64_counter("messaging.producer.failed")
                .with_description("publish attempts that failed")
                .build(),
            latency: meter
                .f64_histogram("messaging.producer.latency")
                .with_unit("ms")
                .build(),
        }
    }

    fn attributes(ctx: &SendContext) -> Vec<KeyValue> {
        vec![
            KeyValue::new("instance", ctx.instance.clone()),
            KeyValue::new("exchange", tag_value(&ctx.exchange)),
            KeyValue::new("routingKey", tag_value(&ctx.routing_key)),
            KeyValue::new("attempt", i64::from(ctx.attempt)),
            KeyValue::new(
                "tenantId",
                tag_value(ctx.header_str(HEADER_TENANT_ID).unwrap_or_default()),
            ),
        ]
    }

    fn record_latency(&self, ctx: &SendContext, attributes: &[KeyValue]) {
        let elapsed = ctx.started_at.elapsed().as_secs_f64() * 1000.0;
        self.latency.record(elapsed, attributes);
    }
}

impl Default for MetricsInterceptor {
    fn default() -> Self {
        MetricsInterceptor::new()
    }
}

impl SendInterceptor for MetricsInterceptor {
    fn after_send(&self, ctx: &SendContext) {
        let attributes = MetricsInterceptor::attributes(ctx);
        self.record_latency(ctx, &attributes);
        self.sent.add(1, &attributes);
    }

    fn on_error(&self, ctx: &SendContext, _err: &AmqpError) {
        let attributes = MetricsInterceptor::attributes(ctx);
        self.record_latency(ctx, &attributes);
        self.failed.add(1, &attributes);
    }
}

fn tag_value(value: &str) -> String {
    if value.trim().is_empty() {
        "unknown".to_owned()
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SendContext {
        SendContext {
            instance: "default".to_owned(),
            exchange: "orders.topic".to_owned(),
            routing_key: "order.created".to_owned(),
            payload: br#"{"id":1}"#.to_vec(),
            headers: Headers::new(),
            attempt: 1,
            message_id: "m-1".to_owned(),
            correlation_id: None,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn enrichment_fills_missing_headers() {
        let mut ctx = context();

        HeaderEnrichingInterceptor::new()
            .with_tenant("acme")
            .before_send(&mut ctx)
            .unwrap();

        assert_eq!(ctx.header_str(HEADER_MESSAGE_ID), Some("m-1"));
        assert_eq!(ctx.header_str(HEADER_TRACE_ID), Some("m-1"));
        assert_eq!(ctx.header_str(HEADER_TENANT_ID), Some("acme"));
        assert!(ctx
            .header_str(HEADER_SENT_AT)
            .is_some_and(|sent_at| chrono::DateTime::parse_from_rfc3339(sent_at).is_ok()));
    }

    #[test]
    fn enrichment_keeps_caller_headers() {
        let mut ctx = context();
        ctx.headers
            .insert(HEADER_TRACE_ID.to_owned(), HeaderValue::from("trace-from-caller"));
        ctx.headers
            .insert(HEADER_TENANT_ID.to_owned(), HeaderValue::from("globex"));
        ctx.headers
            .insert(HEADER_SENT_AT.to_owned(), HeaderValue::from("2025-01-01T00:00:00Z"));

        HeaderEnrichingInterceptor::new()
            .with_tenant("acme")
            .before_send(&mut ctx)
            .unwrap();

        assert_eq!(ctx.header_str(HEADER_TRACE_ID), Some("trace-from-caller"));
        assert_eq!(ctx.header_str(HEADER_TENANT_ID), Some("globex"));
        assert_eq!(ctx.header_str(HEADER_SENT_AT), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn blank_tags_become_unknown() {
        let mut ctx = context();
        ctx.routing_key = String::new();

        let attributes = MetricsInterceptor::attributes(&ctx);

        assert!(attributes.contains(&KeyValue::new("routingKey", "unknown")));
        assert!(attributes.contains(&KeyValue::new("tenantId", "unknown")));
        assert!(attributes.contains(&KeyValue::new("attempt", 1_i64)));
    }

    #[test]
    fn metrics_without_a_meter_provider_are_noops() {
        let interceptor = MetricsInterceptor::new();
        let ctx = context();

        interceptor.after_send(&ctx);
        interceptor.on_error(&ctx, &AmqpError::PublishingError("boom".to_owned()));
    }
}
