// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through message headers,
//! extracting context from incoming messages, and creating trace spans for message processing.

use crate::message::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::borrow::Cow;

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
///
/// Implements the OpenTelemetry `Injector` and `Extractor` traits so trace
/// context travels with the message.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::String(value));
    }
}

impl Extractor for HeadersPropagator<'_> {
    /// Gets a trace context value from the message headers.
    ///
    /// Only string headers can carry context; anything else reads as absent.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the context `ctx` into `headers` with the global propagator.
pub fn inject_context(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Trace id of the current span, when there is a valid one.
pub fn current_trace_id() -> Option<String> {
    let ctx = Context::current();
    let span = ctx.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        Some(span_context.trace_id().to_string())
    } else {
        None
    }
}

/// Creates a new OpenTelemetry span for message processing.
///
/// This function extracts trace context from message headers and
/// creates a consumer span named after the queue.
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut carrier = headers.clone();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut carrier))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_keys_are_lowercased() {
        let mut headers = Headers::new();

        HeadersPropagator::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        assert_eq!(
            headers.get("traceparent"),
            Some(&HeaderValue::from("00-abc-def-01"))
        );
    }

    #[test]
    fn non_string_headers_are_not_extracted() {
        let mut headers = Headers::new();
        headers.insert("x-retry-count".to_owned(), HeaderValue::Int(1));
        headers.insert("tenantId".to_owned(), HeaderValue::from("acme"));

        let propagator = HeadersPropagator::new(&mut headers);

        assert_eq!(propagator.get("x-retry-count"), None);
        assert_eq!(propagator.get("tenantId"), Some("acme"));
        assert_eq!(propagator.keys().len(), 2);
    }

    #[test]
    fn no_active_span_means_no_trace_id() {
        assert_eq!(current_trace_id(), None);
    }
}
