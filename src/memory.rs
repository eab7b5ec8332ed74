// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! [`MemoryBroker`] implements [`Broker`] without a server. It follows the
//! AMQP 0-9-1 model closely enough to exercise the messaging layer end to
//! end: exchange routing (direct, topic, fanout, headers and
//! exchange-to-exchange bindings), declaration equivalence checks, mandatory
//! returns, publisher confirms, prefetch-bounded round-robin delivery,
//! requeue and dead-lettering.
//!
//! Delayed exchanges route immediately and message TTLs are not enforced.

use crate::{
    broker::{
        Acknowledger, Broker, Confirmation, Connector, InboundDelivery, OutboundMessage,
        PendingConfirm, PublishOptions, PublishOutcome, ReturnedMessage, Subscription,
        SubscriptionSpec,
    },
    config::InstanceConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{HeaderValue, Headers},
    queue::{
        BindingDefinition, DestinationType, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH,
    },
    topology::{Declarable, DeclareOutcome},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reply code of a mandatory message without any matching queue.
pub const REPLY_NO_ROUTE: u16 = 312;

const DEFAULT_EXCHANGE: &str = "";
const HEADERS_MATCH: &str = "x-match";
const HEADER_FIRST_DEATH_QUEUE: &str = "x-first-death-queue";
const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";
const HEADER_FIRST_DEATH_EXCHANGE: &str = "x-first-death-exchange";

/// A message held by a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

struct Unacked {
    consumer_tag: String,
    message: StoredMessage,
}

struct MemoryConsumer {
    tag: String,
    prefetch: usize,
    no_ack: bool,
    in_flight: usize,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

impl MemoryConsumer {
    fn has_capacity(&self) -> bool {
        self.no_ack || self.prefetch == 0 || self.in_flight < self.prefetch
    }
}

struct MemoryQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
}

impl MemoryQueue {
    fn new(def: QueueDefinition) -> MemoryQueue {
        MemoryQueue {
            def,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn argument_str(&self, key: &str) -> Option<String> {
        self.def.arguments().get(key).and_then(Value::as_str).map(str::to_owned)
    }

    /// Returns unacked messages of `consumer_tag` (or of everyone) to the head of the queue.
    fn recover(&mut self, consumer_tag: Option<&str>) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| consumer_tag.map_or(true, |tag| entry.consumer_tag == tag))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));

        for tag in tags {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<BindingDefinition>,
    next_tag: u64,
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> Result<MutexGuard<'_, State>, AmqpError> {
    state
        .lock()
        .map_err(|_| AmqpError::InternalError("memory broker lock poisoned".to_owned()))
}

/// Broker instance living in the current process.
pub struct MemoryBroker {
    name: String,
    state: SharedState,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn new(name: &str) -> MemoryBroker {
        MemoryBroker {
            name: name.to_owned(),
            state: Arc::new(Mutex::new(State::default())),
            connected: AtomicBool::new(true),
        }
    }

    /// Consumers are dropped and their unacked messages become ready again,
    /// flagged as redelivered.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        if let Ok(mut state) = lock(&self.state) {
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
                queue.recover(None);
            }
        }

        warn!(instance = self.name, "memory broker disconnected");
    }

    fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        debug!(instance = self.name, "memory broker reconnected");
    }

    /// Messages ready for delivery in `queue`.
    pub fn message_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or_default()
    }

    /// Messages delivered from `queue` and not settled yet.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .ok()
            .and_then(|state| state.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or_default()
    }

    /// Copies of the ready messages of `queue`, head first.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        lock(&self.state)
            .ok()
            .and_then(|state| {
                state
                    .queues
                    .get(queue)
                    .map(|q| q.ready.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state)
            .map(|state| state.queues.contains_key(name))
            .unwrap_or_default()
    }

    fn ensure_connected(&self) -> Result<(), AmqpError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ConnectionError(format!(
                "instance `{}` is disconnected",
                self.name
            )))
        }
    }
}

fn declare_exchange(state: &mut State, def: &ExchangeDefinition) -> DeclareOutcome {
    if def.name().is_empty() || def.name().starts_with("amq.") {
        return DeclareOutcome::Conflict(format!(
            "ACCESS_REFUSED - exchange name '{}' is reserved",
            def.name()
        ));
    }

    match state.exchanges.get(def.name()) {
        Some(existing) if existing != def => DeclareOutcome::Conflict(format!(
            "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
            def.name()
        )),
        Some(_) => DeclareOutcome::Declared,
        None => {
            state.exchanges.insert(def.name().to_owned(), def.clone());
            DeclareOutcome::Declared
        }
    }
}

fn declare_queue(state: &mut State, def: &QueueDefinition) -> DeclareOutcome {
    match state.queues.get(def.name()) {
        Some(existing) if existing.def != *def => DeclareOutcome::Conflict(format!(
            "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
            def.name()
        )),
        Some(_) => DeclareOutcome::Declared,
        None => {
            state
                .queues
                .insert(def.name().to_owned(), MemoryQueue::new(def.clone()));
            DeclareOutcome::Declared
        }
    }
}

fn declare_binding(state: &mut State, def: &BindingDefinition) -> DeclareOutcome {
    if !state.exchanges.contains_key(def.source()) {
        return DeclareOutcome::Conflict(format!("NOT_FOUND - no exchange '{}'", def.source()));
    }

    let destination_exists = match def.destination_type() {
        DestinationType::Queue => state.queues.contains_key(def.destination()),
        DestinationType::Exchange => state.exchanges.contains_key(def.destination()),
    };

    if !destination_exists {
        return DeclareOutcome::Conflict(format!(
            "NOT_FOUND - no {} '{}'",
            def.destination_type(),
            def.destination()
        ));
    }

    if !state.bindings.contains(def) {
        state.bindings.push(def.clone());
    }

    DeclareOutcome::Declared
}

/// Matches an AMQP topic pattern: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();

    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

fn header_equals(expected: &Value, actual: &HeaderValue) -> bool {
    match (expected, actual) {
        (Value::String(e), HeaderValue::String(a)) => e == a,
        (Value::Bool(e), HeaderValue::Bool(a)) => e == a,
        (Value::Number(e), HeaderValue::Int(a)) => e.as_i64() == Some(*a),
        (Value::Number(e), HeaderValue::Float(a)) => e.as_f64() == Some(*a),
        _ => false,
    }
}

fn headers_match(binding: &BindingDefinition, headers: &Headers) -> bool {
    let match_any = binding
        .arguments()
        .get(HEADERS_MATCH)
        .and_then(Value::as_str)
        .map(|mode| mode.eq_ignore_ascii_case("any"))
        .unwrap_or(false);

    let mut criteria = binding
        .arguments()
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .map(|(key, expected)| {
            headers
                .get(key)
                .map(|actual| header_equals(expected, actual))
                .unwrap_or(false)
        });

    if match_any {
        criteria.any(|matched| matched)
    } else {
        criteria.all(|matched| matched)
    }
}

fn binding_matches(
    kind: ExchangeKind,
    binding: &BindingDefinition,
    routing_key: &str,
    headers: &Headers,
) -> bool {
    match kind {
        ExchangeKind::Direct => binding.key() == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding.key(), routing_key),
        ExchangeKind::Headers => headers_match(binding, headers),
    }
}

/// Resolves the queues a message reaches. Fails on an unknown exchange.
fn route(
    state: &State,
    exchange: &str,
    routing_key: &str,
    headers: &Headers,
) -> Result<BTreeSet<String>, String> {
    let mut queues = BTreeSet::new();

    if exchange == DEFAULT_EXCHANGE {
        if state.queues.contains_key(routing_key) {
            queues.insert(routing_key.to_owned());
        }
        return Ok(queues);
    }

    if !state.exchanges.contains_key(exchange) {
        return Err(format!("NOT_FOUND - no exchange '{}'", exchange));
    }

    let mut visited = HashSet::new();
    let mut pending = vec![exchange.to_owned()];

    while let Some(current) = pending.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }

        let Some(def) = state.exchanges.get(&current) else {
            continue;
        };

        for binding in state.bindings.iter().filter(|b| b.source() == current) {
            if !binding_matches(def.exchange_kind(), binding, routing_key, headers) {
                continue;
            }

            match binding.destination_type() {
                DestinationType::Queue => {
                    queues.insert(binding.destination().to_owned());
                }
                DestinationType::Exchange => pending.push(binding.destination().to_owned()),
            }
        }
    }

    Ok(queues)
}

fn enqueue(shared: &SharedState, state: &mut State, queue: &str, message: StoredMessage) {
    let mut overflow = Vec::new();

    if let Some(q) = state.queues.get_mut(queue) {
        q.ready.push_back(message);

        let max_length = q
            .def
            .arguments()
            .get(AMQP_HEADERS_MAX_LENGTH)
            .and_then(Value::as_u64);

        if let Some(max) = max_length {
            while q.ready.len() as u64 > max {
                if let Some(dropped) = q.ready.pop_front() {
                    overflow.push(dropped);
                }
            }
        }
    }

    for dropped in overflow {
        dead_letter(shared, state, queue, dropped, "maxlen");
    }

    dispatch(shared, state, queue);
}

/// Republishes a message through the dead-letter exchange of `queue`, if any.
fn dead_letter(
    shared: &SharedState,
    state: &mut State,
    queue: &str,
    mut message: StoredMessage,
    reason: &str,
) {
    let Some(q) = state.queues.get(queue) else {
        return;
    };

    let Some(exchange) = q.argument_str(AMQP_HEADERS_DEAD_LETTER_EXCHANGE) else {
        debug!(queue = queue, reason = reason, "message dropped, no dead-letter exchange");
        return;
    };

    let routing_key = q
        .argument_str(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
        .unwrap_or_else(|| message.routing_key.clone());

    let origin = message.exchange.clone();
    message
        .headers
        .entry(HEADER_FIRST_DEATH_QUEUE.to_owned())
        .or_insert_with(|| HeaderValue::from(queue));
    message
        .headers
        .entry(HEADER_FIRST_DEATH_REASON.to_owned())
        .or_insert_with(|| HeaderValue::from(reason));
    message
        .headers
        .entry(HEADER_FIRST_DEATH_EXCHANGE.to_owned())
        .or_insert_with(|| HeaderValue::from(origin));
    message.exchange = exchange.clone();
    message.routing_key = routing_key.clone();
    message.redelivered = false;

    match route(state, &exchange, &routing_key, &message.headers) {
        Ok(targets) => {
            debug!(queue = queue, exchange = exchange, reason = reason, "message dead-lettered");
            for target in targets {
                enqueue(shared, state, &target, message.clone());
            }
        }
        Err(cause) => warn!(queue = queue, cause = cause, "dead-letter exchange unavailable"),
    }
}

/// Hands ready messages to consumers with free prefetch slots, round-robin.
fn dispatch(shared: &SharedState, state: &mut State, queue: &str) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        if q.ready.is_empty() || q.consumers.is_empty() {
            return;
        }

        let count = q.consumers.len();
        let Some(idx) = (0..count)
            .map(|offset| (q.cursor + offset) % count)
            .find(|&idx| q.consumers[idx].has_capacity())
        else {
            return;
        };

        let Some(message) = q.ready.pop_front() else {
            return;
        };

        let tag = state.next_tag;
        state.next_tag += 1;

        let delivery = InboundDelivery {
            queue: queue.to_owned(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            acker: Arc::new(MemoryAcker {
                state: shared.clone(),
                queue: queue.to_owned(),
                tag,
            }),
        };

        q.cursor = (idx + 1) % count;

        if q.consumers[idx].tx.send(delivery).is_err() {
            q.consumers.remove(idx);
            q.cursor = 0;
            q.ready.push_front(message);
            continue;
        }

        let consumer = &mut q.consumers[idx];
        if !consumer.no_ack {
            consumer.in_flight += 1;
            let consumer_tag = consumer.tag.clone();
            q.unacked.insert(tag, Unacked { consumer_tag, message });
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, item: &Declarable) -> DeclareOutcome {
        if let Err(err) = self.ensure_connected() {
            return DeclareOutcome::TransientFailure(err.to_string());
        }

        let mut state = match lock(&self.state) {
            Ok(state) => state,
            Err(err) => return DeclareOutcome::TransientFailure(err.to_string()),
        };

        match item {
            Declarable::Exchange(def) => declare_exchange(&mut state, def),
            Declarable::Queue(def) => declare_queue(&mut state, def),
            Declarable::Binding(def) => declare_binding(&mut state, def),
        }
    }

    async fn publish(
        &self,
        message: OutboundMessage,
        options: PublishOptions,
    ) -> Result<PendingConfirm, AmqpError> {
        self.ensure_connected()?;
        let mut state = lock(&self.state)?;

        let confirmed = |confirmation: Confirmation| {
            if options.confirm {
                confirmation
            } else {
                Confirmation::NotRequested
            }
        };

        let routed = route(
            &state,
            &message.exchange,
            &message.routing_key,
            &message.headers,
        );

        let outcome = match routed {
            Err(cause) => PublishOutcome {
                confirmation: confirmed(Confirmation::Nack(cause)),
                returned: None,
            },
            Ok(targets) => {
                let returned = (targets.is_empty() && options.mandatory).then(|| ReturnedMessage {
                    reply_code: REPLY_NO_ROUTE,
                    reply_text: "NO_ROUTE".to_owned(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    message_id: message.message_id.clone(),
                });

                let stored = StoredMessage {
                    exchange: message.exchange,
                    routing_key: message.routing_key,
                    message_id: Some(message.message_id).filter(|id| !id.is_empty()),
                    correlation_id: message.correlation_id,
                    headers: message.headers,
                    payload: message.payload,
                    redelivered: false,
                };

                for target in targets {
                    enqueue(&self.state, &mut state, &target, stored.clone());
                }

                PublishOutcome {
                    confirmation: confirmed(Confirmation::Ack),
                    returned,
                }
            }
        };

        Ok(Box::pin(async move { outcome }))
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Box<dyn Subscription>, AmqpError> {
        self.ensure_connected()?;
        let mut state = lock(&self.state)?;

        let queue = state
            .queues
            .get_mut(&spec.queue)
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(spec.queue.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        queue.consumers.push(MemoryConsumer {
            tag: spec.consumer_tag.clone(),
            prefetch: spec.prefetch as usize,
            no_ack: spec.no_ack,
            in_flight: 0,
            tx,
        });

        dispatch(&self.state, &mut state, &spec.queue);

        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            queue: spec.queue.clone(),
            consumer_tag: spec.consumer_tag.clone(),
            rx,
            cancelled: false,
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.disconnect();
        Ok(())
    }
}

struct MemorySubscription {
    state: SharedState,
    queue: String,
    consumer_tag: String,
    rx: mpsc::UnboundedReceiver<InboundDelivery>,
    cancelled: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<InboundDelivery, AmqpError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn cancel(&mut self) -> Result<(), AmqpError> {
        {
            let mut state = lock(&self.state)?;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.consumers.retain(|c| c.tag != self.consumer_tag);
            }
        }

        self.rx.close();
        self.cancelled = true;

        // Deliveries buffered but never handed out go back to the queue.
        let mut buffered = Vec::new();
        while let Ok(delivery) = self.rx.try_recv() {
            buffered.push(delivery);
        }

        for delivery in buffered.into_iter().rev() {
            if delivery.acker.nack(true).await.is_ok() {
                continue;
            }

            let mut state = lock(&self.state)?;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.ready.push_front(StoredMessage {
                    exchange: delivery.exchange,
                    routing_key: delivery.routing_key,
                    message_id: delivery.message_id,
                    correlation_id: delivery.correlation_id,
                    headers: delivery.headers,
                    payload: delivery.payload,
                    redelivered: true,
                });
            }
            dispatch(&self.state, &mut state, &self.queue);
        }

        Ok(())
    }
}

/// Dropping a subscription that was not cancelled behaves like a closed
/// channel: its unacked messages are requeued.
impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.consumers.retain(|c| c.tag != self.consumer_tag);
                if !self.cancelled {
                    queue.recover(Some(&self.consumer_tag));
                }
            }
            dispatch(&self.state, &mut state, &self.queue);
        }
    }
}

struct MemoryAcker {
    state: SharedState,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), AmqpError> {
        let mut state = lock(&self.state)?;

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| AmqpError::ConsumerError(self.queue.clone()))?;

        let entry = queue.unacked.remove(&self.tag).ok_or(match requeue {
            None => AmqpError::AckMessageError,
            Some(_) => AmqpError::NackMessageError,
        })?;

        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == entry.consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match requeue {
            None => {}
            Some(true) => {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Some(false) => dead_letter(
                &self.state,
                &mut state,
                &self.queue,
                entry.message,
                "rejected",
            ),
        }

        dispatch(&self.state, &mut state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(Some(requeue))
    }
}

/// Hands out one [`MemoryBroker`] per instance name.
///
/// Brokers outlive registries built on the same connector, so a second
/// registry sees the topology declared by the first one.
#[derive(Default)]
pub struct MemoryConnector {
    brokers: Mutex<HashMap<String, Arc<MemoryBroker>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MemoryConnector {
    pub fn new() -> MemoryConnector {
        MemoryConnector::default()
    }

    /// Makes connecting to `name` fail as if no broker were listening.
    pub fn unreachable(self, name: &str) -> Self {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            unreachable.insert(name.to_owned());
        }
        self
    }

    pub fn broker(&self, name: &str) -> Option<Arc<MemoryBroker>> {
        self.brokers
            .lock()
            .ok()
            .and_then(|brokers| brokers.get(name).cloned())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        name: &str,
        cfg: &InstanceConfig,
    ) -> Result<Arc<dyn Broker>, AmqpError> {
        let unreachable = self
            .unreachable
            .lock()
            .map(|set| set.contains(name))
            .unwrap_or_default();

        if unreachable {
            return Err(AmqpError::ConnectionError(format!(
                "connection refused by {}",
                cfg.connection.addresses.join(",")
            )));
        }

        let mut brokers = self
            .brokers
            .lock()
            .map_err(|_| AmqpError::InternalError("memory connector lock poisoned".to_owned()))?;

        let broker = brokers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemoryBroker::new(name)))
            .clone();
        broker.reconnect();

        Ok(broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declare_all(broker: &MemoryBroker, items: Vec<Declarable>) {
        for item in items {
            assert_eq!(broker.declare(&item).await, DeclareOutcome::Declared, "{:?}", item);
        }
    }

    fn message(exchange: &str, routing_key: &str) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: b"{}".to_vec(),
            message_id: "m-1".to_owned(),
            ..OutboundMessage::default()
        }
    }

    const CONFIRMED: PublishOptions = PublishOptions {
        mandatory: true,
        confirm: true,
    };

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("#.eu", "order.created.eu"));
        assert!(topic_matches("*.created.*", "order.created.eu"));
        assert!(!topic_matches("order.created", "order.updated"));
        assert!(topic_matches("#", "anything.at.all"));
    }

    #[tokio::test]
    async fn redeclaration_with_other_settings_conflicts() {
        let broker = MemoryBroker::new("default");
        let orders = ExchangeDefinition::new("orders.topic").topic().durable();

        declare_all(&broker, vec![Declarable::Exchange(orders.clone())]).await;
        assert_eq!(
            broker.declare(&Declarable::Exchange(orders)).await,
            DeclareOutcome::Declared
        );

        let outcome = broker
            .declare(&Declarable::Exchange(ExchangeDefinition::new("orders.topic").topic()))
            .await;
        assert!(matches!(outcome, DeclareOutcome::Conflict(_)));

        let outcome = broker
            .declare(&Declarable::Binding(
                BindingDefinition::new("missing.q").exchange("orders.topic"),
            ))
            .await;
        assert!(matches!(outcome, DeclareOutcome::Conflict(_)));
    }

    #[tokio::test]
    async fn unroutable_mandatory_message_is_returned() {
        let broker = MemoryBroker::new("default");
        declare_all(
            &broker,
            vec![
                Declarable::Exchange(ExchangeDefinition::new("orders.topic").topic()),
                Declarable::Queue(QueueDefinition::new("orders.q")),
                Declarable::Binding(
                    BindingDefinition::new("orders.q")
                        .exchange("orders.topic")
                        .routing_key("order.*"),
                ),
            ],
        )
        .await;

        let outcome = broker
            .publish(message("orders.topic", "invoice.created"), CONFIRMED)
            .await
            .unwrap()
            .await;

        assert_eq!(outcome.confirmation, Confirmation::Ack);
        let returned = outcome.returned.unwrap();
        assert_eq!(returned.reply_code, REPLY_NO_ROUTE);
        assert_eq!(returned.reply_text, "NO_ROUTE");
        assert_eq!(broker.message_count("orders.q"), 0);

        let outcome = broker
            .publish(message("orders.topic", "order.created"), CONFIRMED)
            .await
            .unwrap()
            .await;
        assert_eq!(outcome.returned, None);
        assert_eq!(broker.message_count("orders.q"), 1);

        let outcome = broker
            .publish(message("missing", "order.created"), CONFIRMED)
            .await
            .unwrap()
            .await;
        assert!(matches!(outcome.confirmation, Confirmation::Nack(_)));
    }

    #[tokio::test]
    async fn exchange_to_exchange_and_headers_routing() {
        let broker = MemoryBroker::new("default");
        declare_all(
            &broker,
            vec![
                Declarable::Exchange(ExchangeDefinition::new("events").fanout()),
                Declarable::Exchange(ExchangeDefinition::new("audit").kind(ExchangeKind::Headers)),
                Declarable::Queue(QueueDefinition::new("audit.eu")),
                Declarable::Binding(
                    BindingDefinition::new("audit")
                        .exchange("events")
                        .to_exchange(),
                ),
                Declarable::Binding(
                    BindingDefinition::new("audit.eu")
                        .exchange("audit")
                        .param(HEADERS_MATCH, Value::from("all"))
                        .param("region", Value::from("eu")),
                ),
            ],
        )
        .await;

        let mut eu = message("events", "");
        eu.headers.insert("region".to_owned(), HeaderValue::from("eu"));
        let mut us = message("events", "");
        us.headers.insert("region".to_owned(), HeaderValue::from("us"));

        broker.publish(eu, CONFIRMED).await.unwrap().await;
        broker.publish(us, CONFIRMED).await.unwrap().await;

        assert_eq!(broker.message_count("audit.eu"), 1);
    }

    #[tokio::test]
    async fn rejected_message_is_dead_lettered() {
        let broker = MemoryBroker::new("default");
        declare_all(
            &broker,
            vec![
                Declarable::Exchange(ExchangeDefinition::new("orders.dlx").fanout()),
                Declarable::Queue(QueueDefinition::new("orders.dlq")),
                Declarable::Queue(
                    QueueDefinition::new("orders.q").dead_letter_exchange("orders.dlx"),
                ),
                Declarable::Binding(BindingDefinition::new("orders.dlq").exchange("orders.dlx")),
            ],
        )
        .await;

        broker
            .publish(message("", "orders.q"), CONFIRMED)
            .await
            .unwrap()
            .await;

        let mut subscription = broker
            .subscribe(&SubscriptionSpec {
                queue: "orders.q".to_owned(),
                consumer_tag: "c-1".to_owned(),
                prefetch: 1,
                no_ack: false,
            })
            .await
            .unwrap();

        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("orders.q"), 1);

        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.unacked_count("orders.q"), 0);
        let dead = broker.ready_messages("orders.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].headers.get(HEADER_FIRST_DEATH_QUEUE),
            Some(&HeaderValue::from("orders.q"))
        );
        assert_eq!(delivery.acker.ack().await, Err(AmqpError::AckMessageError));
    }

    fn spec(queue: &str, tag: &str, prefetch: u16) -> SubscriptionSpec {
        SubscriptionSpec {
            queue: queue.to_owned(),
            consumer_tag: tag.to_owned(),
            prefetch,
            no_ack: false,
        }
    }

    #[tokio::test]
    async fn dropped_subscription_requeues_unacked_but_cancelled_one_does_not() {
        let broker = MemoryBroker::new("default");
        declare_all(&broker, vec![Declarable::Queue(QueueDefinition::new("jobs"))]).await;

        for _ in 0..2 {
            broker.publish(message("", "jobs"), CONFIRMED).await.unwrap().await;
        }

        let mut dropped = broker.subscribe(&spec("jobs", "c-1", 1)).await.unwrap();
        let _lost = dropped.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("jobs"), 1);
        drop(dropped);

        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.message_count("jobs"), 2);
        assert!(broker.ready_messages("jobs")[0].redelivered);

        let mut cancelled = broker.subscribe(&spec("jobs", "c-2", 1)).await.unwrap();
        let in_flight = cancelled.next().await.unwrap().unwrap();
        cancelled.cancel().await.unwrap();
        drop(cancelled);

        assert_eq!(broker.unacked_count("jobs"), 1);
        in_flight.acker.ack().await.unwrap();
        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.message_count("jobs"), 1);
    }

    #[tokio::test]
    async fn prefetch_bounds_deliveries_and_requeue_redelivers() {
        let broker = MemoryBroker::new("default");
        declare_all(&broker, vec![Declarable::Queue(QueueDefinition::new("jobs"))]).await;

        for _ in 0..3 {
            broker.publish(message("", "jobs"), CONFIRMED).await.unwrap().await;
        }

        let mut subscription = broker
            .subscribe(&SubscriptionSpec {
                queue: "jobs".to_owned(),
                consumer_tag: "c-1".to_owned(),
                prefetch: 2,
                no_ack: false,
            })
            .await
            .unwrap();

        let first = subscription.next().await.unwrap().unwrap();
        let _second = subscription.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("jobs"), 2);
        assert_eq!(broker.message_count("jobs"), 1);

        first.acker.nack(true).await.unwrap();

        let redelivered = subscription.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(broker.message_count("jobs"), 1);
    }
}
