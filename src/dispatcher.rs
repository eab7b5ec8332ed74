// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatcher
//!
//! This module provides handler registration keyed by queue name. Each
//! registration starts a [`ListenerContainer`]: one broker subscription feeding
//! an elastic pool of workers.
//!
//! The pool keeps `concurrency` workers alive, grows up to `maxConcurrency`
//! while every worker is busy, and retires surplus workers after
//! `idleTimeout` without work. A queue that cannot be subscribed to is retried
//! every `recoveryInterval` instead of failing the process.

use crate::{
    broker::{Broker, InboundDelivery, SubscriptionSpec},
    config::{AckMode, ConsumerConfig, RetryPolicy},
    consumer::{consume, requeue},
    errors::AmqpError,
    handler::ConsumerHandler,
    retry::ExponentialBackoff,
    topology::Declarables,
};
use futures_util::future::join_all;
use opentelemetry::global;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Listener container parameters derived from the consumer configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub prefetch: u16,
    pub ack_mode: AckMode,
    pub retry: RetryPolicy,
    pub recovery_interval: Duration,
    pub shutdown_timeout: Duration,
    pub idle_timeout: Duration,
    pub require_dead_letter: bool,
}

impl ListenerSettings {
    /// Normalizes `cfg`: `1 <= min <= max` workers and a prefetch of at least 1.
    pub fn from_config(cfg: &ConsumerConfig) -> ListenerSettings {
        let (min_workers, max_workers) = cfg.concurrency_bounds();

        ListenerSettings {
            min_workers,
            max_workers,
            prefetch: cfg.effective_prefetch(),
            ack_mode: cfg.acknowledge_mode,
            retry: cfg.retry.clone(),
            recovery_interval: Duration::from_millis(cfg.recovery_interval.max(1)),
            shutdown_timeout: Duration::from_millis(cfg.shutdown_timeout),
            idle_timeout: Duration::from_millis(cfg.idle_timeout.max(1)),
            require_dead_letter: cfg.require_dead_letter,
        }
    }
}

/// Registers handlers on the queues of one instance.
pub struct ConsumerDispatcher {
    instance: String,
    broker: Arc<dyn Broker>,
    declarables: Arc<Declarables>,
    settings: ListenerSettings,
    containers: Mutex<Vec<ListenerContainer>>,
    closed: AtomicBool,
}

impl ConsumerDispatcher {
    pub fn new(
        instance: &str,
        broker: Arc<dyn Broker>,
        declarables: Arc<Declarables>,
        settings: ListenerSettings,
    ) -> ConsumerDispatcher {
        ConsumerDispatcher {
            instance: instance.to_owned(),
            broker,
            declarables,
            settings,
            containers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// Starts consuming `queue` with `handler`.
    ///
    /// With retries enabled, a queue declared by this instance without a
    /// dead-letter exchange is refused when `requireDeadLetter` is set and
    /// reported with a warning otherwise.
    pub fn register(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ConsumerError(format!(
                "dispatcher of instance `{}` is shut down",
                self.instance
            )));
        }

        self.check_dead_letter(queue)?;

        let container = ListenerContainer::start(
            &self.instance,
            queue,
            self.broker.clone(),
            handler,
            &self.settings,
        );

        self.containers
            .lock()
            .map_err(|_| AmqpError::InternalError("dispatcher lock poisoned".to_owned()))?
            .push(container);

        info!(
            instance = self.instance,
            queue = queue,
            ack_mode = self.settings.ack_mode.to_string(),
            min_workers = self.settings.min_workers,
            max_workers = self.settings.max_workers,
            prefetch = self.settings.prefetch,
            "listener registered"
        );

        Ok(())
    }

    fn check_dead_letter(&self, queue: &str) -> Result<(), AmqpError> {
        if !self.settings.retry.is_active() {
            return Ok(());
        }

        match self.declarables.queue(queue) {
            Some(def) if !def.has_dead_letter_exchange() => {
                if self.settings.require_dead_letter {
                    error!(
                        instance = self.instance,
                        queue = queue,
                        "retries enabled on a queue without dead-letter exchange"
                    );
                    return Err(AmqpError::MissingDeadLetter(queue.to_owned()));
                }

                warn!(
                    instance = self.instance,
                    queue = queue,
                    "queue has no dead-letter exchange, exhausted messages will be dropped"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Number of registered listeners.
    pub fn listeners(&self) -> usize {
        self.containers.lock().map(|c| c.len()).unwrap_or_default()
    }

    /// Stops every listener, letting in-flight handlers finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let containers = match self.containers.lock() {
            Ok(mut containers) => std::mem::take(&mut *containers),
            Err(_) => return,
        };

        join_all(containers.into_iter().map(ListenerContainer::stop)).await;
        debug!(instance = self.instance, "listeners stopped");
    }
}

struct Shared {
    instance: String,
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    backoff: ExponentialBackoff,
    ack_mode: AckMode,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    work: AsyncMutex<mpsc::Receiver<InboundDelivery>>,
    active: AtomicUsize,
    busy: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

/// Subscription to one queue plus the workers processing its deliveries.
pub struct ListenerContainer {
    queue: String,
    shutdown: watch::Sender<bool>,
    pump: JoinHandle<()>,
    shared: Arc<Shared>,
    shutdown_timeout: Duration,
}

impl ListenerContainer {
    pub fn start(
        instance: &str,
        queue: &str,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn ConsumerHandler>,
        settings: &ListenerSettings,
    ) -> ListenerContainer {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            instance: instance.to_owned(),
            queue: queue.to_owned(),
            handler,
            backoff: ExponentialBackoff::from(&settings.retry),
            ack_mode: settings.ack_mode,
            min_workers: settings.min_workers,
            max_workers: settings.max_workers,
            idle_timeout: settings.idle_timeout,
            work: AsyncMutex::new(work_rx),
            active: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            shutdown: shutdown_rx,
        });

        for _ in 0..settings.min_workers {
            spawn_worker(&shared);
        }

        let spec = SubscriptionSpec {
            queue: queue.to_owned(),
            consumer_tag: format!("{}.{}.{}", instance, queue, Uuid::new_v4()),
            prefetch: settings.prefetch,
            no_ack: settings.ack_mode == AckMode::Auto,
        };

        let pump = tokio::spawn(pump(
            broker,
            spec,
            work_tx,
            shared.clone(),
            settings.recovery_interval,
        ));

        ListenerContainer {
            queue: queue.to_owned(),
            shutdown: shutdown_tx,
            pump,
            shared,
            shutdown_timeout: settings.shutdown_timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stops new deliveries and waits up to the shutdown timeout for workers.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);

        if let Err(err) = self.pump.await {
            error!(queue = self.queue, error = err.to_string(), "listener pump failed");
        }

        let handles = match self.shared.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(self.shutdown_timeout, join_all(handles))
            .await
            .is_err()
        {
            warn!(
                queue = self.queue,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "handlers still running after shutdown timeout, aborting"
            );
            aborts.iter().for_each(|abort| abort.abort());
        }

        debug!(queue = self.queue, "listener stopped");
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    shared.active.fetch_add(1, Ordering::SeqCst);
    let handle = tokio::spawn(worker(shared.clone()));

    if let Ok(mut workers) = shared.workers.lock() {
        workers.retain(|handle| !handle.is_finished());
        workers.push(handle);
    }
}

/// Adds a worker when all of them are busy and the ceiling is not reached.
fn grow(shared: &Arc<Shared>) {
    let active = shared.active.load(Ordering::SeqCst);

    if active < shared.max_workers && shared.busy.load(Ordering::SeqCst) >= active {
        debug!(queue = shared.queue, workers = active + 1, "adding worker");
        spawn_worker(shared);
    }
}

/// Retires the calling worker if the pool is above its floor.
fn try_retire(shared: &Shared) -> bool {
    shared
        .active
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
            (active > shared.min_workers).then(|| active - 1)
        })
        .is_ok()
}

async fn worker(shared: Arc<Shared>) {
    let tracer = global::tracer("amqp consumer");

    loop {
        let surplus = shared.active.load(Ordering::SeqCst) > shared.min_workers;

        let next = if surplus {
            let wait = async { shared.work.lock().await.recv().await };

            match tokio::time::timeout(shared.idle_timeout, wait).await {
                Ok(next) => next,
                Err(_) => {
                    if try_retire(&shared) {
                        debug!(queue = shared.queue, "idle worker retired");
                        return;
                    }
                    continue;
                }
            }
        } else {
            shared.work.lock().await.recv().await
        };

        let Some(delivery) = next else {
            break;
        };

        if *shared.shutdown.borrow() {
            requeue(&delivery, shared.ack_mode).await;
            continue;
        }

        shared.busy.fetch_add(1, Ordering::SeqCst);

        let consumed = consume(
            &tracer,
            &delivery,
            &shared.handler,
            &shared.backoff,
            shared.ack_mode,
        )
        .await;

        if let Err(err) = consumed {
            error!(
                instance = shared.instance,
                queue = shared.queue,
                error = err.to_string(),
                "error consume msg"
            );
        }

        shared.busy.fetch_sub(1, Ordering::SeqCst);
    }

    shared.active.fetch_sub(1, Ordering::SeqCst);
}

async fn pump(
    broker: Arc<dyn Broker>,
    spec: SubscriptionSpec,
    work: mpsc::Sender<InboundDelivery>,
    shared: Arc<Shared>,
    recovery_interval: Duration,
) {
    let mut shutdown = shared.shutdown.clone();

    'subscribe: loop {
        if *shutdown.borrow() {
            break;
        }

        match broker.subscribe(&spec).await {
            Ok(mut subscription) => {
                debug!(queue = spec.queue, consumer_tag = spec.consumer_tag, "consuming");

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if let Err(err) = subscription.cancel().await {
                                warn!(
                                    queue = spec.queue,
                                    error = err.to_string(),
                                    "failure to cancel consumer"
                                );
                            }
                            break 'subscribe;
                        }
                        next = subscription.next() => match next {
                            Some(Ok(delivery)) => {
                                grow(&shared);

                                tokio::select! {
                                    permit = work.reserve() => match permit {
                                        Ok(permit) => permit.send(delivery),
                                        Err(_) => break 'subscribe,
                                    },
                                    _ = shutdown.changed() => {
                                        requeue(&delivery, shared.ack_mode).await;
                                        if let Err(err) = subscription.cancel().await {
                                            warn!(
                                                queue = spec.queue,
                                                error = err.to_string(),
                                                "failure to cancel consumer"
                                            );
                                        }
                                        break 'subscribe;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                error!(
                                    queue = spec.queue,
                                    error = err.to_string(),
                                    "errors consume msg"
                                );
                            }
                            None => {
                                warn!(queue = spec.queue, "subscription closed by broker");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    queue = spec.queue,
                    error = err.to_string(),
                    retry_in_ms = recovery_interval.as_millis() as u64,
                    "queue unavailable, retrying subscription"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(recovery_interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!(queue = spec.queue, "pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBroker,
        config::QueueDecl,
        handler::{handler_fn, Disposition},
        topology::build_declarables,
    };
    use std::collections::BTreeMap;

    fn declarables(dead_lettered: bool) -> Arc<Declarables> {
        let mut queues = BTreeMap::new();
        queues.insert(
            "orders.q".to_owned(),
            QueueDecl {
                dead_letter_exchange: dead_lettered.then(|| "orders.dlx".to_owned()),
                ..QueueDecl::default()
            },
        );

        Arc::new(build_declarables(&BTreeMap::new(), &queues, &BTreeMap::new()).unwrap())
    }

    fn settings(require_dead_letter: bool) -> ListenerSettings {
        ListenerSettings::from_config(&ConsumerConfig {
            require_dead_letter,
            ..ConsumerConfig::default()
        })
    }

    #[test]
    fn settings_are_normalized() {
        let settings = ListenerSettings::from_config(&ConsumerConfig {
            concurrency: 0,
            max_concurrency: 0,
            prefetch: 0,
            ..ConsumerConfig::default()
        });

        assert_eq!(settings.min_workers, 1);
        assert_eq!(settings.max_workers, 1);
        assert_eq!(settings.prefetch, 1);
        assert_eq!(settings.recovery_interval, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn missing_dead_letter_is_refused_when_required() {
        let dispatcher = ConsumerDispatcher::new(
            "default",
            Arc::new(MockBroker::new()),
            declarables(false),
            settings(true),
        );

        let handler = handler_fn(|_msg| async { Ok(Disposition::Ack) });

        assert_eq!(
            dispatcher.register("orders.q", handler),
            Err(AmqpError::MissingDeadLetter("orders.q".to_owned()))
        );
        assert_eq!(dispatcher.listeners(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_queue_is_retried_until_shutdown() {
        let mut broker = MockBroker::new();
        broker
            .expect_subscribe()
            .times(2..)
            .returning(|_| Err(AmqpError::ConsumerDeclarationError("orders.q".to_owned())));

        let dispatcher = ConsumerDispatcher::new(
            "default",
            Arc::new(broker),
            declarables(true),
            settings(true),
        );
        let handler = handler_fn(|_msg| async { Ok(Disposition::Ack) });

        dispatcher.register("orders.q", handler).unwrap();
        tokio::time::sleep(Duration::from_millis(5500)).await;

        dispatcher.shutdown().await;

        assert_eq!(dispatcher.listeners(), 0);
        assert!(dispatcher
            .register("orders.q", handler_fn(|_msg| async { Ok(Disposition::Ack) }))
            .is_err());
    }
}
