// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Instance Registry
//!
//! Composition root of the messaging layer. [`InstanceRegistry::start`] wires
//! every configured instance in dependency order:
//!
//! 1. Validates the instance configuration and builds its declarables
//! 2. Connects to the broker through the [`Connector`]
//! 3. Declares the topology before the instance is considered ready
//! 4. Configures confirms and returns on the publish channel
//! 5. Wraps the publisher in a [`MessagingFacade`] carrying the shared interceptors
//! 6. Creates the [`ConsumerDispatcher`] for handler registration
//!
//! The implicit default instance must start; a named instance that fails is
//! recorded in [`InstanceRegistry::failures`] and left out of lookups.

use crate::{
    broker::{Broker, Connector},
    config::{InstanceConfig, MessagingConfig, DEFAULT_INSTANCE},
    connection::AmqpConnector,
    delivery::{DeliveryGuarantees, DeliveryObserver},
    dispatcher::{ConsumerDispatcher, ListenerSettings},
    errors::AmqpError,
    facade::MessagingFacade,
    handler::ConsumerHandler,
    interceptor::{Interceptors, SendInterceptor},
    publisher::RabbitMQPublisher,
    topology::{build_declarables, declare_topology, Declarables},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info, warn};

/// A fully wired broker instance.
pub struct MessagingInstance {
    name: String,
    broker: Arc<dyn Broker>,
    declarables: Arc<Declarables>,
    facade: MessagingFacade,
    dispatcher: ConsumerDispatcher,
}

impl MessagingInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn facade(&self) -> &MessagingFacade {
        &self.facade
    }

    pub fn dispatcher(&self) -> &ConsumerDispatcher {
        &self.dispatcher
    }

    pub fn declarables(&self) -> &Declarables {
        &self.declarables
    }

    /// Starts consuming `queue` on this instance.
    pub fn register(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        self.dispatcher.register(queue, handler)
    }

    /// True while the broker connection is open.
    pub fn is_healthy(&self) -> bool {
        self.broker.is_connected()
    }

    /// Stops the listeners, then closes the connection.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;

        if let Err(err) = self.broker.close().await {
            warn!(instance = self.name, error = err.to_string(), "failure to close connection");
        }

        info!(instance = self.name, "instance stopped");
    }
}

pub struct InstanceRegistryBuilder {
    config: MessagingConfig,
    connector: Arc<dyn Connector>,
    interceptors: Vec<Arc<dyn SendInterceptor>>,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

impl InstanceRegistryBuilder {
    /// Replaces the lapin connector, e.g. with an in-process broker.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Appends an interceptor. Interceptors run in insertion order.
    pub fn interceptor(mut self, interceptor: Arc<dyn SendInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptors(mut self, interceptors: Vec<Arc<dyn SendInterceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Starts every configured instance.
    ///
    /// Fails when the top-level configuration is invalid or the default
    /// instance cannot start.
    pub async fn start(self) -> Result<InstanceRegistry, AmqpError> {
        self.config.validate()?;

        let interceptors: Interceptors = Arc::new(self.interceptors.clone());

        let default = match self
            .start_instance(DEFAULT_INSTANCE, &self.config.default_instance(), &interceptors)
            .await
        {
            Ok(instance) => Arc::new(instance),
            Err(err) => {
                error!(
                    instance = DEFAULT_INSTANCE,
                    error = err.to_string(),
                    "failure to start default instance"
                );
                return Err(err);
            }
        };

        let mut named = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for (name, cfg) in &self.config.instances {
            match self.start_instance(name, cfg, &interceptors).await {
                Ok(instance) => {
                    named.insert(name.clone(), Arc::new(instance));
                }
                Err(err) => {
                    error!(instance = name, error = err.to_string(), "failure to start instance");
                    failures.insert(name.clone(), err);
                }
            }
        }

        info!(
            started = named.len() + 1,
            failed = failures.len(),
            "messaging instances started"
        );

        Ok(InstanceRegistry {
            default,
            named,
            failures,
        })
    }

    async fn start_instance(
        &self,
        name: &str,
        cfg: &InstanceConfig,
        interceptors: &Interceptors,
    ) -> Result<MessagingInstance, AmqpError> {
        cfg.validate(name)?;
        let declarables = Arc::new(build_declarables(&cfg.exchanges, &cfg.queues, &cfg.bindings)?);

        let broker = self.connector.connect(name, cfg).await?;

        if let Err(err) = declare_topology(broker.as_ref(), &declarables).await {
            if let Err(close_err) = broker.close().await {
                warn!(
                    instance = name,
                    error = close_err.to_string(),
                    "failure to close connection"
                );
            }
            return Err(err);
        }

        let mut guarantees = DeliveryGuarantees::new(name);
        if let Some(observer) = &self.observer {
            guarantees = guarantees.with_observer(observer.clone());
        }
        guarantees.configure(&cfg.publisher, name);

        let publisher = RabbitMQPublisher::new(broker.clone(), guarantees);
        let facade = MessagingFacade::new(publisher, interceptors.clone(), &cfg.publisher.retry);

        let settings = ListenerSettings::from_config(&cfg.consumer);
        let dispatcher =
            ConsumerDispatcher::new(name, broker.clone(), declarables.clone(), settings);

        info!(
            instance = name,
            addresses = cfg.connection.addresses.join(","),
            exchanges = declarables.exchanges().count(),
            queues = declarables.queues().count(),
            bindings = declarables.bindings().count(),
            confirms = cfg.publisher.confirms,
            returns = cfg.publisher.returns,
            ack_mode = cfg.consumer.acknowledge_mode.to_string(),
            "instance ready"
        );

        Ok(MessagingInstance {
            name: name.to_owned(),
            broker,
            declarables,
            facade,
            dispatcher,
        })
    }
}

/// Started instances, looked up by name.
pub struct InstanceRegistry {
    default: Arc<MessagingInstance>,
    named: BTreeMap<String, Arc<MessagingInstance>>,
    failures: BTreeMap<String, AmqpError>,
}

impl InstanceRegistry {
    pub fn builder(config: MessagingConfig) -> InstanceRegistryBuilder {
        InstanceRegistryBuilder {
            config,
            connector: Arc::new(AmqpConnector),
            interceptors: Vec::new(),
            observer: None,
        }
    }

    /// The implicit instance built from the top-level configuration.
    pub fn default_instance(&self) -> Arc<MessagingInstance> {
        self.default.clone()
    }

    /// Looks up a started instance. `None` means the name is not configured
    /// or the instance failed to start, which retrying will not change.
    pub fn get(&self, name: &str) -> Option<Arc<MessagingInstance>> {
        if name == DEFAULT_INSTANCE {
            return Some(self.default.clone());
        }

        self.named.get(name).cloned()
    }

    pub fn facade(&self, name: &str) -> Option<MessagingFacade> {
        self.get(name).map(|instance| instance.facade().clone())
    }

    /// Like [`get`](Self::get), turning an absent instance into a configuration error.
    pub fn require(&self, name: &str) -> Result<Arc<MessagingInstance>, AmqpError> {
        self.get(name)
            .ok_or_else(|| AmqpError::UnknownInstance(name.to_owned()))
    }

    /// Named instances that could not be started, with the reason.
    pub fn failures(&self) -> &BTreeMap<String, AmqpError> {
        &self.failures
    }

    /// Names of the started instances, default first.
    pub fn names(&self) -> Vec<&str> {
        std::iter::once(DEFAULT_INSTANCE)
            .chain(self.named.keys().map(String::as_str))
            .collect()
    }

    /// Stops every instance. Listeners stop before their connection closes.
    pub async fn shutdown(&self) {
        for instance in self.named.values() {
            instance.shutdown().await;
        }

        self.default.shutdown().await;
    }
}
