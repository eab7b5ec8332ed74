// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` owns the AMQP connection of one instance and implements
//! [`Broker`] over it. The connection is established eagerly, tagged with the
//! instance name and re-established lazily when found closed. Configured
//! addresses are tried in order.

use crate::{
    broker::{
        Acknowledger, Broker, Confirmation, Connector, InboundDelivery, OutboundMessage,
        PendingConfirm, PublishOptions, PublishOutcome, ReturnedMessage, Subscription,
        SubscriptionSpec,
    },
    channel::{new_amqp_channel, new_consumer_channel, ChannelPool},
    config::{Address, ConnectionConfig, InstanceConfig},
    errors::AmqpError,
    message::{arguments_to_field_table, field_table_to_headers, headers_to_field_table},
    queue::DestinationType,
    topology::{Declarable, DeclareOutcome},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::{BasicReturnMessage, Delivery},
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm,
    types::{FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// lapin-backed broker of one named instance.
pub struct ConnectionManager {
    name: String,
    cfg: ConnectionConfig,
    pool: ChannelPool,
    connection: RwLock<Option<Arc<Connection>>>,
    reconnect: Mutex<()>,
    admin: Mutex<Option<Channel>>,
}

impl ConnectionManager {
    /// Connects the instance `name` and prepares its channel cache.
    ///
    /// The cache holds as many channels as the listener pool has workers at
    /// most. Publishing channels run in confirm mode when confirms or returns
    /// are enabled.
    pub async fn connect(
        name: &str,
        cfg: &InstanceConfig,
    ) -> Result<ConnectionManager, AmqpError> {
        cfg.connection.validate()?;

        let manager = ConnectionManager {
            name: name.to_owned(),
            cfg: cfg.connection.clone(),
            pool: ChannelPool::new(
                channel_cache_size(cfg),
                cfg.publisher.confirms || cfg.publisher.returns,
            ),
            connection: RwLock::new(None),
            reconnect: Mutex::new(()),
            admin: Mutex::new(None),
        };

        manager.connection().await?;

        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The open connection, re-established if it was lost.
    async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let _guard = self.reconnect.lock().await;

        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let conn = Arc::new(self.establish().await?);
        self.pool.clear();

        let mut slot = self
            .connection
            .write()
            .map_err(|_| AmqpError::InternalError("connection lock poisoned".to_owned()))?;
        *slot = Some(conn.clone());

        Ok(conn)
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .filter(|conn| conn.status().connected())
    }

    async fn establish(&self) -> Result<Connection, AmqpError> {
        let addresses = self.cfg.parsed_addresses()?;
        let mut last_error = String::new();

        for address in &addresses {
            debug!(
                instance = self.name,
                address = address.to_string(),
                "creating amqp connection..."
            );

            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(connection_name(&self.name)));

            match Connection::connect_uri(amqp_uri(address, &self.cfg), options).await {
                Ok(conn) => {
                    info!(instance = self.name, address = address.to_string(), "amqp connected");
                    return Ok(conn);
                }
                Err(err) => {
                    let cause = err.to_string();

                    if self.cfg.ssl_enabled && is_tls_failure(&cause) {
                        error!(instance = self.name, error = cause, "failure to negotiate tls");
                        return Err(AmqpError::TlsError {
                            instance: self.name.clone(),
                            cause,
                        });
                    }

                    warn!(
                        instance = self.name,
                        address = address.to_string(),
                        error = cause,
                        "failure to connect, trying next address"
                    );
                    last_error = cause;
                }
            }
        }

        error!(instance = self.name, error = last_error, "failure to connect");
        Err(AmqpError::ConnectionError(last_error))
    }

    /// Channel used for topology declarations, reopened after a channel-level error.
    async fn admin_channel(&self) -> Result<Channel, AmqpError> {
        let mut admin = self.admin.lock().await;

        if let Some(channel) = admin.as_ref().filter(|channel| channel.status().connected()) {
            return Ok(channel.clone());
        }

        let conn = self.connection().await?;
        let channel = new_amqp_channel(&conn, false).await?;
        *admin = Some(channel.clone());

        Ok(channel)
    }
}

#[async_trait]
impl Broker for ConnectionManager {
    async fn declare(&self, item: &Declarable) -> DeclareOutcome {
        let channel = match self.admin_channel().await {
            Ok(channel) => channel,
            Err(err) => return DeclareOutcome::TransientFailure(err.to_string()),
        };

        let result = match item {
            Declarable::Exchange(def) => {
                channel
                    .exchange_declare(
                        def.name(),
                        def.lapin_kind(),
                        ExchangeDeclareOptions {
                            passive: false,
                            durable: def.is_durable(),
                            auto_delete: def.is_auto_delete(),
                            internal: def.is_internal(),
                            nowait: false,
                        },
                        arguments_to_field_table(def.arguments()),
                    )
                    .await
            }
            Declarable::Queue(def) => channel
                .queue_declare(
                    def.name(),
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.is_durable(),
                        exclusive: def.is_exclusive(),
                        auto_delete: def.is_auto_delete(),
                        nowait: false,
                    },
                    arguments_to_field_table(def.arguments()),
                )
                .await
                .map(|_| ()),
            Declarable::Binding(def) => match def.destination_type() {
                DestinationType::Queue => {
                    channel
                        .queue_bind(
                            def.destination(),
                            def.source(),
                            def.key(),
                            QueueBindOptions { nowait: false },
                            arguments_to_field_table(def.arguments()),
                        )
                        .await
                }
                DestinationType::Exchange => {
                    channel
                        .exchange_bind(
                            def.destination(),
                            def.source(),
                            def.key(),
                            ExchangeBindOptions { nowait: false },
                            arguments_to_field_table(def.arguments()),
                        )
                        .await
                }
            },
        };

        match result {
            Ok(()) => DeclareOutcome::Declared,
            Err(err) => declare_outcome(&err),
        }
    }

    async fn publish(
        &self,
        message: OutboundMessage,
        options: PublishOptions,
    ) -> Result<PendingConfirm, AmqpError> {
        let conn = self.connection().await?;
        let channel = self.pool.checkout(&conn).await?;

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_message_id(ShortString::from(message.message_id.as_str()))
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_headers(headers_to_field_table(&message.headers));

        if let Some(correlation_id) = &message.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }

        let published = channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: false,
                },
                &message.payload,
                properties,
            )
            .await;

        let confirm = match published {
            Ok(confirm) => {
                self.pool.checkin(channel);
                confirm
            }
            Err(err) => {
                error!(instance = self.name, error = err.to_string(), "error publishing message");
                return Err(AmqpError::PublishingError(err.to_string()));
            }
        };

        Ok(Box::pin(async move {
            let outcome = confirm.await;
            publish_outcome(outcome, options.confirm)
        }))
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Box<dyn Subscription>, AmqpError> {
        let conn = self.connection().await?;
        let channel = new_consumer_channel(&conn, spec.prefetch).await?;

        let consumer = match channel
            .basic_consume(
                &spec.queue,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: spec.no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    queue = spec.queue,
                    error = err.to_string(),
                    "failure to create the consumer"
                );
                Err(AmqpError::ConsumerDeclarationError(spec.queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(Box::new(LapinSubscription {
            queue: spec.queue.clone(),
            consumer_tag: spec.consumer_tag.clone(),
            channel,
            consumer,
        }))
    }

    fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.pool.clear();

        let conn = self
            .connection
            .write()
            .map_err(|_| AmqpError::InternalError("connection lock poisoned".to_owned()))?
            .take();

        if let Some(conn) = conn {
            info!(instance = self.name, "closing amqp connection");
            conn.close(200, "shutdown")
                .await
                .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        }

        Ok(())
    }
}

struct LapinSubscription {
    queue: String,
    consumer_tag: String,
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl Subscription for LapinSubscription {
    async fn next(&mut self) -> Option<Result<InboundDelivery, AmqpError>> {
        let result = self.consumer.next().await?;

        Some(match result {
            Ok(delivery) => Ok(inbound_delivery(&self.queue, delivery)),
            Err(err) => {
                error!(queue = self.queue, error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        })
    }

    async fn cancel(&mut self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn inbound_delivery(queue: &str, delivery: Delivery) -> InboundDelivery {
    let properties = &delivery.properties;

    InboundDelivery {
        queue: queue.to_owned(),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        message_id: properties.message_id().as_ref().map(ToString::to_string),
        correlation_id: properties.correlation_id().as_ref().map(ToString::to_string),
        headers: properties
            .headers()
            .as_ref()
            .map(field_table_to_headers)
            .unwrap_or_default(),
        payload: delivery.data,
        acker: Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

/// Opens lapin brokers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        name: &str,
        cfg: &InstanceConfig,
    ) -> Result<Arc<dyn Broker>, AmqpError> {
        Ok(Arc::new(ConnectionManager::connect(name, cfg).await?))
    }
}

/// Normalized worker ceiling of the listener pool, so every worker can hold a channel.
pub(crate) fn channel_cache_size(cfg: &InstanceConfig) -> usize {
    cfg.consumer.concurrency_bounds().1
}

pub(crate) fn connection_name(instance: &str) -> String {
    format!("rabbitmq:{}", instance)
}

pub(crate) fn amqp_uri(address: &Address, cfg: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: if cfg.ssl_enabled {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            host: address.host.clone(),
            port: address.port,
        },
        vhost: cfg.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(cfg.requested_heartbeat),
            ..AMQPQueryString::default()
        },
    }
}

fn is_tls_failure(cause: &str) -> bool {
    let cause = cause.to_ascii_lowercase();
    ["tls", "ssl", "certificate", "handshake"]
        .iter()
        .any(|marker| cause.contains(marker))
}

/// Soft errors caused by the declaration itself are conflicts, the rest is transient.
fn declare_outcome(err: &lapin::Error) -> DeclareOutcome {
    if let lapin::Error::ProtocolError(amqp) = err {
        if let AMQPErrorKind::Soft(
            AMQPSoftError::PRECONDITIONFAILED
            | AMQPSoftError::NOTFOUND
            | AMQPSoftError::ACCESSREFUSED
            | AMQPSoftError::RESOURCELOCKED,
        ) = amqp.kind()
        {
            return DeclareOutcome::Conflict(amqp.to_string());
        }
    }

    DeclareOutcome::TransientFailure(err.to_string())
}

fn publish_outcome(
    outcome: Result<publisher_confirm::Confirmation, lapin::Error>,
    confirm_requested: bool,
) -> PublishOutcome {
    let requested = |confirmation: Confirmation| {
        if confirm_requested {
            confirmation
        } else {
            Confirmation::NotRequested
        }
    };

    match outcome {
        Ok(publisher_confirm::Confirmation::Ack(returned)) => PublishOutcome {
            confirmation: requested(Confirmation::Ack),
            returned: returned.map(|message| returned_message(*message)),
        },
        Ok(publisher_confirm::Confirmation::Nack(returned)) => PublishOutcome {
            confirmation: requested(Confirmation::Nack(String::new())),
            returned: returned.map(|message| returned_message(*message)),
        },
        Ok(publisher_confirm::Confirmation::NotRequested) => PublishOutcome {
            confirmation: Confirmation::NotRequested,
            returned: None,
        },
        Err(err) => PublishOutcome {
            confirmation: requested(Confirmation::Nack(err.to_string())),
            returned: None,
        },
    }
}

fn returned_message(message: BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage {
        reply_code: message.reply_code,
        reply_text: message.reply_text.to_string(),
        exchange: message.delivery.exchange.to_string(),
        routing_key: message.delivery.routing_key.to_string(),
        message_id: message
            .delivery
            .properties
            .message_id()
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
    }
}
