// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Instances
//!
//! Messaging layer over any number of independent RabbitMQ clusters in one
//! process. Each instance owns a connection, a declared topology, a publish
//! channel with confirms and returns, and a consumer dispatcher with bounded
//! retries and dead-lettering.
//!
//! Instances are built by [`InstanceRegistry`] from a [`MessagingConfig`]:
//!
//! ```no_run
//! use rabbitmq_instances::{InstanceRegistry, MessagingConfig};
//!
//! # async fn run() -> Result<(), rabbitmq_instances::AmqpError> {
//! let config = MessagingConfig::from_path("messaging.json")?;
//! let registry = InstanceRegistry::builder(config).start().await?;
//!
//! registry
//!     .default_instance()
//!     .facade()
//!     .send("orders.topic", "order.created", &serde_json::json!({"id": 1}), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod facade;
pub mod handler;
pub mod interceptor;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod topology;

pub use config::{MessagingConfig, DEFAULT_INSTANCE};
pub use errors::AmqpError;
pub use facade::MessagingFacade;
pub use handler::{handler_fn, ConsumerHandler, ConsumerMessage, Disposition, HandlerError};
pub use registry::{InstanceRegistry, MessagingInstance};
