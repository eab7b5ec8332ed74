// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and caching of AMQP channels. Publishing
//! channels are kept in a small pool shared by every publisher of an instance;
//! a channel found closed on checkout is dropped and replaced.

use crate::errors::AmqpError;
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel, Connection,
};
use std::sync::Mutex;
use tracing::{debug, error};

/// Opens a channel on `conn`, in confirm mode when `confirm` is set.
pub(crate) async fn new_amqp_channel(
    conn: &Connection,
    confirm: bool,
) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");

    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }?;

    if confirm {
        if let Err(err) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
    }

    debug!(id = channel.id(), confirm, "channel created");
    Ok(channel)
}

/// Opens a consumer channel with its prefetch window applied.
pub(crate) async fn new_consumer_channel(
    conn: &Connection,
    prefetch: u16,
) -> Result<Channel, AmqpError> {
    let channel = new_amqp_channel(conn, false).await?;

    match channel.basic_qos(prefetch, BasicQosOptions { global: false }).await {
        Err(err) => {
            error!(error = err.to_string(), prefetch, "failure to configure qos");
            Err(AmqpError::QoSDeclarationError(err.to_string()))
        }
        _ => Ok(channel),
    }
}

/// Cache of publishing channels, safe for concurrent checkout and return.
pub struct ChannelPool {
    capacity: usize,
    confirm: bool,
    idle: Mutex<Vec<Channel>>,
}

impl ChannelPool {
    /// Creates a pool holding at most `max(1, capacity)` idle channels.
    pub fn new(capacity: usize, confirm: bool) -> ChannelPool {
        ChannelPool {
            capacity: capacity.max(1),
            confirm,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes an open channel from the cache, or opens one on `conn`.
    pub async fn checkout(&self, conn: &Connection) -> Result<Channel, AmqpError> {
        loop {
            let cached = self
                .idle
                .lock()
                .map_err(|_| AmqpError::InternalError("channel pool lock poisoned".to_owned()))?
                .pop();

            match cached {
                Some(channel) if channel.status().connected() => return Ok(channel),
                Some(channel) => debug!(id = channel.id(), "discarding closed channel"),
                None => break,
            }
        }

        new_amqp_channel(conn, self.confirm).await
    }

    /// Returns a channel to the cache. Closed channels and overflow are dropped.
    pub fn checkin(&self, channel: Channel) {
        if !channel.status().connected() {
            return;
        }

        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.capacity {
                idle.push(channel);
            }
        }
    }

    /// Drops every cached channel.
    pub fn clear(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.clear();
        }
    }
}
