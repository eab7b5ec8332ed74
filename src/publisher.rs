// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The publish channel of one instance: hands messages to the broker with the
//! instance's mandatory and confirm flags and leaves the verdict to
//! [`DeliveryGuarantees`].

use crate::{
    broker::{Broker, OutboundMessage},
    delivery::{DeliveryGuarantees, DeliveryReport},
    errors::AmqpError,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Publisher bound to one broker instance.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    broker: Arc<dyn Broker>,
    guarantees: DeliveryGuarantees,
}

impl RabbitMQPublisher {
    /// Creates a publisher over `broker` using already configured guarantees.
    pub fn new(broker: Arc<dyn Broker>, guarantees: DeliveryGuarantees) -> RabbitMQPublisher {
        RabbitMQPublisher { broker, guarantees }
    }

    pub fn instance(&self) -> &str {
        self.guarantees.instance()
    }

    pub fn guarantees(&self) -> &DeliveryGuarantees {
        &self.guarantees
    }

    /// Publishes `message`.
    ///
    /// Returns once the broker has the message. Confirms and returns are
    /// reported later through the callbacks and, when given, `receipt`.
    pub async fn publish(
        &self,
        message: OutboundMessage,
        receipt: Option<oneshot::Sender<DeliveryReport>>,
    ) -> Result<(), AmqpError> {
        let correlation_id = message.correlation_id.clone().unwrap_or_default();
        let message_id = message.message_id.clone();

        let pending = match self
            .broker
            .publish(message, self.guarantees.publish_options())
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                error!(
                    instance = self.instance(),
                    message_id = message_id,
                    error = err.to_string(),
                    "error publishing message"
                );
                return Err(err);
            }
        };

        debug!(instance = self.instance(), message_id = message_id, "message published");
        self.guarantees.track(correlation_id, pending, receipt);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Confirmation, MockBroker, PublishOptions, PublishOutcome},
        config::PublisherConfig,
    };

    fn guarantees(cfg: &PublisherConfig) -> DeliveryGuarantees {
        let mut guarantees = DeliveryGuarantees::new("orders");
        guarantees.configure(cfg, "orders");
        guarantees
    }

    #[tokio::test]
    async fn publishes_with_instance_flags() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|message, options| {
                message.routing_key == "order.created"
                    && *options
                        == PublishOptions {
                            mandatory: true,
                            confirm: true,
                        }
            })
            .times(1)
            .returning(|_, _| {
                Ok(Box::pin(async {
                    PublishOutcome {
                        confirmation: Confirmation::Ack,
                        returned: None,
                    }
                }))
            });

        let publisher =
            RabbitMQPublisher::new(Arc::new(broker), guarantees(&PublisherConfig::default()));
        let (receipt, tx) = DeliveryGuarantees::receipt("c-1");
        let message = OutboundMessage {
            exchange: "orders.topic".to_owned(),
            routing_key: "order.created".to_owned(),
            correlation_id: Some("c-1".to_owned()),
            ..OutboundMessage::default()
        };

        publisher.publish(message, Some(tx)).await.unwrap();

        assert!(receipt.wait().await.unwrap().is_ack());
    }

    #[tokio::test]
    async fn hand_off_failure_is_returned() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .returning(|_, _| Err(AmqpError::ConnectionError("connection reset".to_owned())));

        let publisher =
            RabbitMQPublisher::new(Arc::new(broker), guarantees(&PublisherConfig::default()));

        let err = publisher
            .publish(OutboundMessage::default(), None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
    }
}
