// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Guarantees
//!
//! Confirm and return handling for one instance. The broker's verdict on every
//! published message arrives out of band: [`DeliveryGuarantees::track`] hands
//! the pending confirm to a background task which invokes the configured
//! callbacks exactly once and, if asked, answers a [`ConfirmReceipt`].
//!
//! Nacks and returns are never errors on the send path.

use crate::{
    broker::{Confirmation, PendingConfirm, PublishOptions, PublishOutcome, ReturnedMessage},
    config::PublisherConfig,
    errors::AmqpError,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Cause reported for a nack the broker sent without one.
pub const UNKNOWN_NACK_CAUSE: &str = "unknown";

/// Invoked once per confirmed publish.
///
/// `cause` is `None` on ack and never blank on nack.
pub trait ConfirmCallback: Send + Sync {
    fn confirmed(&self, correlation_id: &str, ack: bool, cause: Option<&str>);
}

/// Invoked for each mandatory message the broker could not route.
pub trait ReturnCallback: Send + Sync {
    fn returned(&self, message: &ReturnedMessage);
}

/// Application hook receiving confirm and return events next to the logs.
pub trait DeliveryObserver: Send + Sync {
    fn on_confirm(
        &self,
        _instance: &str,
        _correlation_id: &str,
        _ack: bool,
        _cause: Option<&str>,
    ) {
    }

    fn on_return(&self, _instance: &str, _message: &ReturnedMessage) {}
}

struct LoggingConfirmCallback {
    instance: String,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

impl ConfirmCallback for LoggingConfirmCallback {
    fn confirmed(&self, correlation_id: &str, ack: bool, cause: Option<&str>) {
        if ack {
            debug!(
                instance = self.instance,
                correlation_id = correlation_id,
                "message confirmed by broker"
            );
        } else {
            warn!(
                instance = self.instance,
                correlation_id = correlation_id,
                cause = cause.unwrap_or(UNKNOWN_NACK_CAUSE),
                "message not confirmed by broker"
            );
        }

        if let Some(observer) = &self.observer {
            observer.on_confirm(&self.instance, correlation_id, ack, cause);
        }
    }
}

struct LoggingReturnCallback {
    instance: String,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

impl ReturnCallback for LoggingReturnCallback {
    fn returned(&self, message: &ReturnedMessage) {
        warn!(
            instance = self.instance,
            reply_code = message.reply_code,
            reply_text = message.reply_text,
            exchange = message.exchange,
            routing_key = message.routing_key,
            message_id = message.message_id,
            "message returned by broker"
        );

        if let Some(observer) = &self.observer {
            observer.on_return(&self.instance, message);
        }
    }
}

/// What the broker said about one message, as seen by a caller holding a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub correlation_id: String,
    pub confirmation: Confirmation,
    pub returned: Option<ReturnedMessage>,
}

impl DeliveryReport {
    pub fn is_ack(&self) -> bool {
        self.confirmation == Confirmation::Ack
    }

    pub fn is_returned(&self) -> bool {
        self.returned.is_some()
    }
}

/// Awaitable handle on the broker's verdict for one message.
#[derive(Debug)]
pub struct ConfirmReceipt {
    correlation_id: String,
    rx: oneshot::Receiver<DeliveryReport>,
}

impl ConfirmReceipt {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the verdict.
    pub async fn wait(self) -> Result<DeliveryReport, AmqpError> {
        self.rx.await.map_err(|_| {
            AmqpError::InternalError(format!(
                "confirm for `{}` was dropped before completion",
                self.correlation_id
            ))
        })
    }
}

/// Per-instance confirm and return configuration.
#[derive(Clone, Default)]
pub struct DeliveryGuarantees {
    instance: String,
    mandatory: bool,
    confirm: Option<Arc<dyn ConfirmCallback>>,
    returns: Option<Arc<dyn ReturnCallback>>,
    observer: Option<Arc<dyn DeliveryObserver>>,
}

impl DeliveryGuarantees {
    pub fn new(instance: &str) -> DeliveryGuarantees {
        DeliveryGuarantees {
            instance: instance.to_owned(),
            ..DeliveryGuarantees::default()
        }
    }

    /// Adds an observer. Takes effect on the next [`configure`](Self::configure).
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Attaches or clears the callbacks according to `cfg`.
    ///
    /// Disabled confirms or returns leave no callback behind from an earlier
    /// configuration. Mandatory publishing mirrors `returns`.
    pub fn configure(&mut self, cfg: &PublisherConfig, instance: &str) {
        self.instance = instance.to_owned();
        self.mandatory = cfg.returns;

        self.confirm = if cfg.confirms {
            Some(Arc::new(LoggingConfirmCallback {
                instance: instance.to_owned(),
                observer: self.observer.clone(),
            }))
        } else {
            None
        };

        self.returns = if cfg.returns {
            Some(Arc::new(LoggingReturnCallback {
                instance: instance.to_owned(),
                observer: self.observer.clone(),
            }))
        } else {
            None
        };
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn confirms_enabled(&self) -> bool {
        self.confirm.is_some()
    }

    pub fn returns_enabled(&self) -> bool {
        self.returns.is_some()
    }

    pub fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            mandatory: self.mandatory,
            confirm: self.confirms_enabled(),
        }
    }

    /// Creates the receipt side of a confirm, to be passed to [`track`](Self::track).
    pub fn receipt(correlation_id: &str) -> (ConfirmReceipt, oneshot::Sender<DeliveryReport>) {
        let (tx, rx) = oneshot::channel();
        (
            ConfirmReceipt {
                correlation_id: correlation_id.to_owned(),
                rx,
            },
            tx,
        )
    }

    /// Waits for `pending` in the background and fires the callbacks once.
    ///
    /// Never blocks the caller.
    pub fn track(
        &self,
        correlation_id: String,
        pending: PendingConfirm,
        receipt: Option<oneshot::Sender<DeliveryReport>>,
    ) {
        let this = self.clone();

        tokio::spawn(async move {
            let outcome = pending.await;
            this.complete(&correlation_id, outcome, receipt);
        });
    }

    fn complete(
        &self,
        correlation_id: &str,
        outcome: PublishOutcome,
        receipt: Option<oneshot::Sender<DeliveryReport>>,
    ) {
        if let (Some(message), Some(callback)) = (&outcome.returned, &self.returns) {
            callback.returned(message);
        }

        let confirmation = match outcome.confirmation {
            Confirmation::Nack(cause) if cause.trim().is_empty() => {
                Confirmation::Nack(UNKNOWN_NACK_CAUSE.to_owned())
            }
            other => other,
        };

        if let Some(callback) = &self.confirm {
            match &confirmation {
                Confirmation::Ack => callback.confirmed(correlation_id, true, None),
                Confirmation::Nack(cause) => callback.confirmed(correlation_id, false, Some(cause)),
                Confirmation::NotRequested => {}
            }
        }

        if let Some(tx) = receipt {
            let _ = tx.send(DeliveryReport {
                correlation_id: correlation_id.to_owned(),
                confirmation,
                returned: outcome.returned,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        confirms: Mutex<Vec<(String, bool, Option<String>)>>,
        returns: Mutex<Vec<ReturnedMessage>>,
    }

    impl DeliveryObserver for Recorder {
        fn on_confirm(
            &self,
            _instance: &str,
            correlation_id: &str,
            ack: bool,
            cause: Option<&str>,
        ) {
            self.confirms.lock().unwrap().push((
                correlation_id.to_owned(),
                ack,
                cause.map(str::to_owned),
            ));
        }

        fn on_return(&self, _instance: &str, message: &ReturnedMessage) {
            self.returns.lock().unwrap().push(message.clone());
        }
    }

    fn guarantees(cfg: &PublisherConfig, recorder: Arc<Recorder>) -> DeliveryGuarantees {
        let mut guarantees = DeliveryGuarantees::new("orders").with_observer(recorder);
        guarantees.configure(cfg, "orders");
        guarantees
    }

    fn outcome(confirmation: Confirmation) -> PendingConfirm {
        Box::pin(async move {
            PublishOutcome {
                confirmation,
                returned: None,
            }
        })
    }

    #[tokio::test]
    async fn blank_nack_cause_becomes_unknown() {
        let recorder = Arc::new(Recorder::default());
        let guarantees = guarantees(&PublisherConfig::default(), recorder.clone());
        let (receipt, tx) = DeliveryGuarantees::receipt("c-1");

        guarantees.track("c-1".to_owned(), outcome(Confirmation::Nack(" ".to_owned())), Some(tx));
        let report = receipt.wait().await.unwrap();

        assert_eq!(report.confirmation, Confirmation::Nack("unknown".to_owned()));
        assert_eq!(
            *recorder.confirms.lock().unwrap(),
            vec![("c-1".to_owned(), false, Some("unknown".to_owned()))]
        );
    }

    #[tokio::test]
    async fn disabled_confirms_never_invoke_the_callback() {
        let recorder = Arc::new(Recorder::default());
        let cfg = PublisherConfig {
            confirms: false,
            returns: false,
            ..PublisherConfig::default()
        };
        let guarantees = guarantees(&cfg, recorder.clone());
        let (receipt, tx) = DeliveryGuarantees::receipt("");

        assert_eq!(guarantees.publish_options(), PublishOptions::default());

        guarantees.track(String::new(), outcome(Confirmation::Ack), Some(tx));
        receipt.wait().await.unwrap();

        assert!(recorder.confirms.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconfiguring_clears_callbacks() {
        let recorder = Arc::new(Recorder::default());
        let mut guarantees = guarantees(&PublisherConfig::default(), recorder);

        assert!(guarantees.confirms_enabled());
        assert!(guarantees.publish_options().mandatory);

        guarantees.configure(
            &PublisherConfig {
                confirms: false,
                returns: false,
                ..PublisherConfig::default()
            },
            "orders",
        );

        assert!(!guarantees.confirms_enabled());
        assert!(!guarantees.returns_enabled());
        assert!(!guarantees.publish_options().mandatory);
    }

    #[tokio::test]
    async fn returned_message_reaches_the_observer() {
        let recorder = Arc::new(Recorder::default());
        let guarantees = guarantees(&PublisherConfig::default(), recorder.clone());
        let (receipt, tx) = DeliveryGuarantees::receipt("c-2");
        let returned = ReturnedMessage {
            reply_code: 312,
            reply_text: "NO_ROUTE".to_owned(),
            exchange: "orders.topic".to_owned(),
            routing_key: "order.unmatched".to_owned(),
            message_id: "c-2".to_owned(),
        };

        let pending: PendingConfirm = {
            let returned = returned.clone();
            Box::pin(async move {
                PublishOutcome {
                    confirmation: Confirmation::Ack,
                    returned: Some(returned),
                }
            })
        };
        guarantees.track("c-2".to_owned(), pending, Some(tx));

        let report = receipt.wait().await.unwrap();
        assert!(report.is_ack());
        assert!(report.is_returned());
        assert_eq!(*recorder.returns.lock().unwrap(), vec![returned]);
    }
}
