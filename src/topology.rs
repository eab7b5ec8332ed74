// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module turns the exchange, queue and binding maps of an instance into an
//! ordered list of [`Declarable`]s and declares them against a broker.
//!
//! The main components are:
//! - `build_declarables`: pure transform, fails fast on unsupported types
//! - `Declarables`: the ordered list, exchanges first, then queues, then bindings
//! - `DeclareOutcome`: what the broker answered for a single declaration
//! - `declare_topology`: three filtered passes over the list, one declare call per item

use crate::{
    broker::Broker,
    config::{BindingDecl, ExchangeDecl, QueueDecl},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{BindingDefinition, QueueDefinition},
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// A single broker-side object to declare.
#[derive(Debug, Clone, PartialEq)]
pub enum Declarable {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(BindingDefinition),
}

impl Declarable {
    /// Kind label used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Declarable::Exchange(_) => "exchange",
            Declarable::Queue(_) => "queue",
            Declarable::Binding(_) => "binding",
        }
    }

    /// Name used in logs and errors. Bindings are rendered as `source -> destination`.
    pub fn name(&self) -> String {
        match self {
            Declarable::Exchange(def) => def.name().to_owned(),
            Declarable::Queue(def) => def.name().to_owned(),
            Declarable::Binding(def) => format!("{} -> {}", def.source(), def.destination()),
        }
    }
}

/// Broker answer to one declaration.
///
/// Only `Conflict` means the configuration is wrong; `TransientFailure`
/// means the broker could not be asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// Created, or already present with identical settings.
    Declared,
    Conflict(String),
    TransientFailure(String),
}

/// Ordered declarations of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarables {
    items: Vec<Declarable>,
}

impl Declarables {
    pub fn items(&self) -> &[Declarable] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &ExchangeDefinition> {
        self.items.iter().filter_map(|item| match item {
            Declarable::Exchange(def) => Some(def),
            _ => None,
        })
    }

    pub fn queues(&self) -> impl Iterator<Item = &QueueDefinition> {
        self.items.iter().filter_map(|item| match item {
            Declarable::Queue(def) => Some(def),
            _ => None,
        })
    }

    pub fn bindings(&self) -> impl Iterator<Item = &BindingDefinition> {
        self.items.iter().filter_map(|item| match item {
            Declarable::Binding(def) => Some(def),
            _ => None,
        })
    }

    /// Declared queue with the given name, if any.
    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues().find(|def| def.name() == name)
    }
}

/// Builds the ordered declaration list of an instance.
///
/// Every exchange precedes every queue, which precedes every binding,
/// whatever the iteration order of the input maps.
pub fn build_declarables(
    exchanges: &BTreeMap<String, ExchangeDecl>,
    queues: &BTreeMap<String, QueueDecl>,
    bindings: &BTreeMap<String, BindingDecl>,
) -> Result<Declarables, AmqpError> {
    let mut items = Vec::with_capacity(exchanges.len() + queues.len() + bindings.len());

    for (name, decl) in exchanges {
        items.push(Declarable::Exchange(ExchangeDefinition::from_decl(name, decl)?));
    }

    for (name, decl) in queues {
        items.push(Declarable::Queue(QueueDefinition::from_decl(name, decl)));
    }

    for decl in bindings.values() {
        items.push(Declarable::Binding(BindingDefinition::from_decl(decl)?));
    }

    Ok(Declarables { items })
}

/// Declares every item against the broker: exchanges, then queues, then bindings.
///
/// Stops at the first item the broker does not accept. A conflict becomes
/// `TopologyConflict`, an unreachable broker `TopologyUnavailable`.
pub async fn declare_topology(
    broker: &dyn Broker,
    declarables: &Declarables,
) -> Result<(), AmqpError> {
    let passes: [fn(&Declarable) -> bool; 3] = [
        |item| matches!(item, Declarable::Exchange(_)),
        |item| matches!(item, Declarable::Queue(_)),
        |item| matches!(item, Declarable::Binding(_)),
    ];

    for pass in passes {
        for item in declarables.items().iter().filter(|item| pass(item)) {
            debug!(kind = item.kind(), name = item.name(), "declaring");

            match broker.declare(item).await {
                DeclareOutcome::Declared => {}
                DeclareOutcome::Conflict(details) => {
                    error!(
                        kind = item.kind(),
                        name = item.name(),
                        details = details,
                        "conflicting declaration"
                    );
                    return Err(AmqpError::TopologyConflict {
                        kind: item.kind().to_owned(),
                        name: item.name(),
                        details,
                    });
                }
                DeclareOutcome::TransientFailure(cause) => {
                    error!(
                        kind = item.kind(),
                        name = item.name(),
                        error = cause,
                        "failure to declare"
                    );
                    return Err(AmqpError::TopologyUnavailable {
                        kind: item.kind().to_owned(),
                        name: item.name(),
                        cause,
                    });
                }
            }
        }
    }

    debug!(count = declarables.len(), "topology declared");

    Ok(())
}
