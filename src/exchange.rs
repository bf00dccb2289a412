// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Declarative descriptions of exchanges and exchange-to-exchange bindings.
//! Definitions are owned data held by the connection configuration so the
//! topology can be replayed identically after every reconnect.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes messages to queues on an exact routing-key match
/// - Fanout: broadcasts messages to all bound queues
/// - Topic: routes messages on wildcard pattern matching of routing keys
/// - Headers: routes on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Builder-style struct. When `check_only` is set the exchange is declared
/// passively: its existence is verified without creating it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub delete: bool,
    pub internal: bool,
    pub check_only: bool,
    pub params: BTreeMap<String, serde_json::Value>,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            ..ExchangeDefinition::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Only checks that the exchange exists instead of asserting it.
    pub fn check_only(mut self) -> Self {
        self.check_only = true;
        self
    }

    /// Adds a single broker argument to the exchange.
    pub fn param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }
}

/// Configuration for binding an exchange to another exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeBinding {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
}

impl ExchangeBinding {
    /// Creates a binding routing messages from `source` into `destination`.
    pub fn new(source: &str, destination: &str, routing_key: &str) -> ExchangeBinding {
        ExchangeBinding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}
