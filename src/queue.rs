// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Declarative descriptions of queues and queue-to-exchange bindings, owned
//! by the connection configuration and replayed on every reconnect. Queue
//! declarations are idempotent on the broker side (declare-if-absent), so a
//! replay after reconnection is a no-op for surviving entities.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recovery applied when the broker rejects a queue declare because the
/// existing queue carries conflicting arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueConflictPolicy {
    /// Surface the conflict to the caller
    #[default]
    Rethrow,
    /// Delete the existing queue and declare it again with the new arguments
    DeleteAndRecreate,
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Builder-style struct. `check_only` declares passively, verifying the queue
/// exists without creating it; `arguments` carries broker queue arguments
/// such as `x-message-ttl` or `x-max-length`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub delete: bool,
    pub exclusive: bool,
    pub check_only: bool,
    pub conflict_policy: QueueConflictPolicy,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of asserting it.
    pub fn check_only(mut self) -> Self {
        self.check_only = true;
        self
    }

    /// Sets the recovery applied when the declare conflicts with an existing
    /// queue.
    pub fn conflict_policy(mut self, policy: QueueConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Adds a single broker queue argument.
    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a binding delivering `exchange` messages matching
    /// `routing_key` into `queue`.
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}
