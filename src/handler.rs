// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The seam between the delivery pipeline and user code: the
//! [`ConsumerHandler`] trait, the decoded message passed to it, its response
//! contract and the per-registration options surface. Handlers are registered
//! explicitly through the connection manager; no runtime discovery is
//! involved.

use crate::{policy::ErrorBehavior, queue::QueueConflictPolicy};
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::AmqpError;

/// Payload handed to a handler after the codec ran.
///
/// `Raw` is only produced for registrations with `allow_non_json_messages`
/// when decoding failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Json(Value),
    Raw(Vec<u8>),
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct AmqpMessage {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Payload,
    pub redelivered: bool,
    pub headers: Option<FieldTable>,
    pub correlation_id: Option<String>,
}

/// Outcome returned by a handler.
///
/// Subscribe handlers are expected to return `Ack` or `Nack`; an RPC handler
/// returns `Reply` with the value published back to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerResponse {
    /// Processing succeeded, acknowledge the message
    Ack,
    /// Publish this value back to the requester, then acknowledge
    Reply(Value),
    /// Negative-acknowledge with the given requeue flag, skipping any reply
    Nack { requeue: bool },
}

/// User-supplied message processing logic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, msg: &AmqpMessage) -> Result<HandlerResponse, AmqpError>;
}

/// Broker-level options for the queue a handler consumes from.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Named channel to attach the consumer to; unknown names fall back to
    /// the default channel with a warning
    pub channel: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Broker queue arguments, e.g. `x-message-ttl`
    pub arguments: BTreeMap<String, Value>,
    /// Recovery applied when the declare conflicts with an existing queue
    pub conflict_policy: QueueConflictPolicy,
}

/// Per-registration options for subscribe and rpc consumers.
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// Exchange the queue is bound to; the empty exchange skips binding
    pub exchange: String,
    /// Routing key pattern(s) bound to the queue, and for rpc registrations
    /// the patterns inbound keys are validated against
    pub routing_keys: Vec<String>,
    /// Queue to consume from; empty lets the broker generate a name
    pub queue: String,
    pub queue_options: QueueOptions,
    /// Error policy override for this handler
    pub error_behavior: Option<ErrorBehavior>,
    /// Pass the raw payload through instead of failing when decoding fails
    pub allow_non_json_messages: bool,
    /// Assert the queue; `false` only checks that it already exists
    pub create_queue_if_not_exists: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        HandlerOptions {
            exchange: String::new(),
            routing_keys: vec![],
            queue: String::new(),
            queue_options: QueueOptions::default(),
            error_behavior: None,
            allow_non_json_messages: false,
            create_queue_if_not_exists: true,
        }
    }
}

impl HandlerOptions {
    /// Creates options consuming `queue` bound to `exchange` with one
    /// routing key pattern.
    pub fn new(exchange: &str, routing_key: &str, queue: &str) -> HandlerOptions {
        HandlerOptions {
            exchange: exchange.to_owned(),
            routing_keys: vec![routing_key.to_owned()],
            queue: queue.to_owned(),
            ..HandlerOptions::default()
        }
    }

    /// Adds an additional routing key pattern.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Attaches the consumer to a named channel.
    pub fn channel(mut self, name: &str) -> Self {
        self.queue_options.channel = Some(name.to_owned());
        self
    }

    /// Overrides the error policy for this handler.
    pub fn error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.error_behavior = Some(behavior);
        self
    }

    /// Passes raw payloads through when decoding fails.
    pub fn allow_non_json_messages(mut self) -> Self {
        self.allow_non_json_messages = true;
        self
    }

    /// Only checks that the queue exists instead of asserting it.
    pub fn existing_queue_only(mut self) -> Self {
        self.create_queue_if_not_exists = false;
        self
    }

    /// Sets the queue options wholesale.
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }
}
