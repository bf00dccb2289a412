// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Connection Layer
//!
//! This module provides the error taxonomy for every operation exposed by the
//! connection manager: connection establishment, channel access, topology
//! declaration, publishing, consuming and the request/reply path.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level failures are retried transparently by the connection
/// supervisor and only surface through `init` when a bounded wait was
/// requested. Consumer-handler failures never carry this error out of the
/// delivery pipeline; they are funneled through the configured error policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The first `Ready` transition did not happen within the configured wait
    #[error("connection was not ready within {0:?}")]
    ConnectionTimeout(Duration),

    /// The raw connection was accessed before the manager reached `Ready`
    #[error("connection is not available")]
    ConnectionNotAvailable,

    /// A channel was accessed before the manager reached `Ready`
    #[error("channel `{0}` is not available")]
    ChannelNotAvailable(String),

    /// Invalid channel configuration, e.g. more than one default channel
    #[error("invalid channel configuration: {0}")]
    ChannelConfig(String),

    /// The broker URI does not use the `amqp` or `amqps` scheme
    #[error("invalid broker uri `{0}`: expected amqp:// or amqps:// scheme")]
    UriScheme(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// The broker rejected a queue declare whose arguments mismatch an
    /// existing queue
    #[error("queue `{0}` already exists with conflicting arguments")]
    QueueAssertConflict(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding an exchange to an exchange
    #[error("failure to bind exchange `{0}` to exchange `{1}`")]
    BindingExchangeToExchangeError(String, String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on queue `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// No consumer is registered under the given tag
    #[error("unknown consumer tag `{0}`")]
    UnknownConsumerTag(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// An RPC request received no reply within its timeout
    #[error("rpc request timed out after {timeout:?} (exchange `{exchange}`, routing key `{routing_key}`)")]
    RpcTimeout {
        timeout: Duration,
        exchange: String,
        routing_key: String,
    },

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Defensive guard: the broker handed the consumer an empty delivery
    #[error("null message received")]
    NullMessage,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos on channel `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing a channel
    #[error("failure to close channel `{0}`")]
    CloseChannelError(String),
}
