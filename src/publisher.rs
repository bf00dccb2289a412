// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publishing
//!
//! Outbound message assembly shared by `publish`, `request` and the rpc
//! reply path: caller headers merged with the injected trace context, a
//! generated message id, the codec's content type, then `basic_publish` on
//! the resolved channel.

use crate::{codec::PayloadCodec, errors::AmqpError, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::collections::{BTreeMap, HashMap};
use tracing::error;
use uuid::Uuid;

/// Caller-facing header values, converted to AMQP types at publish time.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Uint(u32),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> HeaderValue {
        HeaderValue::String(value.to_owned())
    }
}

/// Converts caller headers into the AMQP header table.
pub(crate) fn amqp_headers(
    headers: &HashMap<String, HeaderValue>,
    table: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(v.clone().into()),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        };

        table.insert(ShortString::from(key.clone()), amqp_value);
    }
}

/// Builds the base properties for an outbound message: trace context and
/// caller headers, a fresh message id and the codec's content type.
pub(crate) fn outbound_properties(
    ctx: &Context,
    codec: &dyn PayloadCodec,
    headers: Option<&HashMap<String, HeaderValue>>,
) -> (BasicProperties, BTreeMap<ShortString, AMQPValue>) {
    let mut table = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject_context(ctx, &mut table);

    if let Some(headers) = headers {
        amqp_headers(headers, &mut table);
    }

    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(codec.content_type()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(table.clone()));

    (properties, table)
}

/// Publishes a prepared message body.
pub(crate) async fn publish_raw(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<(), AmqpError> {
    match channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            body,
            properties,
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange = exchange,
                routing_key = routing_key,
                "error publishing message"
            );
            Err(AmqpError::PublishingError)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_headers_convert_to_amqp_values() {
        let mut headers = HashMap::new();
        headers.insert("x-tenant".to_owned(), HeaderValue::from("acme"));
        headers.insert("x-attempt".to_owned(), HeaderValue::Int(3));
        headers.insert("x-priority".to_owned(), HeaderValue::Uint(7));
        headers.insert("x-replay".to_owned(), HeaderValue::Bool(true));

        let mut table = BTreeMap::new();
        amqp_headers(&headers, &mut table);

        assert_eq!(
            table.get(&ShortString::from("x-tenant")),
            Some(&AMQPValue::LongString("acme".into()))
        );
        assert_eq!(
            table.get(&ShortString::from("x-attempt")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            table.get(&ShortString::from("x-priority")),
            Some(&AMQPValue::LongUInt(7))
        );
        assert_eq!(
            table.get(&ShortString::from("x-replay")),
            Some(&AMQPValue::Boolean(true))
        );
    }
}
