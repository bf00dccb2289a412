// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! Applies the configured exchanges, queues and bindings to the default
//! channel. Declarations use declare-if-absent semantics, so the supervisor
//! replays the same installation after every reconnect without tracking what
//! already exists.

use crate::{
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueConflictPolicy, QueueDefinition},
};
use lapin::{
    options::{
        ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    Channel,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Converts JSON-typed broker arguments into an AMQP field table.
pub(crate) fn field_table(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in arguments {
        let amqp_value = match value {
            Value::Bool(v) => AMQPValue::Boolean(*v),
            Value::Number(v) if v.is_i64() => AMQPValue::LongLongInt(v.as_i64().unwrap_or_default()),
            Value::Number(v) => AMQPValue::Double(v.as_f64().unwrap_or_default()),
            Value::String(v) => AMQPValue::LongString(v.clone().into()),
            other => {
                warn!(key = key.as_str(), "unsupported broker argument type, coercing to string");
                AMQPValue::LongString(other.to_string().into())
            }
        };

        table.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(table)
}

/// Declares a queue, applying the conflict policy when the broker rejects a
/// declare whose arguments mismatch an existing queue.
///
/// Returns the effective queue name, which the broker generates when `name`
/// is empty.
pub(crate) async fn declare_queue(
    channel: &Channel,
    name: &str,
    options: QueueDeclareOptions,
    arguments: FieldTable,
    conflict_policy: QueueConflictPolicy,
) -> Result<String, AmqpError> {
    match channel
        .queue_declare(name, options, arguments.clone())
        .await
    {
        Ok(queue) => Ok(queue.name().to_string()),
        Err(err) if options.passive => {
            error!(error = err.to_string(), queue = name, "queue check failed");
            Err(AmqpError::DeclareQueueError(name.to_owned()))
        }
        Err(err) => match conflict_policy {
            QueueConflictPolicy::Rethrow => {
                error!(error = err.to_string(), queue = name, "error declaring queue");
                Err(AmqpError::QueueAssertConflict(name.to_owned()))
            }
            QueueConflictPolicy::DeleteAndRecreate => {
                warn!(queue = name, "queue declare conflicted, deleting and re-declaring");

                channel
                    .queue_delete(name, QueueDeleteOptions::default())
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), queue = name, "error deleting queue");
                        AmqpError::DeclareQueueError(name.to_owned())
                    })?;

                match channel.queue_declare(name, options, arguments).await {
                    Ok(queue) => Ok(queue.name().to_string()),
                    Err(err) => {
                        error!(error = err.to_string(), queue = name, "re-declare failed");
                        Err(AmqpError::DeclareQueueError(name.to_owned()))
                    }
                }
            }
        },
    }
}

/// Installs the configured topology on one channel.
pub(crate) struct TopologyInstaller<'tp> {
    channel: &'tp Channel,
    config: &'tp AmqpConfig,
}

impl<'tp> TopologyInstaller<'tp> {
    pub(crate) fn new(channel: &'tp Channel, config: &'tp AmqpConfig) -> TopologyInstaller<'tp> {
        TopologyInstaller { channel, config }
    }

    /// Creates all exchanges and queues, then sets up all bindings.
    pub(crate) async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.bind_exchanges().await?;
        self.bind_queues().await
    }

    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for def in &self.config.exchanges {
            self.declare_exchange(def).await?;
            debug!(exchange = def.name.as_str(), "exchange declared");
        }

        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    passive: def.check_only,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                field_table(&def.params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error declaring exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.config.queues {
            self.declare_configured_queue(def).await?;
            debug!(queue = def.name.as_str(), "queue declared");
        }

        Ok(())
    }

    async fn declare_configured_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        declare_queue(
            self.channel,
            &def.name,
            QueueDeclareOptions {
                passive: def.check_only,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: false,
            },
            field_table(&def.arguments),
            def.conflict_policy,
        )
        .await
        .map(|_| ())
    }

    async fn bind_exchanges(&self) -> Result<(), AmqpError> {
        for binding in &self.config.exchange_bindings {
            debug!(
                source = binding.source.as_str(),
                destination = binding.destination.as_str(),
                routing_key = binding.routing_key.as_str(),
                "binding exchange to exchange"
            );

            self.channel
                .exchange_bind(
                    &binding.destination,
                    &binding.source,
                    &binding.routing_key,
                    ExchangeBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error binding exchange to exchange");
                    AmqpError::BindingExchangeToExchangeError(
                        binding.source.clone(),
                        binding.destination.clone(),
                    )
                })?;
        }

        Ok(())
    }

    async fn bind_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.config.queue_bindings {
            debug!(
                queue = binding.queue.as_str(),
                exchange = binding.exchange.as_str(),
                routing_key = binding.routing_key.as_str(),
                "binding queue to exchange"
            );

            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error binding queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange.clone(),
                        binding.queue.clone(),
                    )
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_table_maps_json_types_to_amqp_values() {
        let mut arguments = BTreeMap::new();
        arguments.insert("x-message-ttl".to_owned(), json!(60000));
        arguments.insert("x-queue-mode".to_owned(), json!("lazy"));
        arguments.insert("x-single-active-consumer".to_owned(), json!(true));

        let table = field_table(&arguments);
        let inner = table.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(60000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-queue-mode")),
            Some(&AMQPValue::LongString("lazy".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-single-active-consumer")),
            Some(&AMQPValue::Boolean(true))
        );
    }
}
